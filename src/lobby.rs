//! Session coordinator: owns the maze and phase clock, and drives the tick
//! loop over the registry.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::config::{ConfigSource, SessionConfig};
use crate::maze::Maze;
use crate::phase::{Phase, PhaseClock, StepLimits};
use crate::registry::{OctapodRegistry, PingSummary};
use crate::status::{render_status, StatusSink, TickReport};

/// Cloneable control surface for a running lobby.
#[derive(Debug, Clone)]
pub struct LobbyHandle {
    restart: mpsc::Sender<()>,
    shutdown: CancellationToken,
}

impl LobbyHandle {
    /// Ask for a fresh session. Returns `false` when a restart is already
    /// pending; bursts collapse into one.
    pub fn request_restart(&self) -> bool {
        let queued = self.restart.try_send(()).is_ok();
        info!(queued, "restart requested");
        queued
    }

    /// Stop the tick loop. Connected agents are left to their own teardown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once `shutdown` has been called.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }
}

/// What one tick did, for callers that drive ticks by hand.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub tick_id: String,
    pub solved: Vec<String>,
    pub pings: PingSummary,
    pub status: String,
}

pub struct Lobby {
    config: Arc<dyn ConfigSource>,
    registry: Arc<OctapodRegistry>,
    sink: Arc<dyn StatusSink>,
    settings: SessionConfig,
    maze: Maze,
    clock: PhaseClock,
    restart: mpsc::Receiver<()>,
    shutdown: CancellationToken,
}

impl Lobby {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        registry: Arc<OctapodRegistry>,
        sink: Arc<dyn StatusSink>,
    ) -> (Self, LobbyHandle) {
        let (restart_tx, restart_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let settings = SessionConfig::default();
        let mut lobby = Self {
            config,
            registry,
            sink,
            maze: Maze::new(settings.maze_width, settings.maze_height),
            clock: PhaseClock::new(StepLimits::from(&settings)),
            settings,
            restart: restart_rx,
            shutdown: shutdown.clone(),
        };
        lobby.setup();
        let handle = LobbyHandle {
            restart: restart_tx,
            shutdown,
        };
        (lobby, handle)
    }

    pub fn registry(&self) -> &Arc<OctapodRegistry> {
        &self.registry
    }

    pub fn maze(&self) -> &Maze {
        &self.maze
    }

    pub fn phase(&self) -> Phase {
        self.clock.phase()
    }

    pub fn step(&self) -> u32 {
        self.clock.step()
    }

    pub fn settings(&self) -> &SessionConfig {
        &self.settings
    }

    /// Read the config source and start a new session from it. An invalid
    /// config keeps the previous settings.
    fn setup(&mut self) {
        let next = self.config.session_config();
        match next.validate() {
            Ok(()) => self.settings = next,
            Err(e) => error!("keeping previous session config: {}", e),
        }
        let s = &self.settings;
        self.maze = Maze::generated(s.maze_width, s.maze_height, s.seed);
        self.clock = PhaseClock::new(StepLimits::from(s));
        self.registry.set_policy(s.outbound_queue, s.max_idle_ticks);
        self.registry.reset_all();
        info!(
            width = s.maze_width,
            height = s.maze_height,
            tick_ms = s.tick_interval_ms,
            exploring = s.max_exploration_steps,
            solving = s.max_solving_steps,
            "session started"
        );
    }

    fn ticker(&self) -> Interval {
        let period = self.settings.tick_interval();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// One tick: resolve moves, publish status, ping everyone for the next
    /// tick, count the step. Skipped while nobody is connected.
    pub fn tick(&mut self) -> Option<TickOutcome> {
        let agents = self.registry.active_count();
        if agents == 0 {
            trace!("no agents connected, tick skipped");
            return None;
        }

        let solved = self.registry.update_all(&self.maze);
        let positions = self.registry.positions();
        for (_, pos) in &positions {
            self.maze.visit(*pos);
        }

        let status = render_status(
            &TickReport {
                phase: self.clock.phase(),
                step: self.clock.step(),
                limit: self.clock.limit(),
                agents,
                solved: &solved,
            },
            &self.maze,
            &positions,
        );
        self.sink.publish(&status);

        let tick_id = Uuid::new_v4().to_string();
        let pings = self.registry.ping_all(&tick_id, self.clock.phase(), &self.maze);
        debug!(
            tick_id = %tick_id,
            pinged = pings.pinged,
            kicked = pings.kicked.len(),
            dropped = pings.dropped.len(),
            "tick"
        );

        if let Some(phase) = self.clock.advance() {
            info!(phase = phase.name(), "phase changed");
        }

        Some(TickOutcome {
            tick_id,
            solved,
            pings,
            status,
        })
    }

    /// Tick on a fixed period until shut down, servicing restarts between
    /// ticks.
    pub async fn run(mut self) {
        let mut ticker = self.ticker();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("lobby shutting down");
                    break;
                }
                Some(()) = self.restart.recv() => {
                    self.setup();
                    ticker = self.ticker();
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
    }
}
