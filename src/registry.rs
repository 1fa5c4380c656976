//! Membership of connected agents and the per-tick fan-out over them.
//!
//! The map lock only guards membership. Per-agent I/O never happens while it
//! is held: pings go through each agent's bounded outbound queue, and
//! connection tasks report their exit through a channel to a reaper task
//! instead of touching the map themselves.

use std::fmt::Display;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::{Sink, Stream};
use hashbrown::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::maze::Maze;
use crate::octapod::{read_loop, write_loop, Link, LoopExit, Octapod, PingError};
use crate::phase::Phase;
use crate::protocol::AgentStatus;
use crate::vector::Vector;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("Missing id")]
    MissingId,
    #[error("{0}")]
    InvalidId(String),
    #[error("Octapod {0} is already connected")]
    AlreadyConnected(String),
}

/// A refused join. The outbound half comes back so the caller can tell the
/// peer why before closing.
#[derive(Debug)]
pub struct Rejected<K> {
    pub error: JoinError,
    pub sink: K,
}

/// Sent by a connection task when it stops.
#[derive(Debug, Clone)]
pub struct Departure {
    pub id: String,
    pub epoch: u64,
    pub exit: LoopExit,
}

/// What one `ping_all` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingSummary {
    pub pinged: usize,
    /// Disconnected for inactivity, still registered.
    pub kicked: Vec<String>,
    /// Removed after a failed ping.
    pub dropped: Vec<String>,
}

#[derive(Debug)]
pub struct OctapodRegistry {
    octapods: Mutex<HashMap<String, Arc<Octapod>>>,
    departures: mpsc::UnboundedSender<Departure>,
    next_epoch: AtomicU64,
    outbound_queue: AtomicUsize,
    idle_limit: AtomicU32,
}

impl OctapodRegistry {
    /// Create the registry and spawn its reaper. Must run inside a tokio
    /// runtime.
    pub fn new(outbound_queue: usize, idle_limit: u32) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            octapods: Mutex::new(HashMap::new()),
            departures: tx,
            next_epoch: AtomicU64::new(1),
            outbound_queue: AtomicUsize::new(outbound_queue.max(1)),
            idle_limit: AtomicU32::new(idle_limit),
        });
        tokio::spawn(reap(Arc::downgrade(&registry), rx));
        registry
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Octapod>>> {
        self.octapods.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> Vec<Arc<Octapod>> {
        self.lock().values().cloned().collect()
    }

    /// Applied to connections attached and pings sent from now on.
    pub fn set_policy(&self, outbound_queue: usize, idle_limit: u32) {
        self.outbound_queue.store(outbound_queue.max(1), Ordering::Relaxed);
        self.idle_limit.store(idle_limit, Ordering::Relaxed);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Octapod>> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.snapshot().iter().filter(|o| o.is_connected()).count()
    }

    /// Ids and positions, sorted by id.
    pub fn positions(&self) -> Vec<(String, Vector)> {
        let mut out: Vec<(String, Vector)> = self
            .snapshot()
            .iter()
            .map(|o| (o.id().to_string(), o.position()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Cheap pre-check before upgrading a connection. `join` checks again.
    pub fn check_available(&self, id: &str) -> Result<(), JoinError> {
        match self.get(id) {
            Some(o) if o.is_connected() => Err(JoinError::AlreadyConnected(id.to_string())),
            _ => Ok(()),
        }
    }

    /// Register a connection under `id` and start its reader and writer.
    ///
    /// A new id starts at the entrance. An id whose controller has no live
    /// connection is revived with its position intact. An id that is
    /// connected right now is refused, handing `sink` back.
    pub fn join<S, E, K>(&self, id: &str, frames: S, sink: K) -> Result<Arc<Octapod>, Rejected<K>>
    where
        S: Stream<Item = Result<String, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
        K: Sink<String> + Send + Unpin + 'static,
        K::Error: Display + Send,
    {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_queue.load(Ordering::Relaxed));
        let cancel = CancellationToken::new();
        let link = Link {
            epoch,
            outbound: outbound_tx,
            cancel: cancel.clone(),
        };

        let octapod = {
            let mut octapods = self.lock();
            match octapods.get(id) {
                Some(existing) => {
                    if existing.attach(link).is_err() {
                        return Err(Rejected {
                            error: JoinError::AlreadyConnected(id.to_string()),
                            sink,
                        });
                    }
                    info!(id, position = %existing.position(), "octapod reconnected");
                    existing.clone()
                }
                None => {
                    let octapod = Arc::new(Octapod::new(id, Vector::ZERO));
                    // A fresh controller has no link, so this cannot be refused.
                    let _ = octapod.attach(link);
                    octapods.insert(id.to_string(), octapod.clone());
                    info!(id, "octapod registered");
                    octapod
                }
            }
        };

        let departures = self.departures.clone();
        let reader = octapod.clone();
        let reader_cancel = cancel.clone();
        let reader_id = id.to_string();
        tokio::spawn(async move {
            let exit = read_loop(reader, frames, reader_cancel.clone()).await;
            reader_cancel.cancel();
            let _ = departures.send(Departure {
                id: reader_id,
                epoch,
                exit,
            });
        });

        let departures = self.departures.clone();
        let writer_id = id.to_string();
        tokio::spawn(async move {
            let exit = write_loop(outbound_rx, sink, cancel.clone()).await;
            cancel.cancel();
            let _ = departures.send(Departure {
                id: writer_id,
                epoch,
                exit,
            });
        });

        Ok(octapod)
    }

    /// Disconnect and remove `id` if its live connection is the one with
    /// `epoch`. A newer connection, or a dormant controller whose link was
    /// already taken by a local disconnect, is left alone.
    pub fn retire(&self, id: &str, epoch: u64) -> bool {
        let mut octapods = self.lock();
        let Some(octapod) = octapods.get(id) else {
            return false;
        };
        if octapod.link_epoch() != Some(epoch) {
            return false;
        }
        octapod.disconnect();
        octapods.remove(id);
        true
    }

    fn handle_departure(&self, departure: Departure) {
        if !departure.exit.is_transport_loss() {
            debug!(id = %departure.id, epoch = departure.epoch, "connection task stopped");
            return;
        }
        if self.retire(&departure.id, departure.epoch) {
            info!(id = %departure.id, exit = ?departure.exit, "octapod disconnected, removed");
        }
    }

    /// Resolve every pending move. Returns the ids now on the exit, sorted.
    /// Each agent is judged only against its own last sensor reading.
    pub fn update_all(&self, maze: &Maze) -> Vec<String> {
        let mut solved: Vec<String> = self
            .snapshot()
            .iter()
            .filter(|o| maze.is_solved(o.try_apply_move()))
            .map(|o| o.id().to_string())
            .collect();
        solved.sort();
        solved
    }

    /// Ping every connected agent with the sensor reading for its current
    /// position. Agents whose ping fails are removed once the pass is done;
    /// agents idle past the limit are disconnected but kept.
    pub fn ping_all(&self, tick_id: &str, phase: Phase, maze: &Maze) -> PingSummary {
        let idle_limit = self.idle_limit.load(Ordering::Relaxed);
        let mut summary = PingSummary::default();
        let mut failed: Vec<(String, u64)> = Vec::new();

        for octapod in self.snapshot() {
            let Some(epoch) = octapod.link_epoch() else {
                continue;
            };
            if idle_limit > 0 && octapod.idle_pings() >= idle_limit {
                if octapod.disconnect() {
                    info!(id = octapod.id(), idle_limit, "octapod kicked for inactivity");
                    summary.kicked.push(octapod.id().to_string());
                }
                continue;
            }

            let position = octapod.position();
            let status = if maze.is_solved(position) {
                AgentStatus::Solved
            } else {
                phase.agent_status()
            };
            match octapod.ping(tick_id, maze.sensor_at(position), status) {
                Ok(()) => summary.pinged += 1,
                Err(PingError::NotConnected) => {}
                Err(e) => {
                    warn!(id = octapod.id(), "ping failed: {}", e);
                    failed.push((octapod.id().to_string(), epoch));
                }
            }
        }

        for (id, epoch) in failed {
            if self.retire(&id, epoch) {
                summary.dropped.push(id);
            }
        }
        summary.kicked.sort();
        summary.dropped.sort();
        summary
    }

    /// Start a new session: dormant controllers are dropped, everyone still
    /// connected goes back to the entrance.
    pub fn reset_all(&self) {
        let kept: Vec<Arc<Octapod>> = {
            let mut octapods = self.lock();
            let before = octapods.len();
            octapods.retain(|_, o| o.is_connected());
            let evicted = before - octapods.len();
            if evicted > 0 {
                info!(evicted, "dormant octapods dropped on reset");
            }
            octapods.values().cloned().collect()
        };
        for octapod in kept {
            octapod.reset();
        }
    }
}

async fn reap(registry: Weak<OctapodRegistry>, mut departures: mpsc::UnboundedReceiver<Departure>) {
    while let Some(departure) = departures.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.handle_departure(departure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;
    use std::convert::Infallible;
    use std::time::Duration;

    use crate::protocol::{MoveMessage, PingMessage};
    use crate::vector::Direction;

    type Frames = futures::stream::Map<fmpsc::UnboundedReceiver<String>, fn(String) -> Result<String, Infallible>>;

    /// Test side of one in-memory connection.
    #[derive(Debug)]
    struct Peer {
        to_server: fmpsc::UnboundedSender<String>,
        from_server: fmpsc::UnboundedReceiver<String>,
    }

    impl Peer {
        async fn next_ping(&mut self) -> PingMessage {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.from_server.next())
                .await
                .expect("ping within timeout")
                .expect("connection open");
            serde_json::from_str(&frame).unwrap()
        }

        fn send_move(&self, tick_id: &str, d: Direction) {
            let m = MoveMessage {
                tick_id: tick_id.to_string(),
                move_direction: d,
            };
            self.to_server
                .unbounded_send(serde_json::to_string(&m).unwrap())
                .unwrap();
        }
    }

    fn pipe() -> (Peer, Frames, fmpsc::UnboundedSender<String>) {
        let (to_server, frames) = fmpsc::unbounded::<String>();
        let (sink, from_server) = fmpsc::unbounded::<String>();
        let frames: Frames = frames.map(Ok as fn(String) -> Result<String, Infallible>);
        (
            Peer {
                to_server,
                from_server,
            },
            frames,
            sink,
        )
    }

    fn connect(registry: &OctapodRegistry, id: &str) -> Result<(Arc<Octapod>, Peer), JoinError> {
        let (peer, frames, sink) = pipe();
        registry
            .join(id, frames, sink)
            .map(|o| (o, peer))
            .map_err(|rejected| rejected.error)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn open_maze() -> Maze {
        Maze::generated(10, 10, Some(17))
    }

    #[tokio::test]
    async fn duplicate_active_join_is_rejected() {
        let registry = OctapodRegistry::new(8, 0);
        let (_alice, _peer) = connect(&registry, "alice").unwrap();
        assert_eq!(
            registry.check_available("alice"),
            Err(JoinError::AlreadyConnected("alice".into()))
        );
        let err = connect(&registry, "alice").unwrap_err();
        assert_eq!(err.to_string(), "Octapod alice is already connected");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn refused_join_hands_the_sink_back() {
        let registry = OctapodRegistry::new(8, 0);
        let (_alice, _peer) = connect(&registry, "alice").unwrap();

        let (mut late, frames, sink) = pipe();
        let rejected = registry.join("alice", frames, sink).unwrap_err();
        assert_eq!(rejected.error, JoinError::AlreadyConnected("alice".into()));

        let mut sink = rejected.sink;
        sink.unbounded_send("refused".to_string()).unwrap();
        assert_eq!(late.from_server.next().await.as_deref(), Some("refused"));
    }

    #[tokio::test]
    async fn rejoin_after_kick_keeps_position() {
        let registry = OctapodRegistry::new(8, 0);
        let (alice, _peer) = connect(&registry, "alice").unwrap();
        alice.ping("t", crate::sensor::Sensor::default(), AgentStatus::Explore).unwrap();
        alice.offer_move(&MoveMessage {
            tick_id: "t".into(),
            move_direction: Direction::Right,
        });
        alice.try_apply_move();
        assert_eq!(alice.position(), Vector::new(1, 0));

        assert!(alice.disconnect());
        assert!(registry.check_available("alice").is_ok());

        let (again, _peer2) = connect(&registry, "alice").unwrap();
        assert!(Arc::ptr_eq(&alice, &again));
        assert_eq!(again.position(), Vector::new(1, 0));
        assert!(again.is_connected());
    }

    #[tokio::test]
    async fn peer_close_removes_agent_through_reaper() {
        let registry = OctapodRegistry::new(8, 0);
        let (_alice, peer) = connect(&registry, "alice").unwrap();
        let (_bob, _bob_peer) = connect(&registry, "bob").unwrap();
        drop(peer);
        eventually(|| registry.get("alice").is_none()).await;
        assert!(registry.get("bob").is_some());
    }

    #[tokio::test]
    async fn stale_departure_does_not_remove_revived_agent() {
        let registry = OctapodRegistry::new(8, 0);
        let (alice, _peer) = connect(&registry, "alice").unwrap();
        let old_epoch = alice.link_epoch().unwrap();
        alice.disconnect();
        let (_again, _peer2) = connect(&registry, "alice").unwrap();

        assert!(!registry.retire("alice", old_epoch));
        registry.handle_departure(Departure {
            id: "alice".into(),
            epoch: old_epoch,
            exit: LoopExit::Failed("late".into()),
        });
        assert!(registry.get("alice").unwrap().is_connected());
    }

    #[tokio::test]
    async fn transport_loss_after_a_kick_keeps_the_dormant_agent() {
        let registry = OctapodRegistry::new(8, 0);
        let (alice, _peer) = connect(&registry, "alice").unwrap();
        let epoch = alice.link_epoch().unwrap();

        // The peer hung up in the same instant the kick landed.
        assert!(alice.disconnect());
        assert!(!registry.retire("alice", epoch));
        registry.handle_departure(Departure {
            id: "alice".into(),
            epoch,
            exit: LoopExit::Closed,
        });
        assert!(Arc::ptr_eq(&registry.get("alice").unwrap(), &alice));
        assert!(!alice.is_connected());
    }

    #[tokio::test]
    async fn positions_are_listed_by_id() {
        let registry = OctapodRegistry::new(8, 0);
        let (_carol, _c) = connect(&registry, "carol").unwrap();
        let (alice, _a) = connect(&registry, "alice").unwrap();
        let (_bob, _b) = connect(&registry, "bob").unwrap();
        alice.ping("t", crate::sensor::Sensor::default(), AgentStatus::Explore).unwrap();
        alice.offer_move(&MoveMessage {
            tick_id: "t".into(),
            move_direction: Direction::Right,
        });
        alice.try_apply_move();

        assert_eq!(
            registry.positions(),
            vec![
                ("alice".to_string(), Vector::new(1, 0)),
                ("bob".to_string(), Vector::ZERO),
                ("carol".to_string(), Vector::ZERO),
            ]
        );
    }

    #[tokio::test]
    async fn tick_resolution_then_ping_reports_post_move_state() {
        let registry = OctapodRegistry::new(8, 0);
        let maze = open_maze();
        let (_alice, mut peer) = connect(&registry, "alice").unwrap();

        let summary = registry.ping_all("t1", Phase::Exploring, &maze);
        assert_eq!(summary.pinged, 1);
        let ping = peer.next_ping().await;
        assert_eq!(ping.position, Vector::ZERO);
        assert_eq!(ping.sensor, maze.sensor_at(Vector::ZERO));
        assert_eq!(ping.status, AgentStatus::Explore);

        // (1,0) is always open, so Right from the entrance is never blocked.
        peer.send_move("t1", Direction::Right);
        let alice = registry.get("alice").unwrap();
        eventually(|| alice.pending_move().is_some()).await;

        assert!(registry.update_all(&maze).is_empty());
        registry.ping_all("t2", Phase::Solving, &maze);
        let ping = peer.next_ping().await;
        assert_eq!(ping.tick_id, "t2");
        assert_eq!(ping.position, Vector::new(1, 0));
        assert_eq!(ping.sensor, maze.sensor_at(Vector::new(1, 0)));
        assert_eq!(ping.status, AgentStatus::Solve);
    }

    #[tokio::test]
    async fn failed_ping_removes_only_that_agent() {
        let registry = OctapodRegistry::new(1, 0);
        let maze = open_maze();

        // Alice's wire holds a single frame and is never read, so her writer
        // wedges and her one-slot outbound queue fills behind it.
        let (_to_server, frames) = fmpsc::unbounded::<String>();
        let (alice_sink, _alice_wire) = fmpsc::channel::<String>(0);
        registry
            .join(
                "alice",
                frames.map(Ok as fn(String) -> Result<String, Infallible>),
                alice_sink,
            )
            .unwrap();
        let (_bob, mut bob_peer) = connect(&registry, "bob").unwrap();

        let mut dropped = Vec::new();
        for tick in 0..10 {
            let tick_id = format!("t{tick}");
            let summary = registry.ping_all(&tick_id, Phase::Exploring, &maze);
            assert_eq!(bob_peer.next_ping().await.tick_id, tick_id);
            if !summary.dropped.is_empty() {
                dropped = summary.dropped;
                break;
            }
        }
        assert_eq!(dropped, vec!["alice".to_string()]);
        assert!(registry.get("alice").is_none());

        registry.ping_all("after", Phase::Exploring, &maze);
        assert_eq!(bob_peer.next_ping().await.tick_id, "after");
    }

    #[tokio::test]
    async fn idle_agents_are_kicked_but_kept() {
        let registry = OctapodRegistry::new(8, 2);
        let maze = open_maze();
        let (alice, _peer) = connect(&registry, "alice").unwrap();

        registry.ping_all("t1", Phase::Exploring, &maze);
        registry.ping_all("t2", Phase::Exploring, &maze);
        let third = registry.ping_all("t3", Phase::Exploring, &maze);
        assert_eq!(third.kicked, vec!["alice".to_string()]);
        assert_eq!(third.pinged, 0);
        assert!(!alice.is_connected());

        // Cancelled tasks report in, but the dormant agent stays registered.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.get("alice").is_some());
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn solved_status_and_list_follow_the_exit() {
        let registry = OctapodRegistry::new(64, 0);
        let maze = open_maze();
        let (alice, mut peer) = connect(&registry, "alice").unwrap();
        let (_bob, _bob_peer) = connect(&registry, "bob").unwrap();

        // Put alice next to the exit with a reading that allows the last step.
        alice.reset();
        let near = Vector::new(8, 9);
        let sensor = maze.sensor_at(near);
        assert!(!sensor.right);
        {
            // Walk her there by hand through the public operations.
            let mut pos = Vector::ZERO;
            while pos != near {
                let d = if pos.x < near.x { Direction::Right } else { Direction::Down };
                alice.ping("walk", crate::sensor::Sensor::default(), AgentStatus::Explore).unwrap();
                alice.offer_move(&MoveMessage {
                    tick_id: "walk".into(),
                    move_direction: d,
                });
                pos = alice.try_apply_move();
            }
        }
        while peer.from_server.try_recv().is_ok() {}

        alice.ping("t1", sensor, AgentStatus::Solve).unwrap();
        alice.offer_move(&MoveMessage {
            tick_id: "t1".into(),
            move_direction: Direction::Right,
        });
        assert_eq!(registry.update_all(&maze), vec!["alice".to_string()]);

        registry.ping_all("t2", Phase::Solving, &maze);
        let mut last = peer.next_ping().await;
        while last.tick_id != "t2" {
            last = peer.next_ping().await;
        }
        assert_eq!(last.status, AgentStatus::Solved);
        assert_eq!(last.position, maze.exit());
    }

    #[tokio::test]
    async fn reset_all_returns_everyone_to_the_entrance() {
        let registry = OctapodRegistry::new(8, 0);
        let (alice, _peer) = connect(&registry, "alice").unwrap();
        alice.ping("t", crate::sensor::Sensor::default(), AgentStatus::Explore).unwrap();
        alice.offer_move(&MoveMessage {
            tick_id: "t".into(),
            move_direction: Direction::Down,
        });
        alice.try_apply_move();
        registry.reset_all();
        assert_eq!(registry.positions(), vec![("alice".to_string(), Vector::ZERO)]);
        assert_eq!(alice.tick_id(), None);
        assert!(alice.is_connected());
    }

    #[tokio::test]
    async fn reset_all_drops_dormant_agents() {
        let registry = OctapodRegistry::new(8, 0);
        let (alice, _a) = connect(&registry, "alice").unwrap();
        let (_bob, _b) = connect(&registry, "bob").unwrap();
        alice.disconnect();
        assert_eq!(registry.len(), 2);

        registry.reset_all();
        assert!(registry.get("alice").is_none());
        assert_eq!(registry.positions(), vec![("bob".to_string(), Vector::ZERO)]);

        // The id is free for a fresh start.
        let (again, _a2) = connect(&registry, "alice").unwrap();
        assert!(!Arc::ptr_eq(&alice, &again));
    }
}
