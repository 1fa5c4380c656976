//! One connected agent: its position, the move it submitted for the current
//! tick, and the two tasks that pump frames to and from its connection.

use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{AgentStatus, MoveMessage, PingMessage};
use crate::sensor::Sensor;
use crate::vector::{Direction, Vector};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum PingError {
    #[error("agent is not connected")]
    NotConnected,
    #[error("agent is not draining its outbound queue")]
    Stalled,
    #[error("agent writer has shut down")]
    Closed,
    #[error("failed to encode ping: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome of offering an inbound move frame to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveVerdict {
    Accepted,
    /// A move was already accepted for this tick.
    Duplicate,
    /// Tagged with a tick other than the one last announced.
    Stale,
    /// No tick has been announced since the last reset.
    Unannounced,
}

/// Why a connection task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Stopped by a local `disconnect`.
    Cancelled,
    /// The peer closed its side.
    Closed,
    Failed(String),
}

impl LoopExit {
    pub fn is_transport_loss(&self) -> bool {
        !matches!(self, LoopExit::Cancelled)
    }
}

/// The live half of a connection as seen by the controller.
#[derive(Debug)]
pub(crate) struct Link {
    pub(crate) epoch: u64,
    pub(crate) outbound: mpsc::Sender<String>,
    pub(crate) cancel: CancellationToken,
}

#[derive(Debug)]
struct OctapodState {
    position: Vector,
    tick_id: Option<String>,
    sensor: Option<Sensor>,
    pending: Option<Direction>,
    answered: bool,
    idle_pings: u32,
    link: Option<Link>,
}

#[derive(Debug)]
pub struct Octapod {
    id: String,
    state: Mutex<OctapodState>,
}

impl Octapod {
    pub fn new(id: impl Into<String>, position: Vector) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(OctapodState {
                position,
                tick_id: None,
                sensor: None,
                pending: None,
                answered: false,
                idle_pings: 0,
                link: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OctapodState> {
        // Every critical section leaves the state consistent, so a panic
        // elsewhere never leaves anything half-written here.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn position(&self) -> Vector {
        self.lock().position
    }

    pub fn tick_id(&self) -> Option<String> {
        self.lock().tick_id.clone()
    }

    pub fn pending_move(&self) -> Option<Direction> {
        self.lock().pending
    }

    pub fn idle_pings(&self) -> u32 {
        self.lock().idle_pings
    }

    pub fn is_connected(&self) -> bool {
        self.lock().link.is_some()
    }

    pub(crate) fn link_epoch(&self) -> Option<u64> {
        self.lock().link.as_ref().map(|l| l.epoch)
    }

    /// Install a fresh connection. Refused while another one is live.
    pub(crate) fn attach(&self, link: Link) -> Result<(), Link> {
        let mut s = self.lock();
        if s.link.is_some() {
            return Err(link);
        }
        s.idle_pings = 0;
        s.link = Some(link);
        Ok(())
    }

    /// Announce a new tick: drop any unapplied move, remember the tick id and
    /// sensor the agent may answer to, and queue the ping frame.
    pub fn ping(&self, tick_id: &str, sensor: Sensor, status: AgentStatus) -> Result<(), PingError> {
        let (message, outbound) = {
            let mut s = self.lock();
            let Some(outbound) = s.link.as_ref().map(|l| l.outbound.clone()) else {
                return Err(PingError::NotConnected);
            };
            s.pending = None;
            s.answered = false;
            s.tick_id = Some(tick_id.to_string());
            s.sensor = Some(sensor);
            s.idle_pings = s.idle_pings.saturating_add(1);
            let message = PingMessage {
                tick_id: tick_id.to_string(),
                sensor,
                position: s.position,
                status,
            };
            (message, outbound)
        };

        let frame = serde_json::to_string(&message)?;
        outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PingError::Stalled,
            mpsc::error::TrySendError::Closed(_) => PingError::Closed,
        })
    }

    /// Record an inbound move if it answers the current tick and nothing was
    /// accepted for that tick yet.
    pub fn offer_move(&self, message: &MoveMessage) -> MoveVerdict {
        let mut s = self.lock();
        let Some(current) = s.tick_id.as_deref() else {
            return MoveVerdict::Unannounced;
        };
        if current != message.tick_id {
            return MoveVerdict::Stale;
        }
        if s.answered {
            return MoveVerdict::Duplicate;
        }
        s.pending = Some(message.move_direction);
        s.answered = true;
        s.idle_pings = 0;
        MoveVerdict::Accepted
    }

    /// Resolve the pending move against the sensor reading it was made from.
    /// Blocked moves leave the position as is. This is the only place the
    /// position changes.
    pub fn try_apply_move(&self) -> Vector {
        let mut s = self.lock();
        let Some(direction) = s.pending.take() else {
            return s.position;
        };
        let blocked = s.sensor.map_or(true, |sensor| sensor.is_blocked(direction));
        if !blocked {
            s.position = s.position.step(direction);
        }
        s.position
    }

    /// Close the connection if one is open. Idempotent.
    pub fn disconnect(&self) -> bool {
        let link = self.lock().link.take();
        match link {
            Some(link) => {
                link.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Back to the entrance with no tick context; the connection is kept.
    pub fn reset(&self) {
        let mut s = self.lock();
        s.position = Vector::ZERO;
        s.tick_id = None;
        s.sensor = None;
        s.pending = None;
        s.answered = false;
        s.idle_pings = 0;
    }
}

/// Feed inbound frames to the controller until the peer goes away or the
/// connection is cancelled. Frames that are not valid move messages are
/// dropped.
pub(crate) async fn read_loop<S, E>(octapod: Arc<Octapod>, mut frames: S, cancel: CancellationToken) -> LoopExit
where
    S: Stream<Item = Result<String, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return LoopExit::Cancelled,
            frame = frames.next() => frame,
        };
        match frame {
            None => return LoopExit::Closed,
            Some(Err(e)) => return LoopExit::Failed(e.to_string()),
            Some(Ok(text)) => match serde_json::from_str::<MoveMessage>(&text) {
                Ok(message) => {
                    let verdict = octapod.offer_move(&message);
                    debug!(
                        id = octapod.id(),
                        direction = message.move_direction.as_str(),
                        ?verdict,
                        "move received"
                    );
                }
                Err(e) => debug!(id = octapod.id(), "dropping malformed frame: {}", e),
            },
        }
    }
}

/// Drain queued frames into the connection. Owns the sink and is the only
/// place it gets closed.
pub(crate) async fn write_loop<K>(mut outbound: mpsc::Receiver<String>, mut sink: K, cancel: CancellationToken) -> LoopExit
where
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    let exit = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break LoopExit::Cancelled,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else {
            break LoopExit::Cancelled;
        };
        let sent = tokio::select! {
            _ = cancel.cancelled() => break LoopExit::Cancelled,
            sent = sink.send(frame) => sent,
        };
        if let Err(e) = sent {
            break LoopExit::Failed(e.to_string());
        }
    };
    // A wedged peer must not pin this task.
    let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
    exit
}
