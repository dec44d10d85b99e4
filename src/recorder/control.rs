//! Stop/kill handshake between a caller and a capture thread.
//!
//! Both directions are rendezvous channels: a request only completes when the
//! capture loop picks it up, and an acknowledgment only completes when the caller
//! receives it. Alongside the channels sits an explicit [`SessionState`] that both
//! sides advance through a fixed transition table, so a late or duplicate signal
//! can never move a finished session.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Recording,
    StopRequested,
    Stopped,
    KillRequested,
    Killed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Killed)
    }

    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (Idle, Recording)
                | (Recording, StopRequested)
                | (Recording, KillRequested)
                | (Recording, Killed)
                | (StopRequested, Stopped)
                | (StopRequested, KillRequested)
                | (StopRequested, Killed)
                | (KillRequested, Killed)
        )
    }
}

/// State cell shared by the two ends of one session's control channel.
#[derive(Debug, Clone)]
pub struct SharedState(Arc<Mutex<SessionState>>);

impl SharedState {
    fn new() -> Self {
        SharedState(Arc::new(Mutex::new(SessionState::Idle)))
    }

    pub fn get(&self) -> SessionState {
        *self.0.lock()
    }

    /// Applies `next` if the transition table allows it.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut state = self.0.lock();
        if state.can_advance_to(next) {
            tracing::trace!("Session state {:?} -> {:?}", *state, next);
            *state = next;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Stop,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAck {
    /// The source is halted; the container is finalized when the loop unwinds.
    FullyStopped,
    /// The source is halted and the container is already finalized.
    KillProcessed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    /// The state machine refused the request; carries the state at that moment.
    Rejected(SessionState),
    TimedOut,
    /// The capture loop is gone.
    Disconnected,
}

/// Caller side of the handshake.
#[derive(Debug)]
pub struct ControlChannel {
    signal_tx: Sender<ControlSignal>,
    ack_rx: Receiver<ControlAck>,
    state: SharedState,
}

/// Capture-loop side of the handshake.
#[derive(Debug)]
pub struct ControlEndpoint {
    signal_rx: Receiver<ControlSignal>,
    ack_tx: Sender<ControlAck>,
    state: SharedState,
}

pub fn control_channel() -> (ControlChannel, ControlEndpoint) {
    let (signal_tx, signal_rx) = crossbeam_channel::bounded(0);
    let (ack_tx, ack_rx) = crossbeam_channel::bounded(0);
    let state = SharedState::new();

    (
        ControlChannel {
            signal_tx,
            ack_rx,
            state: state.clone(),
        },
        ControlEndpoint {
            signal_rx,
            ack_tx,
            state,
        },
    )
}

impl ControlChannel {
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Moves the session into the matching requested state, hands `signal` to the
    /// capture loop and waits for its acknowledgment. `None` waits forever.
    ///
    /// When a phase times out the requested state is left in place. A capture loop
    /// that wakes up later sees `KillRequested` and finalizes on its own.
    pub fn request(
        &self,
        signal: ControlSignal,
        timeout: Option<Duration>,
    ) -> Result<ControlAck, HandshakeError> {
        let requested = match signal {
            ControlSignal::Stop => SessionState::StopRequested,
            ControlSignal::Kill => SessionState::KillRequested,
        };
        if !self.state.advance(requested) {
            return Err(HandshakeError::Rejected(self.state.get()));
        }

        match timeout {
            Some(timeout) => self
                .signal_tx
                .send_timeout(signal, timeout)
                .map_err(|error| match error {
                    SendTimeoutError::Timeout(_) => HandshakeError::TimedOut,
                    SendTimeoutError::Disconnected(_) => HandshakeError::Disconnected,
                })?,
            None => self
                .signal_tx
                .send(signal)
                .map_err(|_| HandshakeError::Disconnected)?,
        }

        match timeout {
            Some(timeout) => self.ack_rx.recv_timeout(timeout).map_err(|error| match error {
                RecvTimeoutError::Timeout => HandshakeError::TimedOut,
                RecvTimeoutError::Disconnected => HandshakeError::Disconnected,
            }),
            None => self.ack_rx.recv().map_err(|_| HandshakeError::Disconnected),
        }
    }
}

impl ControlEndpoint {
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Marks capture as running. Fails if the session was already torn down.
    pub fn begin(&self) -> bool {
        self.state.advance(SessionState::Recording)
    }

    /// Non-blocking check for a pending request. A dropped caller side reads as a kill.
    pub fn poll(&self) -> Option<ControlSignal> {
        match self.signal_rx.try_recv() {
            Ok(signal) => Some(signal),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(ControlSignal::Kill),
        }
    }

    /// True when a kill was requested but never delivered over the channel.
    pub fn kill_pending(&self) -> bool {
        self.state.get() == SessionState::KillRequested
    }

    /// Sends `ack` to the waiting caller. Returns false when nobody took it.
    pub fn acknowledge(&self, ack: ControlAck, timeout: Option<Duration>) -> bool {
        let delivered = match timeout {
            Some(timeout) => self.ack_tx.send_timeout(ack, timeout).is_ok(),
            None => self.ack_tx.send(ack).is_ok(),
        };
        if !delivered {
            tracing::warn!("Acknowledgment {:?} was not received, dropping it", ack);
        }
        delivered
    }

    /// Records the single terminal transition for this session.
    ///
    /// `clean_stop` is true only on the STOP path. Every other exit ends in `Killed`.
    pub fn settle(&self, clean_stop: bool) -> SessionState {
        let target = if clean_stop && self.state.get() == SessionState::StopRequested {
            SessionState::Stopped
        } else {
            SessionState::Killed
        };
        self.state.advance(target);
        self.state.get()
    }
}
