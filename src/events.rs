//! Stream lifecycle state and event fan-out
//!
//! The original SDK broadcast lifecycle changes through implicit global
//! notifications; here observers register explicitly and receive events over
//! their own channel.

use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, StreamError};

/// Connection lifecycle of a publish session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

/// Why a stream session failed
///
/// Queryable while the state is [`StreamState::Error`]; cleared on the next
/// state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamErrorCode {
    None,
    DnsFailed,
    ConnectFailed,
    ConnectionBroken,
    PublishFailed,
    CodecNotSupported,
    Internal,
}

impl Default for StreamErrorCode {
    fn default() -> Self {
        StreamErrorCode::None
    }
}

/// Network condition events observed by the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetStateCode {
    /// Outbound queue is congested and frames are being dropped
    SendPacketSlow,
    /// The bitrate controller raised the video target
    EstimatedBandwidthRaise,
    /// The bitrate controller lowered the video target
    EstimatedBandwidthDrop,
    /// The connection is unusable and a restart is needed
    ReconnectRequired,
}

/// Events published by a streaming session
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The session state changed; carries the new state and the error code
    /// valid under it
    StateChanged {
        state: StreamState,
        error: StreamErrorCode,
    },
    /// A network condition was observed
    NetState(NetStateCode),
    /// The background music track finished (non-looping playback only)
    BgmFinished,
}

/// Explicit observer registration with per-subscriber channels
///
/// Slow or dropped subscribers never block the publisher: sends are
/// non-blocking and disconnected receivers are pruned.
pub struct EventHub<E: Clone> {
    subscribers: Mutex<Vec<Sender<E>>>,
}

impl<E: Clone> EventHub<E> {
    pub fn new() -> Self {
        Self { subscribers: Mutex::new(Vec::new()) }
    }

    /// Register an observer; events published after this call are delivered to
    /// the returned receiver
    pub fn subscribe(&self) -> Receiver<E> {
        let (tx, rx) = crossbeam_channel::bounded(256);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber
    pub fn publish(&self, event: E) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => true,
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        });
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl<E: Clone> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// The stream state machine
///
/// Tracks the current state and error code, enforces legal transitions, and
/// publishes `StateChanged` events. The error code resets on every transition
/// except the one entering [`StreamState::Error`].
pub struct StreamMachine {
    state: Mutex<(StreamState, StreamErrorCode)>,
    net_state: Mutex<Option<NetStateCode>>,
    hub: EventHub<StreamEvent>,
}

impl StreamMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((StreamState::Idle, StreamErrorCode::None)),
            net_state: Mutex::new(None),
            hub: EventHub::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state.lock().unwrap().0
    }

    pub fn error_code(&self) -> StreamErrorCode {
        self.state.lock().unwrap().1
    }

    pub fn subscribe(&self) -> Receiver<StreamEvent> {
        self.hub.subscribe()
    }

    pub fn publish_net_state(&self, code: NetStateCode) {
        *self.net_state.lock().unwrap() = Some(code);
        self.hub.publish(StreamEvent::NetState(code));
    }

    /// Most recently observed network condition, if any
    pub fn net_state(&self) -> Option<NetStateCode> {
        *self.net_state.lock().unwrap()
    }

    pub fn publish(&self, event: StreamEvent) {
        self.hub.publish(event);
    }

    /// Transition into a non-error state
    pub fn transition(&self, next: StreamState) -> Result<()> {
        debug_assert_ne!(next, StreamState::Error, "use fail() to enter Error");
        let mut guard = self.state.lock().unwrap();
        let current = guard.0;
        if !Self::is_legal(current, next) {
            return Err(StreamError::InvalidState(format!(
                "illegal stream transition {:?} -> {:?}",
                current, next
            )));
        }
        // Error code is only meaningful under the state that set it.
        *guard = (next, StreamErrorCode::None);
        drop(guard);
        log::debug!("stream state {:?} -> {:?}", current, next);
        self.hub.publish(StreamEvent::StateChanged { state: next, error: StreamErrorCode::None });
        Ok(())
    }

    /// Transition into [`StreamState::Error`] with a cause
    pub fn fail(&self, code: StreamErrorCode) {
        let mut guard = self.state.lock().unwrap();
        let current = guard.0;
        *guard = (StreamState::Error, code);
        drop(guard);
        log::warn!("stream state {:?} -> Error ({:?})", current, code);
        self.hub.publish(StreamEvent::StateChanged { state: StreamState::Error, error: code });
    }

    fn is_legal(from: StreamState, to: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (from, to),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Disconnecting, Idle)
                | (Error, Idle)
                | (Error, Connecting)
        )
    }
}

impl Default for StreamMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let machine = StreamMachine::new();
        assert_eq!(machine.state(), StreamState::Idle);
        assert_eq!(machine.error_code(), StreamErrorCode::None);
    }

    #[test]
    fn test_happy_path_transitions() {
        let machine = StreamMachine::new();
        machine.transition(StreamState::Connecting).unwrap();
        machine.transition(StreamState::Connected).unwrap();
        machine.transition(StreamState::Disconnecting).unwrap();
        machine.transition(StreamState::Idle).unwrap();
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let machine = StreamMachine::new();
        assert!(machine.transition(StreamState::Connected).is_err());
        assert_eq!(machine.state(), StreamState::Idle);
    }

    #[test]
    fn test_error_code_reset_on_state_change() {
        let machine = StreamMachine::new();
        machine.transition(StreamState::Connecting).unwrap();
        machine.fail(StreamErrorCode::ConnectFailed);
        assert_eq!(machine.error_code(), StreamErrorCode::ConnectFailed);

        // Leaving Error clears the code.
        machine.transition(StreamState::Idle).unwrap();
        assert_eq!(machine.error_code(), StreamErrorCode::None);
    }

    #[test]
    fn test_events_delivered_to_subscriber() {
        let machine = StreamMachine::new();
        let rx = machine.subscribe();
        machine.transition(StreamState::Connecting).unwrap();
        machine.publish_net_state(NetStateCode::SendPacketSlow);

        assert_eq!(
            rx.recv().unwrap(),
            StreamEvent::StateChanged { state: StreamState::Connecting, error: StreamErrorCode::None }
        );
        assert_eq!(rx.recv().unwrap(), StreamEvent::NetState(NetStateCode::SendPacketSlow));
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let hub: EventHub<u32> = EventHub::new();
        let rx = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(rx);
        hub.publish(1);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
