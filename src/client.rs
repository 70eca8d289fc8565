//! # Client Channel
//!
//! Fire-and-forget messaging between the acquisition service and an optional
//! UI client. No acknowledgements, no queueing, no retries: a message that
//! cannot be delivered is dropped.
//!
//! ## Wire Contract
//! | what | message              | direction  | payload                        |
//! |------|----------------------|------------|--------------------------------|
//! | 1    | REGISTER_CLIENT      | UI → core  | reply handle                   |
//! | 2    | DATA                 | core → UI  | `xValue` (f64), `frame` (i32[]) |
//! | 3    | RECORDING_DURATION   | UI → core  | duration string                |
//! | 4    | SAVED                | core → UI  | none                           |
//! | 5    | CONNECTION_ERROR     | core → UI  | error code                     |
//!
//! Error codes 6 and 7 distinguish storage failures from the generic device
//! error code 1.

use crate::error::ChannelError;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

pub const MSG_REGISTER_CLIENT: i32 = 1;
pub const MSG_DATA: i32 = 2;
pub const MSG_RECORDING_DURATION: i32 = 3;
pub const MSG_SAVED: i32 = 4;
pub const MSG_CONNECTION_ERROR: i32 = 5;

pub const KEY_X_VALUE: &str = "xValue";
pub const KEY_FRAME_DATA: &str = "frame";

/// Device connection or acquisition failure
pub const CODE_ERROR_CONNECTION: i32 = 1;
pub const CODE_ERROR_WRITING_TEXT_FILE: i32 = 6;
pub const CODE_ERROR_SAVING_RECORDING: i32 = 7;

/// Messages the service sends to its client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Data { x_value: f64, frame: Vec<i32> },
    Saved,
    ConnectionError { code: i32 },
}

/// Flat `what` + payload record, the shape clients outside the process parse
#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    what: i32,
    #[serde(rename = "xValue", default, skip_serializing_if = "Option::is_none")]
    x_value: Option<f64>,
    #[serde(rename = "frame", default, skip_serializing_if = "Option::is_none")]
    frame: Option<Vec<i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arg1: Option<i32>,
}

impl ClientMessage {
    pub fn what(&self) -> i32 {
        match self {
            ClientMessage::Data { .. } => MSG_DATA,
            ClientMessage::Saved => MSG_SAVED,
            ClientMessage::ConnectionError { .. } => MSG_CONNECTION_ERROR,
        }
    }

    pub fn to_wire(&self) -> serde_json::Result<String> {
        let mut wire = WireMessage {
            what: self.what(),
            x_value: None,
            frame: None,
            arg1: None,
        };
        match self {
            ClientMessage::Data { x_value, frame } => {
                wire.x_value = Some(*x_value);
                wire.frame = Some(frame.clone());
            }
            ClientMessage::Saved => {}
            ClientMessage::ConnectionError { code } => wire.arg1 = Some(*code),
        }
        serde_json::to_string(&wire)
    }

    pub fn from_wire(wire: &str) -> serde_json::Result<Self> {
        use serde::de::Error;

        let wire: WireMessage = serde_json::from_str(wire)?;
        match wire.what {
            MSG_DATA => Ok(ClientMessage::Data {
                x_value: wire.x_value.ok_or_else(|| Error::missing_field(KEY_X_VALUE))?,
                frame: wire.frame.ok_or_else(|| Error::missing_field(KEY_FRAME_DATA))?,
            }),
            MSG_SAVED => Ok(ClientMessage::Saved),
            MSG_CONNECTION_ERROR => Ok(ClientMessage::ConnectionError {
                code: wire.arg1.ok_or_else(|| Error::missing_field("arg1"))?,
            }),
            other => Err(Error::custom(format!("unexpected message id {}", other))),
        }
    }
}

/// Reply handle a client hands over when it registers
pub trait ClientEndpoint: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<(), ChannelError>;
}

impl ClientEndpoint for crossbeam_channel::Sender<ClientMessage> {
    fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
        crossbeam_channel::Sender::send(self, message).map_err(|_| ChannelError::Disconnected)
    }
}

/// Messages a client sends to the service
pub enum ServiceMessage {
    RegisterClient(Box<dyn ClientEndpoint>),
    RecordingDuration(String),
}

impl ServiceMessage {
    pub fn what(&self) -> i32 {
        match self {
            ServiceMessage::RegisterClient(_) => MSG_REGISTER_CLIENT,
            ServiceMessage::RecordingDuration(_) => MSG_RECORDING_DURATION,
        }
    }
}

impl std::fmt::Debug for ServiceMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceMessage::RegisterClient(_) => f.write_str("RegisterClient"),
            ServiceMessage::RecordingDuration(d) => {
                f.debug_tuple("RecordingDuration").field(d).finish()
            }
        }
    }
}

/// What happened to a display sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Nobody to show it to, or the delivery policy said no
    Dropped,
    /// The client endpoint is gone; it is now considered inactive
    Failed,
}

struct ChannelState {
    client: Option<Box<dyn ClientEndpoint>>,
    client_active: bool,
}

pub struct ClientChannel {
    state: Mutex<ChannelState>,
    draw_in_background: bool,
}

impl ClientChannel {
    pub fn new(draw_in_background: bool) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                client: None,
                client_active: false,
            }),
            draw_in_background,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, client: Box<dyn ClientEndpoint>) {
        let mut state = self.lock();
        state.client = Some(client);
        state.client_active = true;
        log::info!("Client registered");
    }

    /// The client unbound. Its endpoint is kept so errors and the final
    /// SAVED can still reach it.
    pub fn detach(&self) {
        self.lock().client_active = false;
    }

    pub fn is_client_active(&self) -> bool {
        self.lock().client_active
    }

    pub fn has_client(&self) -> bool {
        self.lock().client.is_some()
    }

    /// Forward one decimated sample, at most once.
    pub fn send_data(&self, x_value: f64, frame: &[i32]) -> Delivery {
        let mut state = self.lock();
        if !state.client_active && !self.draw_in_background {
            return Delivery::Dropped;
        }

        let Some(client) = state.client.as_ref() else {
            log::trace!("No client registered, dropping sample at {} ms", x_value);
            return Delivery::Dropped;
        };

        let message = ClientMessage::Data {
            x_value,
            frame: frame.to_vec(),
        };
        match client.send(message) {
            Ok(()) => Delivery::Sent,
            Err(_) => {
                if state.client_active {
                    log::info!("Client is dead");
                }
                state.client_active = false;
                Delivery::Failed
            }
        }
    }

    /// Best-effort error report. A failure is only logged.
    pub fn send_error(&self, code: i32) -> Result<(), ChannelError> {
        let result = self.send(ClientMessage::ConnectionError { code });
        if let Err(e) = &result {
            log::error!("Could not send error code {} to client: {}", code, e);
        }
        result
    }

    /// Completion signal. The caller decides what a failure means.
    pub fn send_saved(&self) -> Result<(), ChannelError> {
        self.send(ClientMessage::Saved)
    }

    fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
        let state = self.lock();
        match state.client.as_ref() {
            Some(client) => client.send(message),
            None => Err(ChannelError::NoClient),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;

    /// Endpoint that records every message and can be told to start failing
    #[derive(Clone, Default)]
    pub struct RecordingEndpoint {
        pub messages: Arc<Mutex<Vec<ClientMessage>>>,
        pub dead: Arc<std::sync::atomic::AtomicBool>,
    }

    impl RecordingEndpoint {
        pub fn messages(&self) -> Vec<ClientMessage> {
            self.messages.lock().unwrap().clone()
        }

        pub fn kill(&self) {
            self.dead.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl ClientEndpoint for RecordingEndpoint {
        fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
            if self.dead.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(ChannelError::Disconnected);
            }
            self.messages.lock().unwrap().push(message);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingEndpoint;
    use super::*;

    #[test]
    fn test_wire_keys_and_ids() {
        let data = ClientMessage::Data {
            x_value: 10.0,
            frame: vec![1, 2, 3],
        };
        let wire: serde_json::Value = serde_json::from_str(&data.to_wire().unwrap()).unwrap();
        assert_eq!(wire["what"], 2);
        assert_eq!(wire[KEY_X_VALUE], 10.0);
        assert_eq!(wire[KEY_FRAME_DATA], serde_json::json!([1, 2, 3]));

        let error = ClientMessage::ConnectionError {
            code: CODE_ERROR_SAVING_RECORDING,
        };
        assert_eq!(error.what(), 5);
        assert_eq!(ClientMessage::from_wire(&error.to_wire().unwrap()).unwrap(), error);
        assert_eq!(ClientMessage::Saved.what(), 4);
        assert!(ClientMessage::from_wire(r#"{"what":3}"#).is_err());
    }

    #[test]
    fn test_no_client_no_background_drops_everything() {
        let channel = ClientChannel::new(false);
        for i in 0..100 {
            assert_eq!(channel.send_data(i as f64, &[1, 2]), Delivery::Dropped);
        }
    }

    #[test]
    fn test_background_drawing_without_client_does_not_crash() {
        let channel = ClientChannel::new(true);
        assert_eq!(channel.send_data(1.0, &[1]), Delivery::Dropped);
        assert_eq!(channel.send_error(CODE_ERROR_CONNECTION), Err(ChannelError::NoClient));
        assert_eq!(channel.send_saved(), Err(ChannelError::NoClient));
    }

    #[test]
    fn test_detached_client_only_gets_data_when_drawing_in_background() {
        let endpoint = RecordingEndpoint::default();
        let channel = ClientChannel::new(false);
        channel.register(Box::new(endpoint.clone()));
        assert_eq!(channel.send_data(1.0, &[1]), Delivery::Sent);

        channel.detach();
        assert_eq!(channel.send_data(2.0, &[2]), Delivery::Dropped);
        assert!(channel.send_saved().is_ok());

        let background = ClientChannel::new(true);
        background.register(Box::new(endpoint.clone()));
        background.detach();
        assert_eq!(background.send_data(3.0, &[3]), Delivery::Sent);

        let whats: Vec<i32> = endpoint.messages().iter().map(ClientMessage::what).collect();
        assert_eq!(whats, vec![MSG_DATA, MSG_SAVED, MSG_DATA]);
    }

    #[test]
    fn test_dead_client_marked_inactive() {
        let endpoint = RecordingEndpoint::default();
        let channel = ClientChannel::new(false);
        channel.register(Box::new(endpoint.clone()));

        endpoint.kill();
        assert_eq!(channel.send_data(1.0, &[1]), Delivery::Failed);
        assert!(!channel.is_client_active());
        assert_eq!(channel.send_data(2.0, &[1]), Delivery::Dropped);
        assert_eq!(channel.send_saved(), Err(ChannelError::Disconnected));
    }

    #[test]
    fn test_crossbeam_endpoint() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let channel = ClientChannel::new(false);
        channel.register(Box::new(tx));

        channel.send_data(5.0, &[7, 8]);
        channel.send_saved().unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientMessage::Data {
                x_value: 5.0,
                frame: vec![7, 8]
            }
        );
        assert_eq!(rx.try_recv().unwrap(), ClientMessage::Saved);

        drop(rx);
        assert_eq!(channel.send_error(CODE_ERROR_CONNECTION), Err(ChannelError::Disconnected));
    }
}
