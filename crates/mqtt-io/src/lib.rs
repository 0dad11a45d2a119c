//! MQTT conventions and transport for the rule engine
//!
//! This crate implements the topic grammar used by the device bus
//! (`/devices/...`) and by the engine itself (`/wbrules/...`), plus the
//! broker transport the daemon runs on.

pub mod topics;
pub mod transport;

pub use topics::Topic;
pub use transport::{IncomingMessage, MqttTransport, Publisher, TransportError};
