//! # devrelay-client
//!
//! Device-side client for devrelay.
//!
//! Opens a TCP connection to a relay and streams [`DeviceRecord`]s over it as
//! back-to-back JSON objects. Useful as a device simulator and in tests.

pub mod client;
pub mod error;

pub use client::{ClientConfig, DeviceClient};
pub use devrelay_protocol::DeviceRecord;
pub use error::ClientError;
