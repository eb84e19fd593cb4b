//! # devrelay-server
//!
//! Device ingestion server for devrelay.
//!
//! This crate provides:
//! - TCP acceptor with one independent handler task per device connection
//! - Streaming record decoding on top of any async byte source
//! - A publish port that serializes all broker publishes through one task
//! - AMQP topology declaration and connection setup
//! - Configuration loading (YAML, dotenv, environment)
//! - Prometheus metrics

pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod publisher;
pub mod server;
pub mod topology;

pub use config::{BrokerConfig, Config, ConfigError, DecoderConfig, MetricsConfig, NetworkConfig};
pub use connection::{handle_connection, ConnectionContext, ConnectionSummary, RecordStream};
pub use error::{PublishError, ServerError};
pub use metrics::Metrics;
pub use publisher::{AmqpSink, BrokerSink, MemorySink, PublishPort, PublishTarget, PublishedMessage};
pub use server::{Server, ServerConfig, ServerStats};
pub use topology::Topology;
