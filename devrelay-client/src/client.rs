//! Device client.

use crate::error::ClientError;
use devrelay_protocol::DeviceRecord;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Timeout for a single write.
    pub write_timeout: Duration,
    /// Byte written after each record. The relay does not need one, but
    /// newline-separated output is easier to inspect.
    pub separator: Option<u8>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            separator: Some(b'\n'),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sends records back to back with nothing in between.
    pub fn without_separator(mut self) -> Self {
        self.separator = None;
        self
    }
}

/// Streams records to a relay over one connection.
pub struct DeviceClient<S = TcpStream> {
    stream: Option<S>,
    config: ClientConfig,
    records_sent: u64,
}

impl DeviceClient<TcpStream> {
    /// Connects with the default configuration.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        Self::connect_with(addr, ClientConfig::default()).await
    }

    /// Connects with the given configuration.
    pub async fn connect_with(
        addr: impl ToSocketAddrs,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ClientError::Timeout
            })??;

        stream.set_nodelay(true).ok();
        tracing::debug!("Connected to relay at {:?}", stream.peer_addr().ok());

        Ok(Self::from_stream(stream, config))
    }
}

impl<S: AsyncWrite + Unpin> DeviceClient<S> {
    /// Wraps an already established stream.
    pub fn from_stream(stream: S, config: ClientConfig) -> Self {
        Self {
            stream: Some(stream),
            config,
            records_sent: 0,
        }
    }

    /// Encodes and sends one record.
    pub async fn send(&mut self, record: &DeviceRecord) -> Result<(), ClientError> {
        let mut bytes = record.to_json()?;
        if let Some(separator) = self.config.separator {
            bytes.push(separator);
        }
        self.send_raw(&bytes).await?;
        self.records_sent += 1;
        Ok(())
    }

    /// Sends raw bytes as-is, without any encoding.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        let timeout = self.config.write_timeout;
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        tokio::time::timeout(timeout, stream.write_all(bytes))
            .await
            .map_err(|_| ClientError::Timeout)??;
        Ok(())
    }

    /// Flushes buffered writes.
    pub async fn flush(&mut self) -> Result<(), ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        stream.flush().await?;
        Ok(())
    }

    /// Shuts down the write side and releases the connection.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    /// Returns whether the client still holds a connection.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Returns the number of records sent so far.
    pub fn records_sent(&self) -> u64 {
        self.records_sent
    }
}
