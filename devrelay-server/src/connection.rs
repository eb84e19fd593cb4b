//! Per-connection record pipeline.

use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::publisher::PublishPort;
use crate::server::ServerStats;
use devrelay_protocol::{DeviceRecord, ProtocolError, RecordDecoder};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default socket read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Pulls [`DeviceRecord`]s out of a byte stream.
///
/// Wraps any [`AsyncRead`] and feeds it through a [`RecordDecoder`], reading
/// only when the decoder has nothing complete buffered.
pub struct RecordStream<R> {
    reader: R,
    decoder: RecordDecoder,
    buf: Vec<u8>,
    idle_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> RecordStream<R> {
    pub fn new(reader: R) -> Self {
        Self::with_decoder(reader, RecordDecoder::new())
    }

    pub fn with_decoder(reader: R, decoder: RecordDecoder) -> Self {
        Self {
            reader,
            decoder,
            buf: vec![0u8; DEFAULT_READ_BUFFER_SIZE],
            idle_timeout: None,
        }
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.buf = vec![0u8; size.max(1)];
        self
    }

    /// Fails a read that waits longer than `timeout` for data.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Returns the next record, or `None` once the peer has closed cleanly.
    pub async fn next_record(&mut self) -> Result<Option<DeviceRecord>, ServerError> {
        loop {
            if let Some(record) = self.decoder.decode_next()? {
                return Ok(Some(record));
            }

            let n = self.read_chunk().await?;
            if n == 0 {
                self.decoder.finish()?;
                return Ok(None);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }

    async fn read_chunk(&mut self) -> Result<usize, ServerError> {
        let read = self.reader.read(&mut self.buf);
        let result = match self.idle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, read)
                .await
                .map_err(|_| ServerError::IdleTimeout(timeout))?,
            None => read.await,
        };
        result.map_err(|e| ServerError::Protocol(ProtocolError::Io(e)))
    }
}

/// Per-connection settings derived from the server configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub read_buffer_size: usize,
    pub idle_timeout: Option<Duration>,
    pub max_record_bytes: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            idle_timeout: None,
            max_record_bytes: 0,
        }
    }
}

/// Everything a connection handler shares with the rest of the server.
#[derive(Clone)]
pub struct ConnectionContext {
    pub port: PublishPort,
    pub stats: Arc<ServerStats>,
    pub metrics: Option<Arc<Metrics>>,
    pub settings: ConnectionSettings,
}

impl ConnectionContext {
    pub fn new(port: PublishPort) -> Self {
        Self {
            port,
            stats: Arc::new(ServerStats::default()),
            metrics: None,
            settings: ConnectionSettings::default(),
        }
    }
}

/// What happened on a connection that ended without a decode failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub records: u64,
    pub published: u64,
    pub publish_failures: u64,
}

/// Drives one device connection until the peer hangs up or decoding fails.
///
/// Each decoded record is published before the next one is read. Publish
/// failures are logged and the record dropped; decode failures end the
/// connection. The stream is dropped (closing the socket) on return.
pub async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    ctx: ConnectionContext,
) -> Result<ConnectionSummary, ServerError>
where
    S: AsyncRead + Unpin,
{
    tracing::info!("Client connected: {}", addr);

    let decoder =
        RecordDecoder::new().with_max_record_bytes(ctx.settings.max_record_bytes);
    let mut records = RecordStream::with_decoder(stream, decoder)
        .with_read_buffer_size(ctx.settings.read_buffer_size)
        .with_idle_timeout(ctx.settings.idle_timeout);
    let mut summary = ConnectionSummary::default();

    loop {
        let record = match records.next_record().await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!("[{}] Connection closed by client", addr);
                return Ok(summary);
            }
            Err(e) => {
                record_decode_error(&ctx, &e);
                tracing::warn!("[{}] Failed to decode record: {}", addr, e);
                return Err(e);
            }
        };

        summary.records += 1;
        ctx.stats.records_total.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = ctx.metrics {
            metrics.records_decoded_total.inc();
        }

        tracing::debug!(
            "[{}] Record from device {} (id={}, user={}): {} bytes",
            addr,
            record.device_id,
            record.id,
            record.user_id,
            record.payload.len()
        );

        let started = Instant::now();
        let result = ctx.port.publish(record).await;
        if let Some(ref metrics) = ctx.metrics {
            metrics.publish_total.inc();
            metrics
                .publish_duration
                .observe(started.elapsed().as_secs_f64());
        }

        match result {
            Ok(()) => summary.published += 1,
            Err(e) => {
                summary.publish_failures += 1;
                ctx.stats
                    .publish_errors_total
                    .fetch_add(1, Ordering::Relaxed);
                if let Some(ref metrics) = ctx.metrics {
                    metrics.publish_errors_total.inc();
                }
                tracing::warn!("[{}] Failed to publish record: {}", addr, e);
            }
        }
    }
}

fn record_decode_error(ctx: &ConnectionContext, err: &ServerError) {
    ctx.stats.decode_errors_total.fetch_add(1, Ordering::Relaxed);
    if let Some(ref metrics) = ctx.metrics {
        let kind = match err {
            ServerError::Protocol(e) => e.kind().as_str(),
            ServerError::IdleTimeout(_) => "idle_timeout",
            _ => "other",
        };
        metrics.decode_errors_total.with_label_values(&[kind]).inc();
    }
}
