//! TCP acceptor.

use crate::config::Config;
use crate::connection::{handle_connection, ConnectionContext, ConnectionSettings};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::publisher::PublishPort;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout (None = connections may idle forever).
    pub idle_timeout: Option<Duration>,
    /// Maximum concurrent connections (0 = unlimited).
    pub max_connections: usize,
    /// Per-connection socket read buffer size.
    pub read_buffer_size: usize,
    /// Maximum encoded record size (0 = unlimited).
    pub max_record_bytes: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("max_record_bytes", &self.max_record_bytes)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let settings = ConnectionSettings::default();
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], devrelay_protocol::DEFAULT_PORT)),
            idle_timeout: settings.idle_timeout,
            max_connections: 0, // unlimited
            read_buffer_size: settings.read_buffer_size,
            max_record_bytes: settings.max_record_bytes,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the server configuration from the loaded relay configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            read_buffer_size: config.network.read_buffer_size,
            max_record_bytes: config.decoder.max_record_bytes,
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            read_buffer_size: self.read_buffer_size,
            idle_timeout: self.idle_timeout,
            max_record_bytes: self.max_record_bytes,
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub records_total: AtomicU64,
    pub decode_errors_total: AtomicU64,
    pub publish_errors_total: AtomicU64,
}

/// Accepts device connections and runs one handler task per connection.
pub struct Server {
    config: ServerConfig,
    port: PublishPort,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Creates a new server publishing through `port`.
    pub fn new(config: ServerConfig, port: PublishPort) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            port,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        }
    }

    /// Binds the configured address and runs the accept loop.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop on an already bound listener.
    ///
    /// A failed accept is logged and the loop carries on. Handlers are fully
    /// independent of each other and of this loop; stopping the server does
    /// not interrupt connections already being served.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);
        let mut shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);

        tracing::info!("Listening for devices on {}", local_addr);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.config.max_connections > 0
                                && self.stats.connections_active.load(Ordering::Relaxed)
                                    >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                if let Some(ref metrics) = self.config.metrics {
                                    metrics.connections_rejected_total.inc();
                                }
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            if let Some(ref metrics) = self.config.metrics {
                                metrics.connections_total.inc();
                                metrics.connections_active.inc();
                            }

                            let ctx = ConnectionContext {
                                port: self.port.clone(),
                                stats: self.stats.clone(),
                                metrics: self.config.metrics.clone(),
                                settings: self.config.connection_settings(),
                            };

                            tokio::spawn(async move {
                                let stats = ctx.stats.clone();
                                let metrics = ctx.metrics.clone();

                                match handle_connection(tcp_stream, addr, ctx).await {
                                    Ok(summary) => tracing::debug!(
                                        "[{}] {} records, {} published, {} publish failures",
                                        addr,
                                        summary.records,
                                        summary.published,
                                        summary.publish_failures
                                    ),
                                    Err(e) => tracing::debug!("Connection {} error: {}", addr, e),
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                if let Some(ref metrics) = metrics {
                                    metrics.connections_active.dec();
                                }

                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stops accepting new connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the bound address once the accept loop has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{MemorySink, PublishTarget};
    use devrelay_client::DeviceClient;
    use devrelay_protocol::DeviceRecord;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    const FIRST: &str = r#"{"id":1,"data":"{\"t\":21.5}","timestamp":1700000000,"user_id":7,"device_id":"dev-A"}"#;
    const SECOND: &str = r#"{"id":2,"data":"{\"t\":22.0}","timestamp":1700000005,"user_id":7,"device_id":"dev-A"}"#;

    async fn start_with(config: ServerConfig, sink: MemorySink) -> (Arc<Server>, SocketAddr) {
        let (port, _task) = PublishPort::spawn(sink, PublishTarget::new("data"), 64);
        let server = Arc::new(Server::new(config, port));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });

        (server, addr)
    }

    async fn start(sink: MemorySink) -> (Arc<Server>, SocketAddr) {
        start_with(ServerConfig::new("127.0.0.1:0".parse().unwrap()), sink).await
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..250 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not met in time");
    }

    /// Reads until the server closes the socket.
    async fn assert_closed_by_server(stream: &mut TcpStream) {
        let mut buf = [0u8; 16];
        let result = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("server did not close the connection");
        assert!(matches!(result, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_server_not_running_before_serve() {
        let (port, _task) = PublishPort::spawn(MemorySink::new(), PublishTarget::new("data"), 1);
        let server = Server::new(ServerConfig::default(), port);
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_run_fails_when_port_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (port, _task) = PublishPort::spawn(MemorySink::new(), PublishTarget::new("data"), 1);
        let server = Server::new(ServerConfig::new(taken.local_addr().unwrap()), port);

        let err = server.run().await.unwrap_err();
        assert!(matches!(err, ServerError::Io(_)));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_lenient_records_are_relayed() {
        let sink = MemorySink::new();
        let (_server, addr) = start(sink.clone()).await;

        let mut client = DeviceClient::connect(addr).await.unwrap();
        client
            .send_raw(br#"{"id":1,"data":"a","data":"b"} null {"ID":2,"Data":"c"}"#)
            .await
            .unwrap();
        client.close().await.unwrap();

        wait_for(|| sink.len() == 3).await;
        let bodies: Vec<_> = sink.messages().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec![b"b".to_vec(), Vec::new(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn test_two_records_in_order() {
        let sink = MemorySink::new();
        let (_server, addr) = start(sink.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("{FIRST}{SECOND}").as_bytes())
            .await
            .unwrap();

        wait_for(|| sink.len() == 2).await;
        let messages = sink.messages();
        assert_eq!(messages[0].body, br#"{"t":21.5}"#);
        assert_eq!(messages[1].body, br#"{"t":22.0}"#);
        for message in &messages {
            assert_eq!(message.exchange, "data");
            assert_eq!(message.routing_key, "");
            assert_eq!(message.content_type, "application/json");
        }
    }

    #[tokio::test]
    async fn test_truncated_record_publishes_nothing() {
        let sink = MemorySink::new();
        let (server, addr) = start(sink.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(br#"{"id":1,"data":"x""#).await.unwrap();
        stream.shutdown().await.unwrap();

        assert_closed_by_server(&mut stream).await;
        wait_for(|| server.stats().connections_active.load(Ordering::Relaxed) == 0).await;

        assert!(sink.is_empty());
        assert_eq!(server.stats().decode_errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_malformed_connection_does_not_affect_others() {
        let sink = MemorySink::new();
        let (_server, addr) = start(sink.clone()).await;

        let mut healthy = DeviceClient::connect(addr).await.unwrap();
        healthy
            .send(&DeviceRecord::new("healthy-1").with_device_id("dev-B"))
            .await
            .unwrap();
        wait_for(|| sink.len() == 1).await;

        let mut broken = TcpStream::connect(addr).await.unwrap();
        broken.write_all(FIRST.as_bytes()).await.unwrap();
        broken.write_all(b"{\"id\":2,]").await.unwrap();
        assert_closed_by_server(&mut broken).await;

        healthy
            .send(&DeviceRecord::new("healthy-2").with_device_id("dev-B"))
            .await
            .unwrap();
        wait_for(|| sink.len() == 3).await;

        let bodies: Vec<_> = sink.messages().into_iter().map(|m| m.body).collect();
        assert_eq!(
            bodies,
            vec![
                b"healthy-1".to_vec(),
                br#"{"t":21.5}"#.to_vec(),
                b"healthy-2".to_vec()
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_payload_round_trip() {
        let sink = MemorySink::new();
        let (_server, addr) = start(sink.clone()).await;

        let mut client = DeviceClient::connect(addr).await.unwrap();
        client.send(&DeviceRecord::new("").with_id(4)).await.unwrap();

        wait_for(|| sink.len() == 1).await;
        assert!(sink.messages()[0].body.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_connections_do_not_interleave() {
        let sink = MemorySink::new();
        let (_server, addr) = start(sink.clone()).await;

        let mut tasks = Vec::new();
        for device in 0..8 {
            tasks.push(tokio::spawn(async move {
                let mut client = DeviceClient::connect(addr).await.unwrap();
                for seq in 0..50 {
                    let body = format!("{device}:{seq}:{}", "z".repeat(512));
                    client
                        .send(&DeviceRecord::new(body).with_id(seq))
                        .await
                        .unwrap();
                }
                client.close().await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        wait_for(|| sink.len() == 400).await;

        let mut next_seq = [0usize; 8];
        for message in sink.messages() {
            let body = String::from_utf8(message.body).unwrap();
            let mut parts = body.splitn(3, ':');
            let device: usize = parts.next().unwrap().parse().unwrap();
            let seq: usize = parts.next().unwrap().parse().unwrap();
            assert_eq!(parts.next().unwrap(), "z".repeat(512));
            assert_eq!(seq, next_seq[device], "device {device} out of order");
            next_seq[device] += 1;
        }
        assert!(next_seq.iter().all(|&n| n == 50));
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_connection_open() {
        let sink = MemorySink::new().reject_when(|body| body == b"poison");
        let (server, addr) = start(sink.clone()).await;

        let mut client = DeviceClient::connect(addr).await.unwrap();
        client.send(&DeviceRecord::new("one")).await.unwrap();
        client.send(&DeviceRecord::new("poison")).await.unwrap();
        client.send(&DeviceRecord::new("two")).await.unwrap();

        wait_for(|| sink.len() == 2).await;
        assert_eq!(server.stats().publish_errors_total.load(Ordering::Relaxed), 1);
        assert_eq!(server.stats().connections_active.load(Ordering::Relaxed), 1);

        client.send(&DeviceRecord::new("three")).await.unwrap();
        wait_for(|| sink.len() == 3).await;
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let sink = MemorySink::new();
        let config =
            ServerConfig::new("127.0.0.1:0".parse().unwrap()).with_max_connections(1);
        let (server, addr) = start_with(config, sink.clone()).await;

        let mut first = DeviceClient::connect(addr).await.unwrap();
        first.send(&DeviceRecord::new("admitted")).await.unwrap();
        wait_for(|| sink.len() == 1).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        assert_closed_by_server(&mut second).await;
        assert_eq!(server.stats().connections_rejected.load(Ordering::Relaxed), 1);

        first.send(&DeviceRecord::new("still here")).await.unwrap();
        wait_for(|| sink.len() == 2).await;
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let sink = MemorySink::new();
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
            .with_idle_timeout(Duration::from_millis(100));
        let (server, addr) = start_with(config, sink).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert_closed_by_server(&mut stream).await;
        wait_for(|| server.stats().connections_active.load(Ordering::Relaxed) == 0).await;
        assert_eq!(server.stats().decode_errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (server, addr) = start(MemorySink::new()).await;
        wait_for(|| server.is_running()).await;
        assert_eq!(server.local_addr(), Some(addr));

        server.shutdown();
        wait_for(|| !server.is_running()).await;
    }
}
