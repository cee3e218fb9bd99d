//! Connection management.

use crate::config::{NetworkConfig, DEFAULT_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE, MIN_READ_BUFFER_SIZE};
use crate::error::ClientError;
use crate::stream::{ClientStream, Transport};
use hsmwire_deadline::{Deadline, DeadlineCoordinator, DeadlineError, Delivery, RequestMeta};
use hsmwire_protocol::codec::last_segment;
use hsmwire_protocol::{
    encode_length_prefixed, Codec, CodecConfig, CommandTable, Direction, ExchangeMeta, Fields,
    FrameDecoder, Outcome,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// HSM address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Deadline applied to requests that carry none; `None` leaves them unbounded.
    pub request_timeout: Option<Duration>,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Some(Duration::from_secs(10)),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

impl From<&NetworkConfig> for ConnectionConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self::new(network.addr)
            .with_connect_timeout(network.connect_timeout())
            .with_request_timeout(network.request_timeout())
            .with_read_buffer_size(network.read_buffer_size)
    }
}

type Reply = Result<(Outcome, ExchangeMeta), ClientError>;
type PendingMap = parking_lot::Mutex<HashMap<String, oneshot::Sender<Reply>>>;

/// Removes a pending entry when its request ends, including by timeout.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    trace: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.trace);
    }
}

/// A persistent connection to an HSM.
///
/// Requests are multiplexed: each carries a trace number and replies are
/// matched to their request by trace, so replies may arrive in any order.
pub struct Connection {
    config: ConnectionConfig,
    /// Per-connection codec; owns the trace counter.
    codec: parking_lot::Mutex<Codec>,
    /// Write half of the stream (for sending requests).
    writer: Mutex<Option<WriteHalf<ClientStream>>>,
    /// Read half of the stream (for receiving responses).
    reader: Mutex<Option<ReadHalf<ClientStream>>>,
    /// Splits the byte stream into messages.
    decoder: Mutex<FrameDecoder>,
    /// Requests waiting for a reply, by trace.
    pending: PendingMap,
    connected: AtomicBool,
    coordinator: DeadlineCoordinator,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(
        config: ConnectionConfig,
        table: Arc<CommandTable>,
        codec_config: &CodecConfig,
        coordinator: DeadlineCoordinator,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            config,
            codec: parking_lot::Mutex::new(Codec::new(table, codec_config)?),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            decoder: Mutex::new(FrameDecoder::new()),
            pending: parking_lot::Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            coordinator,
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &DeadlineCoordinator {
        &self.coordinator
    }

    /// Connects to the HSM over TCP.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);

        let tcp_stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Io(e)
        })?;

        tcp_stream.set_nodelay(true).ok();
        self.install(ClientStream::Plain { stream: tcp_stream }).await;
        tracing::debug!("Connected to {}", self.config.addr);
        Ok(())
    }

    /// Uses an already-established stream as the transport.
    pub async fn attach(&self, stream: impl Transport + 'static) {
        self.install(ClientStream::attached(stream)).await;
    }

    async fn install(&self, stream: ClientStream) {
        tracing::debug!(
            "Installing {} transport",
            if stream.is_tcp() { "TCP" } else { "attached" }
        );
        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().await = Some(read_half);
        self.decoder.lock().await.clear();
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Sends a request and waits for the correlated reply.
    ///
    /// `deadline` bounds the exchange; without one the configured request
    /// timeout applies. Error statuses are returned as [`ClientError::Hsm`].
    pub async fn request(
        &self,
        method: &str,
        fields: &Fields,
        deadline: Option<Deadline>,
    ) -> Result<Fields, ClientError> {
        let meta = RequestMeta::new();
        let meta = match self.effective_deadline(deadline) {
            Some(deadline) => meta.with_deadline(deadline),
            None => meta,
        };

        match self.run(method, fields, meta).await {
            Delivery::Direct(result) => result,
            // Only reachable with a dispatch continuation, which `request` never sets.
            Delivery::Continued => Err(ClientError::ConnectionClosed),
        }
    }

    /// Like [`request`](Self::request), but a timeout is handed to
    /// `continuation` instead of being returned.
    ///
    /// Returns `None` when the timeout went to the continuation.
    pub async fn dispatch(
        &self,
        method: &str,
        fields: &Fields,
        deadline: Option<Deadline>,
        continuation: impl FnOnce(ClientError) + Send + 'static,
    ) -> Option<Result<Fields, ClientError>> {
        let meta = RequestMeta::new().with_dispatch(continuation);
        let meta = match self.effective_deadline(deadline) {
            Some(deadline) => meta.with_deadline(deadline),
            None => meta,
        };
        self.run(method, fields, meta).await.into_result()
    }

    fn effective_deadline(&self, deadline: Option<Deadline>) -> Option<Deadline> {
        deadline.or_else(|| {
            self.config
                .request_timeout
                .map(|timeout| self.coordinator.deadline_after(timeout))
        })
    }

    async fn run(
        &self,
        method: &str,
        fields: &Fields,
        meta: RequestMeta<ClientError>,
    ) -> Delivery<Fields, ClientError> {
        self.coordinator
            .start_operation(
                (method, fields),
                |(method, fields)| self.exchange(method, fields),
                meta,
                |waited| ClientError::Deadline(DeadlineError::timeout(waited)),
            )
            .await
    }

    async fn exchange(&self, method: &str, fields: &Fields) -> Result<Fields, ClientError> {
        if !self.connected.load(Ordering::SeqCst) {
            tracing::debug!("request() called but not connected");
            return Err(ClientError::NotConnected);
        }

        let mut meta = ExchangeMeta::request(method);
        let message = self.codec.lock().encode(fields, &mut meta)?;
        let trace = meta.trace.clone().unwrap_or_default();
        let framed = encode_length_prefixed(&message)?;

        let (tx, rx) = oneshot::channel();
        if self.pending.lock().insert(trace.clone(), tx).is_some() {
            tracing::warn!("Trace {} reused while a request was still pending", trace);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            trace: trace.clone(),
        };

        {
            let mut writer_guard = self.writer.lock().await;
            let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
            writer.write_all(&framed).await.map_err(ClientError::Io)?;
        }
        tracing::debug!(
            "Request {} trace={} sent ({} bytes), waiting for reply...",
            method,
            trace,
            framed.len()
        );

        let (outcome, reply) = rx.await.map_err(|_| {
            tracing::debug!("Request trace={} channel closed", trace);
            ClientError::ConnectionClosed
        })??;

        if reply.method != last_segment(method) {
            return Err(ClientError::UnexpectedReply(format!(
                "trace {} answered with {} for {}",
                trace, reply.method, method
            )));
        }

        match outcome {
            Outcome::Success(fields) => Ok(fields),
            Outcome::Failure(err) => Err(ClientError::Hsm(err)),
        }
    }

    /// Reads and dispatches replies (call this in a background task).
    ///
    /// Returns when the transport closes; pending requests then fail with
    /// [`ClientError::ConnectionClosed`].
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        tracing::debug!("read_loop started");
        let result = self.read_frames().await;
        self.connected.store(false, Ordering::SeqCst);
        let dropped = {
            let mut pending = self.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        tracing::debug!("read_loop stopped ({} pending requests dropped)", dropped);
        result
    }

    async fn read_frames(&self) -> Result<(), ClientError> {
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            let n = {
                let mut reader_guard = self.reader.lock().await;
                let reader = reader_guard.as_mut().ok_or(ClientError::NotConnected)?;
                reader.read(&mut buf).await.map_err(ClientError::Io)?
            };

            if n == 0 {
                tracing::debug!("read_loop: connection closed");
                return Err(ClientError::ConnectionClosed);
            }

            let mut decoder = self.decoder.lock().await;
            decoder.extend(&buf[..n]);
            while let Some(message) = decoder.next_message() {
                self.deliver(&message);
            }
        }
    }

    fn deliver(&self, message: &[u8]) {
        let mut meta = ExchangeMeta::default();
        let decoded = self.codec.lock().decode(message, &mut meta);

        let Some(trace) = meta.trace.clone() else {
            if let Err(e) = decoded {
                tracing::warn!("read_loop: dropping undecodable message: {}", e);
            }
            return;
        };

        let Some(tx) = self.pending.lock().remove(&trace) else {
            tracing::debug!("read_loop: no pending request for trace={}", trace);
            return;
        };

        let reply = match decoded {
            Ok(_) if meta.message_type == Some(Direction::Request) => {
                Err(ClientError::UnexpectedReply(format!(
                    "trace {} answered with a {} request",
                    trace, meta.method
                )))
            }
            Ok(outcome) => Ok((outcome, meta)),
            Err(e) => Err(ClientError::Protocol(e)),
        };
        let _ = tx.send(reply);
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        // The read loop may hold the reader; it stops at EOF.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }

        let mut pending = self.pending.lock();
        tracing::debug!("Clearing {} pending requests", pending.len());
        pending.clear();
        Ok(())
    }

    /// Returns the number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
