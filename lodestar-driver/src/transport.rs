//! Byte transport and command execution over it.
//!
//! [`Transport`] is the seam between the driver and the network: it takes
//! an encoded request for an address and hands back the encoded reply.
//! [`Connection`] layers framing, timeouts and cancellation on top.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lodestar_bson::binary::{ReaderSettings, WriterSettings};
use lodestar_bson::{Bson, Document};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::{DriverError, DriverResult};
use crate::topology::ServerAddress;
use crate::wire::{DEFAULT_MAX_MESSAGE_SIZE, HEADER_LENGTH, Message};

/// An encoded reply.
pub type ResponseBytes = Vec<u8>;

/// Moves encoded messages to a server and back.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and wait for its reply.
    async fn send(&self, address: &ServerAddress, request: &[u8]) -> DriverResult<ResponseBytes>;
}

/// A cooperative cancellation flag shared between a caller and the
/// operations it started. Clones observe the same flag.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    state: Arc<watch::Sender<bool>>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { state: Arc::new(sender) }
    }

    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings applied to every command on a connection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionSettings {
    pub reader: ReaderSettings,
    pub writer: WriterSettings,
    /// `None` waits for the reply indefinitely.
    pub command_timeout: Option<Duration>,
}

/// Runs commands against one server.
#[derive(Clone)]
pub struct Connection {
    address: ServerAddress,
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(address: ServerAddress, transport: Arc<dyn Transport>, settings: ConnectionSettings) -> Self {
        Self {
            address,
            transport,
            settings,
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Run `command` against `database` and return the reply body.
    ///
    /// Fails with [`DriverError::Timeout`] when the configured command
    /// timeout expires, [`DriverError::Cancelled`] when `cancel` fires first,
    /// and [`DriverError::Command`] when the server answers `ok: 0`.
    pub async fn run_command(&self, database: &str, command: Document, cancel: &CancellationSignal) -> DriverResult<Document> {
        if cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        let command_name = command.keys().next().cloned().unwrap_or_default();
        let mut body = command;
        body.insert("$db", database);
        let request = Message::request(body);
        let bytes = request.encode(&self.settings.writer)?;
        trace!(
            address = %self.address,
            command = %command_name,
            request_id = request.request_id,
            size = bytes.len(),
            "sending command"
        );

        let exchange = self.transport.send(&self.address, &bytes);
        let reply = match self.settings.command_timeout {
            Some(limit) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DriverError::Cancelled),
                outcome = tokio::time::timeout(limit, exchange) => match outcome {
                    Ok(reply) => reply,
                    Err(_) => Err(DriverError::timeout(format!("command '{command_name}'"), limit)),
                },
            },
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DriverError::Cancelled),
                reply = exchange => reply,
            },
        }?;

        let reply = Message::decode(&reply, &self.settings.reader)?;
        if reply.response_to != request.request_id {
            return Err(DriverError::protocol(format!(
                "reply responds to request {} but {} was sent",
                reply.response_to, request.request_id
            )));
        }
        check_ok(reply.body)
    }
}

/// Turn an `ok: 0` reply into [`DriverError::Command`].
fn check_ok(body: Document) -> DriverResult<Document> {
    let ok = body.get("ok").and_then(Bson::to_f64_lossy).unwrap_or(0.0);
    if ok == 1.0 {
        return Ok(body);
    }
    let code = body.get("code").and_then(Bson::to_i64_exact).unwrap_or(0);
    Err(DriverError::Command {
        code: i32::try_from(code).unwrap_or(i32::MAX),
        code_name: body.get("codeName").and_then(Bson::as_str).unwrap_or("").to_string(),
        message: body.get("errmsg").and_then(Bson::as_str).unwrap_or("unknown error").to_string(),
    })
}

/// A TCP transport keeping one stream per server.
///
/// Requests to the same server are serialized on its stream. A stream that
/// fails mid-exchange is dropped and reopened by the next request.
pub struct TcpTransport {
    connect_timeout: Duration,
    max_message_size: usize,
    streams: parking_lot::Mutex<HashMap<ServerAddress, Arc<tokio::sync::Mutex<TcpStream>>>>,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            streams: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    async fn stream(&self, address: &ServerAddress) -> DriverResult<Arc<tokio::sync::Mutex<TcpStream>>> {
        let existing = self.streams.lock().get(address).cloned();
        if let Some(stream) = existing {
            return Ok(stream);
        }
        debug!(address = %address, "opening connection");
        let connect = TcpStream::connect((address.host(), address.port()));
        let stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| DriverError::timeout(format!("connecting to {address}"), self.connect_timeout))??;
        stream.set_nodelay(true)?;
        let stream = Arc::new(tokio::sync::Mutex::new(stream));
        Ok(self.streams.lock().entry(address.clone()).or_insert(stream).clone())
    }

    async fn exchange(&self, stream: &mut TcpStream, request: &[u8]) -> DriverResult<ResponseBytes> {
        stream.write_all(request).await?;
        let mut prefix = [0u8; 4];
        stream.read_exact(&mut prefix).await?;
        let length = usize::try_from(i32::from_le_bytes(prefix))
            .map_err(|_| DriverError::protocol("negative message length"))?;
        if length < HEADER_LENGTH || length > self.max_message_size {
            return Err(DriverError::protocol(format!(
                "message length {length} is outside 16..={}",
                self.max_message_size
            )));
        }
        let mut reply = vec![0u8; length];
        reply[..4].copy_from_slice(&prefix);
        stream.read_exact(&mut reply[4..]).await?;
        Ok(reply)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, address: &ServerAddress, request: &[u8]) -> DriverResult<ResponseBytes> {
        let stream = self.stream(address).await?;
        let mut guard = stream.lock().await;
        let result = self.exchange(&mut guard, request).await;
        if let Err(err) = &result {
            warn!(address = %address, error = %err, "dropping connection");
            self.streams.lock().remove(address);
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lodestar_bson::doc;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    /// Answers each request with a canned reply, recording what was sent.
    pub(crate) struct ScriptedTransport {
        pub(crate) replies: Mutex<HashMap<ServerAddress, Document>>,
        pub(crate) sent: Mutex<Vec<(ServerAddress, Document)>>,
        pub(crate) delay: Option<Duration>,
    }

    impl ScriptedTransport {
        pub(crate) fn new() -> Self {
            Self {
                replies: Mutex::new(HashMap::new()),
                sent: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        pub(crate) fn reply(self, address: &str, body: Document) -> Self {
            self.replies.lock().insert(ServerAddress::parse(address).unwrap(), body);
            self
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, address: &ServerAddress, request: &[u8]) -> DriverResult<ResponseBytes> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let request = Message::decode(request, &ReaderSettings::default())?;
            self.sent.lock().push((address.clone(), request.body.clone()));
            let body = self
                .replies
                .lock()
                .get(address)
                .cloned()
                .ok_or_else(|| DriverError::transport(format!("connection refused: {address}")))?;
            request.reply(body).encode(&WriterSettings::default())
        }
    }

    fn connection(transport: ScriptedTransport, timeout: Option<Duration>) -> Connection {
        Connection::new(
            ServerAddress::parse("a:27017").unwrap(),
            Arc::new(transport),
            ConnectionSettings {
                command_timeout: timeout,
                ..ConnectionSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_run_command_adds_db_and_returns_body() {
        let transport = Arc::new(ScriptedTransport::new().reply("a:27017", doc! { "ok" => 1.0, "n" => 3 }));
        let conn = Connection::new(ServerAddress::parse("a").unwrap(), transport.clone(), ConnectionSettings::default());
        let reply = conn
            .run_command("shop", doc! { "count" => "orders" }, &CancellationSignal::new())
            .await
            .unwrap();
        assert_eq!(reply, doc! { "ok" => 1.0, "n" => 3 });
        assert_eq!(transport.sent.lock()[0].1, doc! { "count" => "orders", "$db" => "shop" });
    }

    #[tokio::test]
    async fn test_command_failure_maps_to_error() {
        let transport = ScriptedTransport::new().reply(
            "a:27017",
            doc! { "ok" => 0.0, "code" => 13, "codeName" => "Unauthorized", "errmsg" => "not authorized" },
        );
        let err = connection(transport, None)
            .run_command("admin", doc! { "ping" => 1 }, &CancellationSignal::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DriverError::Command {
                code: 13,
                code_name: "Unauthorized".to_string(),
                message: "not authorized".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let mut transport = ScriptedTransport::new().reply("a:27017", doc! { "ok" => 1 });
        transport.delay = Some(Duration::from_millis(200));
        let err = connection(transport, Some(Duration::from_millis(10)))
            .run_command("admin", doc! { "ping" => 1 }, &CancellationSignal::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err}");
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_slow_reply() {
        let mut transport = ScriptedTransport::new().reply("a:27017", doc! { "ok" => 1 });
        transport.delay = Some(Duration::from_secs(5));
        let conn = connection(transport, None);
        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = conn.run_command("admin", doc! { "ping" => 1 }, &cancel).await.unwrap_err();
        assert_eq!(err, DriverError::Cancelled);
    }

    #[tokio::test]
    async fn test_already_cancelled_sends_nothing() {
        let transport = Arc::new(ScriptedTransport::new().reply("a:27017", doc! { "ok" => 1 }));
        let conn = Connection::new(ServerAddress::parse("a").unwrap(), transport.clone(), ConnectionSettings::default());
        let cancel = CancellationSignal::new();
        cancel.cancel();
        assert!(conn.run_command("admin", doc! { "ping" => 1 }, &cancel).await.unwrap_err().is_cancelled());
        assert!(transport.sent.lock().is_empty());
    }

    struct MisroutedTransport;

    #[async_trait]
    impl Transport for MisroutedTransport {
        async fn send(&self, _: &ServerAddress, _: &[u8]) -> DriverResult<ResponseBytes> {
            let stray = Message::request(doc! { "x" => 1 });
            stray.reply(doc! { "ok" => 1 }).encode(&WriterSettings::default())
        }
    }

    #[tokio::test]
    async fn test_response_to_must_match() {
        let conn = Connection::new(ServerAddress::parse("a").unwrap(), Arc::new(MisroutedTransport), ConnectionSettings::default());
        let err = conn
            .run_command("admin", doc! { "ping" => 1 }, &CancellationSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
    }
}
