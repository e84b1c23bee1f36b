//! Asynchronous debug-server client.

use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::{Mutex, broadcast, oneshot},
};

use crate::{
    bus::PropertyChangeBus,
    cancel::CancelToken,
    error::{Error, Result},
    notify_stream::NotifyStream,
    types::{CommandResponse, NotifyMessage, ObjectId, ServerGreeting, Timestamp},
};

/// Debug-server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Connect via a Unix domain socket.
    Unix {
        /// Socket path.
        path: PathBuf,
    },

    /// Connect via a TCP socket.
    Tcp {
        /// Hostname or IP.
        host: String,
        /// Port.
        port: u16,
    },
}

impl Endpoint {
    /// Create a Unix socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Create a TCP endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }
}

/// Options controlling how the connection is established.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Protocol capabilities to enable during the `attach` handshake.
    ///
    /// Leaving this empty performs a plain `attach` without arguments.
    pub enable_capabilities: Vec<String>,

    /// Size of the raw notification broadcast buffer.
    ///
    /// If a [`NotifyStream`] consumer lags behind, notifications are dropped
    /// for that consumer and surfaced as [`Error::Lagged`]. Bus routing is
    /// unaffected.
    pub notify_buffer: usize,

    /// Default timeout for command calls.
    ///
    /// Individual calls can override this via [`CallOptions`].
    pub default_timeout: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            enable_capabilities: Vec::new(),
            notify_buffer: 1024,
            default_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Options for a single command call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Override the default timeout.
    pub timeout: Option<Duration>,

    /// A cancellation token.
    pub cancel: Option<CancelToken>,
}

/// Client builder.
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    endpoint: Endpoint,
    options: ConnectOptions,
}

impl ClientBuilder {
    /// Set capabilities to enable during the attach handshake.
    #[must_use]
    pub fn enable_capabilities(mut self, caps: impl Into<Vec<String>>) -> Self {
        self.options.enable_capabilities = caps.into();
        self
    }

    /// Set the raw notification buffer size.
    #[must_use]
    pub fn notify_buffer(mut self, size: usize) -> Self {
        self.options.notify_buffer = size;
        self
    }

    /// Set the default command timeout.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.default_timeout = timeout;
        self
    }

    /// Connect and perform the attach handshake.
    pub async fn connect(self) -> Result<Client> {
        Client::connect_with_options(self.endpoint, self.options).await
    }
}

/// An async client for a remote hardware-debug server.
///
/// The client owns a single reader task that delivers every server message:
/// command replies resolve their pending calls, property-change
/// notifications are routed to the per-object [`PropertyChangeBus`]. All
/// public methods may be called from any task.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    writer: Mutex<Writer>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<CommandResponse>>>>,
    next_id: AtomicU64,
    notify_tx: broadcast::Sender<NotifyMessage>,
    buses: StdMutex<HashMap<ObjectId, Arc<PropertyChangeBus>>>,
    default_timeout: Option<Duration>,
    greeting: ServerGreeting,
}

struct Writer {
    /// The underlying write half.
    w: Box<dyn tokio::io::AsyncWrite + Unpin + Send>,
}

impl Writer {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.w
            .write_all(line.as_bytes())
            .await
            .map_err(Error::from)?;
        self.w.write_all(b"\r\n").await.map_err(Error::from)?;
        self.w.flush().await.map_err(Error::from)?;
        Ok(())
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer").finish()
    }
}

impl Client {
    /// Create a builder for the given endpoint.
    #[must_use]
    pub fn builder(endpoint: Endpoint) -> ClientBuilder {
        ClientBuilder {
            endpoint,
            options: ConnectOptions::default(),
        }
    }

    /// Connect to an endpoint with default options.
    pub async fn connect(endpoint: Endpoint) -> Result<Client> {
        Self::connect_with_options(endpoint, ConnectOptions::default()).await
    }

    /// Connect to an endpoint and perform the attach handshake.
    pub async fn connect_with_options(
        endpoint: Endpoint,
        options: ConnectOptions,
    ) -> Result<Client> {
        let stream = crate::transport::connect(endpoint).await?;
        let (r, w) = tokio::io::split(stream);

        let mut reader = BufReader::new(r);

        // 1) Greeting.
        let greeting = read_json_line::<ServerGreeting>(&mut reader).await?;

        tracing::debug!(
            server_major = greeting.server.version.major,
            server_minor = greeting.server.version.minor,
            server_micro = greeting.server.version.micro,
            instruments = greeting.server.instruments.len(),
            caps = ?greeting.server.capabilities,
            "received debug-server greeting"
        );

        // 2) Attach.
        let mut writer = Writer { w: Box::new(w) };

        let attach_req = build_attach_request(0, &options.enable_capabilities);
        writer.send_line(&attach_req).await?;

        let attach_resp = read_json_line::<CommandResponse>(&mut reader).await?;
        if attach_resp.error.is_some() {
            return Err(Error::protocol("attach returned an error"));
        }

        let (notify_tx, _notify_rx) = broadcast::channel(options.notify_buffer.max(1));

        let client = Client {
            inner: Arc::new(Inner {
                writer: Mutex::new(writer),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                notify_tx,
                buses: StdMutex::new(HashMap::new()),
                default_timeout: options.default_timeout,
                greeting: greeting.clone(),
            }),
        };

        // Start the reader task.
        client.spawn_reader(reader);

        Ok(client)
    }

    /// The greeting received during handshake.
    #[must_use]
    pub fn greeting(&self) -> ServerGreeting {
        self.inner.greeting.clone()
    }

    /// Subscribe to the raw notification stream.
    #[must_use]
    pub fn notifications(&self) -> NotifyStream {
        NotifyStream::new(self.inner.notify_tx.subscribe())
    }

    /// The property-change bus for a remote object, created on first use.
    ///
    /// Creation is idempotent: only the first call for a given object
    /// installs the routing entry, so exactly one low-level delivery path
    /// exists per object no matter how many subscriptions are made.
    #[must_use]
    pub fn bus(&self, object: &ObjectId) -> Arc<PropertyChangeBus> {
        let mut buses = self.inner.buses.lock().expect("bus map poisoned");
        buses
            .entry(object.clone())
            .or_insert_with(|| Arc::new(PropertyChangeBus::new(object.clone())))
            .clone()
    }

    /// Drop the routing entry for an object whose bus has no live names.
    ///
    /// Operation handles are one per start cycle, so without this a
    /// long-lived session would accumulate one dead bus per retired cycle.
    /// Called after unsubscribing from a retired update channel; a bus that
    /// still has active names is left in place. Callers holding an `Arc` to
    /// a released bus must re-fetch it through [`Client::bus`] before
    /// subscribing again, or their subscription will not receive routed
    /// notifications.
    pub(crate) fn release_bus(&self, object: &ObjectId) {
        let mut buses = self.inner.buses.lock().expect("bus map poisoned");
        let retired = buses
            .get(object)
            .is_some_and(|bus| bus.active_names().is_empty());
        if retired {
            buses.remove(object);
        }
    }

    /// Execute a session-scoped command (one not addressed to an object).
    ///
    /// `args` is serialized into the `arguments` field; the return value is
    /// deserialized from the server's `return` field.
    pub async fn execute<A, R>(&self, command: &str, args: Option<A>) -> Result<R>
    where
        A: Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.call(None, command, args, CallOptions::default()).await
    }

    /// Execute a command addressed to a remote object.
    pub async fn command<A, R>(&self, object: &ObjectId, command: &str, args: Option<A>) -> Result<R>
    where
        A: Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.call(Some(object), command, args, CallOptions::default())
            .await
    }

    /// Execute an object-scoped command with per-call options.
    pub async fn command_with_options<A, R>(
        &self,
        object: &ObjectId,
        command: &str,
        args: Option<A>,
        options: CallOptions,
    ) -> Result<R>
    where
        A: Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.call(Some(object), command, args, options).await
    }

    /// Synchronous snapshot read of named properties on an object.
    ///
    /// This bypasses the notification path entirely; use it for one-time
    /// reads, not for tracking.
    pub async fn get_properties(
        &self,
        object: &ObjectId,
        names: &[&str],
    ) -> Result<HashMap<String, Value>> {
        self.command(
            object,
            "read-properties",
            Some(serde_json::json!({ "names": names })),
        )
        .await
    }

    async fn call<A, R>(
        &self,
        object: Option<&ObjectId>,
        command: &str,
        args: Option<A>,
        options: CallOptions,
    ) -> Result<R>
    where
        A: Serialize,
        R: serde::de::DeserializeOwned,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let request_json = build_command_request(id, object, command, args.as_ref());

        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, tx);
        }

        // Send the request.
        {
            let mut writer = self.inner.writer.lock().await;

            tracing::trace!(id = id, command = command, "sending request");

            if let Err(e) = writer.send_line(&request_json).await {
                // Fail fast: remove the pending entry if we couldn't even send.
                let mut pending = self.inner.pending.lock().await;
                pending.remove(&id);
                return Err(e);
            }
        }

        let timeout = options.timeout.or(self.inner.default_timeout);

        let resp = match (timeout, options.cancel) {
            (Some(t), Some(cancel)) => {
                tokio::select! {
                    biased;
                    r = rx => r,
                    _ = tokio::time::sleep(t) => {
                        self.drop_pending(id).await;
                        return Err(Error::Timeout { timeout: t });
                    }
                    _ = cancel.cancelled() => {
                        self.drop_pending(id).await;
                        return Err(Error::Cancelled);
                    }
                }
            }
            (Some(t), None) => {
                tokio::select! {
                    biased;
                    r = rx => r,
                    _ = tokio::time::sleep(t) => {
                        self.drop_pending(id).await;
                        return Err(Error::Timeout { timeout: t });
                    }
                }
            }
            (None, Some(cancel)) => {
                tokio::select! {
                    biased;
                    r = rx => r,
                    _ = cancel.cancelled() => {
                        self.drop_pending(id).await;
                        return Err(Error::Cancelled);
                    }
                }
            }
            (None, None) => rx.await,
        };

        let resp = match resp {
            Ok(r) => r?,
            Err(_closed) => {
                // Sender dropped: the reader task ended.
                return Err(Error::Disconnected);
            }
        };

        tracing::trace!(id = id, command = command, "received response");

        decode_command_response::<R>(command, resp)
    }

    async fn drop_pending(&self, id: u64) {
        let mut pending = self.inner.pending.lock().await;
        pending.remove(&id);
    }

    fn spawn_reader(&self, reader: BufReader<tokio::io::ReadHalf<crate::transport::DebugStream>>) {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let mut reader = reader;
            loop {
                let msg: Value = match read_json_line::<Value>(&mut reader).await {
                    Ok(v) => v,
                    Err(e) => {
                        // Connection likely closed or broken.
                        let mut pending = inner.pending.lock().await;
                        for (_, tx) in pending.drain() {
                            let _ = tx.send(Err(e.clone_for_task()));
                        }
                        break;
                    }
                };

                // Notification?
                if msg.get("notify").is_some() {
                    match serde_json::from_value::<NotifyMessage>(msg) {
                        Ok(n) => route_notification(&inner, n),
                        Err(e) => {
                            tracing::warn!(error = %e, "ignoring malformed notification");
                        }
                    }
                    continue;
                }

                // Response?
                if msg.get("id").is_some() {
                    match serde_json::from_value::<CommandResponse>(msg) {
                        Ok(resp) => {
                            if let Some(id) = resp.id.as_u64() {
                                let tx = {
                                    let mut pending = inner.pending.lock().await;
                                    pending.remove(&id)
                                };

                                if let Some(tx) = tx {
                                    let _ = tx.send(Ok(resp));
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "ignoring malformed response");
                        }
                    }

                    continue;
                }

                // Unhandled message kind.
            }
        });
    }
}

/// Route one notification: bus dispatch for the addressed object, then the
/// raw broadcast. Runs on the reader task; must not block or re-enter the
/// transport.
fn route_notification(inner: &Inner, msg: NotifyMessage) {
    let bus = {
        let buses = inner.buses.lock().expect("bus map poisoned");
        buses.get(&msg.object).cloned()
    };

    if let Some(bus) = bus {
        let timestamp = msg.timestamp.unwrap_or_else(Timestamp::zero);
        let changed: Vec<(String, Value)> = msg
            .changed
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        bus.dispatch(&changed, timestamp);
    }

    tracing::trace!(object = %msg.object, names = msg.changed.len(), "notification");
    let _ = inner.notify_tx.send(msg);
}

fn build_attach_request(id: u64, enable: &[String]) -> String {
    if enable.is_empty() {
        serde_json::json!({"execute": "attach", "id": id}).to_string()
    } else {
        serde_json::json!({
            "execute": "attach",
            "arguments": { "enable": enable },
            "id": id
        })
        .to_string()
    }
}

fn build_command_request<A: Serialize>(
    id: u64,
    object: Option<&ObjectId>,
    command: &str,
    args: Option<&A>,
) -> String {
    let mut req = serde_json::Map::new();
    req.insert("execute".to_string(), Value::from(command));
    if let Some(object) = object {
        req.insert("object".to_string(), Value::from(object.as_str()));
    }
    if let Some(a) = args {
        if let Ok(v) = serde_json::to_value(a) {
            req.insert("arguments".to_string(), v);
        }
    }
    req.insert("id".to_string(), Value::from(id));
    Value::Object(req).to_string()
}

fn decode_command_response<R: serde::de::DeserializeOwned>(
    command: &str,
    resp: CommandResponse,
) -> Result<R> {
    if let Some(err) = resp.error {
        return Err(Error::remote(command, err.class, err.desc));
    }

    let value = resp
        .result
        .ok_or_else(|| Error::protocol("missing 'return' field in response"))?;

    deserialize_value::<R>(value).map_err(|e| Error::Protocol {
        message: format!("failed to decode response for '{command}': {e}"),
    })
}

fn deserialize_value<T: serde::de::DeserializeOwned>(v: Value) -> std::result::Result<T, String> {
    let line = v.to_string();
    let mut deserializer = serde_json::Deserializer::from_str(&line);
    match serde_path_to_error::deserialize(&mut deserializer) {
        Ok(t) => Ok(t),
        Err(e) => Err(e.to_string()),
    }
}

async fn read_json_line<T: serde::de::DeserializeOwned>(
    reader: &mut BufReader<tokio::io::ReadHalf<crate::transport::DebugStream>>,
) -> Result<T> {
    let mut line = String::new();
    let n: usize = reader.read_line(&mut line).await.map_err(Error::from)?;
    if n == 0 {
        return Err(Error::Disconnected);
    }

    // Strip trailing newlines.
    let line = line.trim_end_matches(['\r', '\n']);

    serde_json::from_str::<T>(line).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockScript, MockServer};

    #[tokio::test]
    async fn routing_entry_is_dropped_once_a_bus_has_no_names() {
        let server = MockServer::start_tcp(MockScript::new())
            .await
            .expect("mock server");
        let client = Client::connect(server.endpoint()).await.expect("connect");

        let object = ObjectId::from("scan-h0");
        let bus = client.bus(&object);
        bus.subscribe(["status"], Vec::new()).expect("subscribe");

        // A bus with live names survives a release attempt.
        client.release_bus(&object);
        assert_eq!(client.inner.buses.lock().unwrap().len(), 1);

        bus.unsubscribe(["status"]);
        client.release_bus(&object);
        assert!(client.inner.buses.lock().unwrap().is_empty());

        // Re-fetching creates a fresh routing entry.
        let _bus = client.bus(&object);
        assert_eq!(client.inner.buses.lock().unwrap().len(), 1);

        server.shutdown().await;
    }
}
