//! Mock debug server and transcript replay helpers.
//!
//! Intended for:
//! - unit/integration tests of this crate
//! - downstream consumers testing against a scripted server
//! - regression tests using recorded wire "conversations"
//!
//! Gated behind `cfg(test)` or the `mock` Cargo feature.
//!
//! Besides scripted replies, a running [`MockServer`] accepts live
//! [`notify`](MockServer::notify) injections, which is how tests drive the
//! asynchronous update sequences of a scan after it has subscribed.

use std::{collections::HashMap, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};

use crate::{
    client::Endpoint,
    error::{Error, Result},
    types::{InstrumentDesc, InstrumentKind, ObjectId, ServerGreeting, ServerInfo, ServerVersion},
};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// How a command should be answered by the mock.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum MockReply {
    /// Successful `return` payload.
    Return(Value),

    /// Error response.
    Error {
        /// Error class.
        class: String,
        /// Error description.
        desc: String,
    },
}

impl MockReply {
    fn into_response(self, id: &Value) -> Value {
        match self {
            MockReply::Return(v) => serde_json::json!({"return": v, "id": id}),
            MockReply::Error { class, desc } => serde_json::json!({
                "error": {"class": class, "desc": desc},
                "id": id
            }),
        }
    }
}

/// A simple mock script.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Greeting to send.
    pub greeting: ServerGreeting,

    /// Map from command name to reply.
    pub replies: HashMap<String, MockReply>,

    /// Notifications to send right after the attach handshake.
    ///
    /// Flushed before replying to the first subsequent request, so a client
    /// has had a chance to set up its routing.
    pub post_attach_notifies: Vec<Value>,
}

impl MockScript {
    /// A greeting advertising one link tester with two lanes.
    #[must_use]
    pub fn default_greeting() -> ServerGreeting {
        ServerGreeting {
            server: ServerInfo {
                version: ServerVersion {
                    major: 1,
                    minor: 4,
                    micro: 0,
                },
                package: "mock".to_string(),
                instruments: vec![InstrumentDesc {
                    id: ObjectId::from("lt-0"),
                    kind: InstrumentKind::LinkTester,
                    lanes: vec![ObjectId::from("lane-0"), ObjectId::from("lane-1")],
                }],
                capabilities: vec!["notify".to_string()],
            },
        }
    }

    /// Create a script with the default greeting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            greeting: Self::default_greeting(),
            replies: HashMap::new(),
            post_attach_notifies: Vec::new(),
        }
    }

    /// Add a successful reply.
    #[must_use]
    pub fn reply_return(mut self, command: impl Into<String>, value: Value) -> Self {
        self.replies
            .insert(command.into(), MockReply::Return(value));
        self
    }

    /// Add an error reply.
    #[must_use]
    pub fn reply_error(
        mut self,
        command: impl Into<String>,
        class: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        self.replies.insert(
            command.into(),
            MockReply::Error {
                class: class.into(),
                desc: desc.into(),
            },
        );
        self
    }

    /// Add a notification to be sent after the attach handshake.
    #[must_use]
    pub fn post_notify(mut self, notify: Value) -> Self {
        self.post_attach_notifies.push(notify);
        self
    }
}

impl Default for MockScript {
    fn default() -> Self {
        Self::new()
    }
}

/// A running mock debug server.
///
/// Serves a single connection. Dropping the server shuts it down.
#[derive(Debug, Clone)]
pub struct MockServer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    endpoint: Endpoint,
    shutdown_tx: mpsc::Sender<()>,
    done_rx: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
    notify_tx: mpsc::UnboundedSender<Value>,
}

impl MockServer {
    /// Start a TCP mock server on 127.0.0.1:0 (ephemeral port).
    pub async fn start_tcp(script: MockScript) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(Error::from)?;
        let addr = listener.local_addr().map_err(Error::from)?;
        let endpoint = Endpoint::tcp(addr.ip().to_string(), addr.port());

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (done_tx, done_rx) = oneshot::channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            tokio::select! {
                _ = async {
                    match listener.accept().await {
                        Ok((stream, _peer)) => {
                            let _ = handle_connection_tcp(stream, script, notify_rx).await;
                        }
                        Err(_e) => {}
                    }
                } => {}
                _ = shutdown_rx.recv() => {}
            }

            let _ = done_tx.send(());
        });

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                shutdown_tx,
                done_rx: tokio::sync::Mutex::new(Some(done_rx)),
                notify_tx,
            }),
        })
    }

    /// Start a Unix mock server at the given path.
    #[cfg(unix)]
    pub async fn start_unix(path: impl AsRef<Path>, script: MockScript) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Best effort cleanup.
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path).map_err(Error::from)?;
        let endpoint = Endpoint::unix(path);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (done_tx, done_rx) = oneshot::channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            tokio::select! {
                _ = async {
                    match listener.accept().await {
                        Ok((stream, _addr)) => {
                            let _ = handle_connection_unix(stream, script, notify_rx).await;
                        }
                        Err(_e) => {}
                    }
                } => {}
                _ = shutdown_rx.recv() => {}
            }

            let _ = done_tx.send(());
        });

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                shutdown_tx,
                done_rx: tokio::sync::Mutex::new(Some(done_rx)),
                notify_tx,
            }),
        })
    }

    /// Endpoint clients should connect to.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint.clone()
    }

    /// Push a property-change notification for an object over the live
    /// connection, with a zero timestamp.
    ///
    /// `changed` must be a JSON object mapping property names to values.
    /// Silently ignored if no connection is up.
    pub fn notify(&self, object: impl Into<ObjectId>, changed: Value) {
        let msg = serde_json::json!({
            "notify": object.into(),
            "changed": changed,
            "timestamp": {"seconds": 0, "microseconds": 0}
        });
        self.notify_raw(msg);
    }

    /// Push an arbitrary raw message over the live connection.
    pub fn notify_raw(&self, msg: Value) {
        let _ = self.inner.notify_tx.send(msg);
    }

    /// Shut down the server and wait for completion.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(()).await;
        let mut rx = self.inner.done_rx.lock().await;
        if let Some(done) = rx.take() {
            let _ = done.await;
        }
    }
}

async fn handle_connection_tcp(
    stream: TcpStream,
    script: MockScript,
    notify_rx: mpsc::UnboundedReceiver<Value>,
) -> Result<()> {
    handle_connection(stream, script, notify_rx).await
}

#[cfg(unix)]
async fn handle_connection_unix(
    stream: UnixStream,
    script: MockScript,
    notify_rx: mpsc::UnboundedReceiver<Value>,
) -> Result<()> {
    handle_connection(stream, script, notify_rx).await
}

async fn handle_connection<S>(
    stream: S,
    mut script: MockScript,
    mut notify_rx: mpsc::UnboundedReceiver<Value>,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (r, w) = tokio::io::split(stream);
    let mut r = BufReader::new(r);

    // All writes go through one task so scripted replies and injected
    // notifications cannot interleave mid-line.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut w = w;
        while let Some(msg) = out_rx.recv().await {
            if send_json(&mut w, &msg).await.is_err() {
                break;
            }
        }
    });

    let forwarder_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(msg) = notify_rx.recv().await {
            if forwarder_tx.send(msg).is_err() {
                break;
            }
        }
    });

    let result = serve(&mut r, &out_tx, &mut script).await;

    drop(out_tx);
    forwarder.abort();
    let _ = writer.await;

    result
}

async fn serve<R>(
    r: &mut R,
    out_tx: &mpsc::UnboundedSender<Value>,
    script: &mut MockScript,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let send = |msg: Value| {
        out_tx
            .send(msg)
            .map_err(|_| Error::Disconnected)
    };

    // Greeting.
    send(serde_json::to_value(&script.greeting).map_err(Error::from)?)?;

    // Expect attach.
    let req = recv_json(r).await?;
    let id = req.get("id").cloned().unwrap_or_else(|| Value::from(0));

    let execute = req.get("execute").and_then(|v| v.as_str()).unwrap_or("");
    if execute != "attach" {
        send(serde_json::json!({
            "error": {"class": "ProtocolError", "desc": "expected attach"},
            "id": id
        }))?;
        return Ok(());
    }

    send(serde_json::json!({"return": {}, "id": id}))?;

    // Serve commands.
    let mut pending_notifies = std::mem::take(&mut script.post_attach_notifies);

    loop {
        let req = match recv_json(r).await {
            Ok(v) => v,
            Err(Error::Disconnected) => return Ok(()),
            Err(e) => return Err(e),
        };

        if !pending_notifies.is_empty() {
            for n in pending_notifies.drain(..) {
                send(n)?;
            }
        }

        let id = req.get("id").cloned().unwrap_or(Value::from(0));
        let execute = req
            .get("execute")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let reply = script
            .replies
            .get(&execute)
            .cloned()
            .unwrap_or_else(|| MockReply::Error {
                class: "CommandNotFound".to_string(),
                desc: format!("no mock reply for '{execute}'"),
            });

        send(reply.into_response(&id))?;
    }
}

async fn send_json<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, msg: &Value) -> Result<()> {
    let line = msg.to_string();
    w.write_all(line.as_bytes()).await.map_err(Error::from)?;
    w.write_all(b"\r\n").await.map_err(Error::from)?;
    w.flush().await.map_err(Error::from)?;
    Ok(())
}

async fn recv_json<R: tokio::io::AsyncBufRead + Unpin>(r: &mut R) -> Result<Value> {
    let mut line = String::new();
    let n = r.read_line(&mut line).await.map_err(Error::from)?;
    if n == 0 {
        return Err(Error::Disconnected);
    }

    let line = line.trim_end_matches(['\r', '\n']);
    serde_json::from_str(line).map_err(Error::from)
}

/// A transcript step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "dir", rename_all = "lowercase")]
pub enum TranscriptStep {
    /// A message sent by the server.
    Server {
        /// Message payload.
        msg: Value,
    },
    /// A message expected from the client.
    Client {
        /// Message payload.
        msg: Value,
    },
}

/// A JSONL transcript, suitable for replay.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    /// Ordered transcript steps.
    pub steps: Vec<TranscriptStep>,
}

impl Transcript {
    /// Parse from JSON Lines content.
    pub fn from_jsonl_str(s: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for (idx, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let step: TranscriptStep = serde_json::from_str(line).map_err(|e| Error::Protocol {
                message: format!("invalid jsonl at line {}: {}", idx + 1, e),
            })?;
            steps.push(step);
        }

        Ok(Self { steps })
    }

    /// Load a transcript from a JSONL file.
    pub fn from_jsonl_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(Error::from)?;
        Self::from_jsonl_str(&data)
    }
}

/// Replay a transcript by acting as a debug server.
///
/// Sends and expects messages exactly as recorded.
#[derive(Debug)]
pub struct ReplayServer {
    endpoint: Endpoint,
    shutdown_tx: mpsc::Sender<()>,
    done_rx: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
}

impl ReplayServer {
    /// Start a replay server on TCP.
    pub async fn start_tcp(transcript: Transcript) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(Error::from)?;
        let addr = listener.local_addr().map_err(Error::from)?;
        let endpoint = Endpoint::tcp(addr.ip().to_string(), addr.port());

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::select! {
                _ = async {
                    match listener.accept().await {
                        Ok((stream, _peer)) => {
                            let _ = replay_connection(stream, transcript).await;
                        }
                        Err(_e) => {}
                    }
                } => {}
                _ = shutdown_rx.recv() => {}
            }

            let _ = done_tx.send(());
        });

        Ok(Self {
            endpoint,
            shutdown_tx,
            done_rx: tokio::sync::Mutex::new(Some(done_rx)),
        })
    }

    /// Endpoint clients should connect to.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// Shut down the server.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
        let mut rx = self.done_rx.lock().await;
        if let Some(done) = rx.take() {
            let _ = done.await;
        }
    }
}

async fn replay_connection<S>(stream: S, transcript: Transcript) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (r, mut w) = tokio::io::split(stream);
    let mut r = BufReader::new(r);

    for step in transcript.steps {
        match step {
            TranscriptStep::Server { msg } => {
                send_json(&mut w, &msg).await?;
            }
            TranscriptStep::Client { msg: expected } => {
                let got = recv_json(&mut r).await?;

                if got != expected {
                    return Err(Error::Protocol {
                        message: format!("transcript mismatch: expected {expected}, got {got}"),
                    });
                }
            }
        }
    }

    Ok(())
}
