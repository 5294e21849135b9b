//! Remote executor transport: mutual-PSK stream with framed request/reply
//!
//! The remote daemon presents the same operation surface as the local
//! executor, reached over an authenticated stream. Every frame is an AEAD
//! box keyed off the shared PSK; inside is an id, a kind (request, reply,
//! notify) and the encoded payload.

use super::conn::ExecError;
use super::op::{ExecRequest, OpKey, OpResult, RscDefinition};
use crate::messaging::correlate::{CorrelationTable, Disposition};
use crate::types::now;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha3::{Digest, Sha3_256};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Protocol version spoken by this build. Mismatch is a hard error.
pub const REMOTE_PROTOCOL_VERSION: u32 = 1;

/// Ceiling on any synchronous wait, regardless of the caller's timeout.
pub const SYNC_CALL_CEILING: Duration = Duration::from_secs(10);

/// How long a loaded PSK stays usable before re-reading the file.
pub const PSK_CACHE_SECS: u64 = 60;

/// Upper bound on one encrypted frame.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

const NONCE_LEN: usize = 12;

/// Wire frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FrameKind {
    Request,
    Reply,
    Notify,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemoteFrame {
    pub id: u64,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

/// Handshake and operation payloads.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum RemotePayload {
    Hello { client: String, version: u32 },
    Welcome { version: u32, token: String },
    Request { token: String, op: RemoteOp },
    Reply { token: String, body: RemoteReplyBody },
    Notify { result: OpResult },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum RemoteOp {
    Exec(ExecRequest),
    Cancel(OpKey),
    Register(RscDefinition),
    Unregister(String),
    RscInfo(String),
    ListRecurring,
    ListStandards,
    ListProviders,
    ListAgents {
        class: String,
        provider: Option<String>,
    },
    Metadata(RscDefinition),
    Poke,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum RemoteReplyBody {
    CallId(i64),
    Recurring(Vec<OpKey>),
    Info(Option<RscDefinition>),
    Names(Vec<String>),
    Text(String),
    Ack,
    Err(String),
}

/// PSK file source with the 60-second in-memory cache.
#[derive(Debug)]
pub struct PskSource {
    pub primary: PathBuf,
    pub fallback: PathBuf,
    cached: Option<([u8; 32], u64)>,
}

impl PskSource {
    pub fn new(primary: &Path, fallback: &Path) -> Self {
        Self {
            primary: primary.to_path_buf(),
            fallback: fallback.to_path_buf(),
            cached: None,
        }
    }

    /// Derive the 32-byte transport key from whichever key file is present.
    pub fn key(&mut self) -> Result<[u8; 32], ExecError> {
        if let Some((key, fetched)) = self.cached {
            if now().saturating_sub(fetched) < PSK_CACHE_SECS {
                return Ok(key);
            }
        }
        let raw = std::fs::read(&self.primary)
            .or_else(|_| std::fs::read(&self.fallback))
            .map_err(|e| ExecError::Psk(e.to_string()))?;
        if raw.is_empty() {
            return Err(ExecError::Psk("empty key file".to_string()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha3_256::digest(&raw));
        self.cached = Some((key, now()));
        Ok(key)
    }
}

/// AEAD-framed stream shared by both handshake roles.
pub struct SecureStream {
    stream: TcpStream,
    cipher: ChaCha20Poly1305,
}

impl SecureStream {
    pub fn new(stream: TcpStream, key: &[u8; 32]) -> Self {
        Self {
            stream,
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub async fn write_frame(&mut self, frame: &RemoteFrame) -> Result<(), ExecError> {
        let plain = postcard::to_allocvec(frame).map_err(|e| ExecError::Codec(e.to_string()))?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain.as_slice())
            .map_err(|_| ExecError::Crypto)?;

        let len = (NONCE_LEN + sealed.len()) as u32;
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(&nonce).await?;
        self.stream.write_all(&sealed).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn read_frame(&mut self) -> Result<RemoteFrame, ExecError> {
        let mut len_bytes = [0u8; 4];
        self.stream.read_exact(&mut len_bytes).await?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len <= NONCE_LEN || len > MAX_FRAME_SIZE {
            return Err(ExecError::Protocol(format!("bad frame length {}", len)));
        }

        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await?;
        let (nonce, sealed) = buf.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| ExecError::Crypto)?;
        postcard::from_bytes(&plain).map_err(|e| ExecError::Codec(e.to_string()))
    }
}

/// Server half of the handshake: validate the hello, issue a token.
/// The daemon loop around it lives in the remote executor process.
pub async fn handshake_accept(stream: &mut SecureStream) -> Result<String, ExecError> {
    let frame = stream.read_frame().await?;
    let payload: RemotePayload =
        postcard::from_bytes(&frame.payload).map_err(|e| ExecError::Codec(e.to_string()))?;
    let RemotePayload::Hello { client, version } = payload else {
        return Err(ExecError::Protocol("expected hello".to_string()));
    };
    if version != REMOTE_PROTOCOL_VERSION {
        return Err(ExecError::ProtocolMismatch {
            ours: REMOTE_PROTOCOL_VERSION,
            theirs: version,
        });
    }

    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    let token = hex::encode(raw);
    info!("Remote client {} connected", client);

    let welcome = RemotePayload::Welcome {
        version: REMOTE_PROTOCOL_VERSION,
        token: token.clone(),
    };
    let reply = RemoteFrame {
        id: frame.id,
        kind: FrameKind::Reply,
        payload: postcard::to_allocvec(&welcome).map_err(|e| ExecError::Codec(e.to_string()))?,
    };
    stream.write_frame(&reply).await?;
    Ok(token)
}

/// Client connection to one node's remote executor daemon.
pub struct RemoteExecutor {
    node: String,
    addr: String,
    psk: PskSource,
    stream: Option<SecureStream>,
    corr: CorrelationTable<RemoteReplyBody>,
    token: Option<String>,
    notify_queue: VecDeque<OpResult>,
    events: mpsc::UnboundedSender<OpResult>,
}

impl RemoteExecutor {
    pub fn new(
        node: &str,
        addr: &str,
        psk: PskSource,
        events: mpsc::UnboundedSender<OpResult>,
    ) -> Self {
        Self {
            node: node.to_string(),
            addr: addr.to_string(),
            psk,
            stream: None,
            corr: CorrelationTable::new(),
            token: None,
            notify_queue: VecDeque::new(),
            events,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Connect and run the version/token handshake.
    pub async fn connect(&mut self) -> Result<(), ExecError> {
        let key = self.psk.key()?;
        let tcp = TcpStream::connect(&self.addr).await?;
        let mut stream = SecureStream::new(tcp, &key);

        let id = self.corr.next_id();
        let hello = RemotePayload::Hello {
            client: self.node.clone(),
            version: REMOTE_PROTOCOL_VERSION,
        };
        stream
            .write_frame(&RemoteFrame {
                id,
                kind: FrameKind::Request,
                payload: postcard::to_allocvec(&hello).map_err(|e| ExecError::Codec(e.to_string()))?,
            })
            .await?;

        let frame = timeout(SYNC_CALL_CEILING, stream.read_frame())
            .await
            .map_err(|_| ExecError::Timeout)??;
        let payload: RemotePayload =
            postcard::from_bytes(&frame.payload).map_err(|e| ExecError::Codec(e.to_string()))?;
        match payload {
            RemotePayload::Welcome { version, token } => {
                if version != REMOTE_PROTOCOL_VERSION {
                    return Err(ExecError::ProtocolMismatch {
                        ours: REMOTE_PROTOCOL_VERSION,
                        theirs: version,
                    });
                }
                info!("Connected to remote executor on {}", self.node);
                self.token = Some(token);
                self.stream = Some(stream);
                Ok(())
            }
            other => Err(ExecError::Protocol(format!(
                "expected welcome, got {:?}",
                kind_of(&other)
            ))),
        }
    }

    /// Bounded retry around the initial connect. Fatal protocol errors
    /// escalate immediately; transient ones back off and try again.
    pub async fn connect_with_retry(&mut self) -> Result<(), ExecError> {
        let mut delay = Duration::from_millis(100);
        for attempt in 1..=crate::messaging::outbox::CONNECT_RETRY_LIMIT {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!(
                        "Connect attempt {} to {} failed: {}",
                        attempt, self.node, e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
            }
        }
        Err(ExecError::NotConnected)
    }

    /// Drop the connection. Blocking waiters fail; fire-and-forget tokens
    /// survive so a straggler reply after reconnect is absorbed.
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            let failed = self.corr.fail_blocking();
            if failed > 0 {
                warn!(
                    "Remote executor {} dropped with {} requests in flight",
                    self.node, failed
                );
            }
        }
        self.token = None;
    }

    fn token(&self) -> Result<String, ExecError> {
        self.token.clone().ok_or(ExecError::NotConnected)
    }

    async fn send_request(&mut self, op: RemoteOp) -> Result<u64, ExecError> {
        let token = self.token()?;
        let id = self.corr.next_id();
        let payload = RemotePayload::Request { token, op };
        let frame = RemoteFrame {
            id,
            kind: FrameKind::Request,
            payload: postcard::to_allocvec(&payload).map_err(|e| ExecError::Codec(e.to_string()))?,
        };
        let stream = self.stream.as_mut().ok_or(ExecError::NotConnected)?;
        stream.write_frame(&frame).await?;
        Ok(id)
    }

    /// Issue a request and wait for its reply, clamped to the sync ceiling.
    /// A ceiling breach declares the connection dead.
    pub async fn request(
        &mut self,
        op: RemoteOp,
        wait: Duration,
    ) -> Result<RemoteReplyBody, ExecError> {
        let id = self.send_request(op).await?;
        let mut rx = self.corr.expect_reply(id);
        let deadline = wait.min(SYNC_CALL_CEILING);

        let pump = async {
            loop {
                if let Ok(body) = rx.try_recv() {
                    return Ok(body);
                }
                self.pump_one_frame().await?;
            }
        };

        match timeout(deadline, pump).await {
            Ok(Ok(body)) => {
                self.flush_notifications();
                Ok(body)
            }
            Ok(Err(e)) => {
                self.corr.cancel(id);
                self.disconnect();
                Err(e)
            }
            Err(_) => {
                self.corr.cancel(id);
                self.disconnect();
                Err(ExecError::Timeout)
            }
        }
    }

    /// Fire-and-forget: the framing still delivers a reply, so leave a drop
    /// token behind for it.
    pub async fn request_forget(&mut self, op: RemoteOp) -> Result<(), ExecError> {
        let id = self.send_request(op).await?;
        self.corr.expect_and_forget(id);
        Ok(())
    }

    /// Read one frame and route it. Replies go through the correlation
    /// table; a token mismatch terminates the connection; notifications are
    /// queued and dispatched after the current awaited reply completes.
    async fn pump_one_frame(&mut self) -> Result<(), ExecError> {
        let stream = self.stream.as_mut().ok_or(ExecError::NotConnected)?;
        let frame = stream.read_frame().await?;
        let payload: RemotePayload =
            postcard::from_bytes(&frame.payload).map_err(|e| ExecError::Codec(e.to_string()))?;
        match (frame.kind, payload) {
            (FrameKind::Reply, RemotePayload::Reply { token, body }) => {
                if Some(&token) != self.token.as_ref() {
                    warn!("Reply with foreign token from {}; dropping link", self.node);
                    return Err(ExecError::Protocol("token mismatch".to_string()));
                }
                match self.corr.complete(frame.id, body) {
                    Disposition::Delivered | Disposition::Absorbed => {}
                    Disposition::Outdated => {
                        debug!("Outdated reply {} from {}", frame.id, self.node)
                    }
                    Disposition::Unknown => {
                        debug!("Unmatched reply {} from {}", frame.id, self.node)
                    }
                }
                Ok(())
            }
            (FrameKind::Notify, RemotePayload::Notify { result }) => {
                self.notify_queue.push_back(result);
                Ok(())
            }
            (kind, _) => Err(ExecError::Protocol(format!(
                "unexpected {:?} frame",
                kind
            ))),
        }
    }

    fn flush_notifications(&mut self) {
        while let Some(result) = self.notify_queue.pop_front() {
            if self.events.send(result).is_err() {
                return;
            }
        }
    }

    /// Absorb any straggler replies currently readable, without blocking.
    pub async fn poll_incoming(&mut self) -> Result<(), ExecError> {
        if self.stream.is_none() {
            return Ok(());
        }
        match timeout(Duration::from_millis(1), self.pump_one_frame()).await {
            Ok(result) => {
                self.flush_notifications();
                result
            }
            Err(_) => Ok(()),
        }
    }
}

fn kind_of(payload: &RemotePayload) -> &'static str {
    match payload {
        RemotePayload::Hello { .. } => "hello",
        RemotePayload::Welcome { .. } => "welcome",
        RemotePayload::Request { .. } => "request",
        RemotePayload::Reply { .. } => "reply",
        RemotePayload::Notify { .. } => "notify",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha3_256::digest(b"test-psk"));
        key
    }

    fn write_psk() -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir();
        let primary = dir.join(format!("regent_psk_{}", std::process::id()));
        std::fs::write(&primary, b"test-psk").unwrap();
        (primary.clone(), primary)
    }

    async fn serve_one(listener: TcpListener, reply_with: RemoteReplyBody) {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut stream = SecureStream::new(tcp, &test_key());
        let token = handshake_accept(&mut stream).await.unwrap();

        let frame = stream.read_frame().await.unwrap();
        let reply = RemotePayload::Reply {
            token,
            body: reply_with,
        };
        stream
            .write_frame(&RemoteFrame {
                id: frame.id,
                kind: FrameKind::Reply,
                payload: postcard::to_allocvec(&reply).unwrap(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handshake_and_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(serve_one(listener, RemoteReplyBody::CallId(5)));

        let (primary, fallback) = write_psk();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut remote =
            RemoteExecutor::new("web1", &addr, PskSource::new(&primary, &fallback), tx);
        remote.connect().await.unwrap();
        assert!(remote.is_connected());

        let body = remote
            .request(RemoteOp::Poke, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(body, RemoteReplyBody::CallId(5)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_version_mismatch_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut stream = SecureStream::new(tcp, &test_key());
            let frame = stream.read_frame().await.unwrap();
            let bogus = RemotePayload::Welcome {
                version: REMOTE_PROTOCOL_VERSION + 1,
                token: "t".to_string(),
            };
            stream
                .write_frame(&RemoteFrame {
                    id: frame.id,
                    kind: FrameKind::Reply,
                    payload: postcard::to_allocvec(&bogus).unwrap(),
                })
                .await
                .unwrap();
        });

        let (primary, fallback) = write_psk();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut remote =
            RemoteExecutor::new("web1", &addr, PskSource::new(&primary, &fallback), tx);
        let err = remote.connect().await.unwrap_err();
        assert!(matches!(err, ExecError::ProtocolMismatch { .. }));
        assert!(!remote.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_reply_after_reconnect_absorbed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // First connection: handshake, read the fire-and-forget request,
        // then drop without replying. Second connection: handshake again
        // and deliver the straggler reply with the old id.
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut stream = SecureStream::new(tcp, &test_key());
            let _ = handshake_accept(&mut stream).await.unwrap();
            let frame = stream.read_frame().await.unwrap();
            let forgotten_id = frame.id;
            drop(stream);

            let (tcp, _) = listener.accept().await.unwrap();
            let mut stream = SecureStream::new(tcp, &test_key());
            let token = handshake_accept(&mut stream).await.unwrap();
            let reply = RemotePayload::Reply {
                token,
                body: RemoteReplyBody::Ack,
            };
            stream
                .write_frame(&RemoteFrame {
                    id: forgotten_id,
                    kind: FrameKind::Reply,
                    payload: postcard::to_allocvec(&reply).unwrap(),
                })
                .await
                .unwrap();
        });

        let (primary, fallback) = write_psk();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut remote =
            RemoteExecutor::new("web1", &addr, PskSource::new(&primary, &fallback), tx);

        remote.connect().await.unwrap();
        remote.request_forget(RemoteOp::Poke).await.unwrap();
        assert_eq!(remote.corr.pending_count(), 1);

        remote.disconnect();
        // The drop token survives the teardown.
        assert_eq!(remote.corr.pending_count(), 1);

        remote.connect().await.unwrap();
        // Give the straggler time to land in the socket buffer, then pull
        // frames until it is absorbed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..50 {
            remote.poll_incoming().await.unwrap();
            if remote.corr.pending_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(remote.corr.pending_count(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_psk_fails_decrypt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut wrong = [0u8; 32];
            wrong.copy_from_slice(&Sha3_256::digest(b"other-psk"));
            let mut stream = SecureStream::new(tcp, &wrong);
            let _ = handshake_accept(&mut stream).await;
        });

        let (primary, fallback) = write_psk();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut remote =
            RemoteExecutor::new("web1", &addr, PskSource::new(&primary, &fallback), tx);
        assert!(remote.connect().await.is_err());
    }
}
