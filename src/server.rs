use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::buffer_pool::{BufferLease, BufferPool};
use crate::config::Config;
use crate::crypto::{self, NONCE_LEN};
use crate::frame;

const DOWNLOAD_CHUNK_SIZE: usize = 256 * 1024;
const TARGET_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DOWNLOAD_FIRST_READ_TIMEOUT: Duration = Duration::from_secs(3);
const DOWNLOAD_COALESCE_TIMEOUT: Duration = Duration::from_millis(3);
const SESSION_IDLE_TTL: Duration = Duration::from_secs(120);
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Connection state of a session's real target.
///
/// `Closed` is terminal: it covers both write failures and idle reaping, and
/// every later request on the session answers 410.
enum TargetState {
    NotDialed,
    Open(TargetHandles),
    Closed,
}

/// Split halves of the dialed target connection.
///
/// Reads and writes take different locks so a long-poll download never
/// blocks upload drains. Holding the writer lock across an entire drain is
/// what keeps delivery in sequence order.
#[derive(Clone)]
struct TargetHandles {
    reader: Arc<AsyncMutex<OwnedReadHalf>>,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
}

struct SessionInner {
    target: TargetState,
    next_upload_seq: u32,
    pending_upload: HashMap<u32, Bytes>,
    last_active: Instant,
}

/// One logical tunnel stream, matched by session id across uploads and
/// downloads.
struct Session {
    id: String,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn new(id: String) -> Self {
        Self {
            id,
            inner: Mutex::new(SessionInner {
                target: TargetState::NotDialed,
                next_upload_seq: 0,
                pending_upload: HashMap::new(),
                last_active: Instant::now(),
            }),
        }
    }

    fn touch(&self) {
        self.inner.lock().expect("session lock poisoned").last_active = Instant::now();
    }
}

/// Server side of the HTTP tunnel.
///
/// A single handler serves both `/upload` (POST) and `/download` (GET),
/// dispatched on method. Sessions are created lazily on first sight and
/// reaped after two minutes of silence.
pub struct Handler {
    key: [u8; crypto::KEY_LEN],
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    read_buffers: Arc<BufferPool>,
}

impl Handler {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            key: crypto::derive_key(&config.secret),
            sessions: Mutex::new(HashMap::new()),
            read_buffers: BufferPool::new(DOWNLOAD_CHUNK_SIZE),
        })
    }

    /// Start the idle-session reaper. One cycle per minute.
    pub fn spawn_reaper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.reap_idle();
            }
        })
    }

    /// One reaper cycle.
    ///
    /// Sessions idle past the TTL have their target closed and pending data
    /// dropped, but stay in the map as closed tombstones for one more round
    /// so that late uploads and downloads observe 410 instead of silently
    /// starting a fresh session.
    pub fn reap_idle(&self) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        sessions.retain(|id, session| {
            let mut inner = session.inner.lock().expect("session lock poisoned");
            if now.duration_since(inner.last_active) <= SESSION_IDLE_TTL {
                return true;
            }
            match inner.target {
                TargetState::Closed => {
                    debug!(session = %id, "evicting reaped session");
                    false
                }
                _ => {
                    debug!(session = %id, "closing idle session");
                    inner.target = TargetState::Closed;
                    inner.pending_upload.clear();
                    true
                }
            }
        });
    }

    /// Look up a session, creating it on first sight, and refresh its
    /// activity timestamp.
    fn session(&self, id: &str) -> Arc<Session> {
        let session = {
            let mut sessions = self.sessions.lock().expect("session map lock poisoned");
            Arc::clone(
                sessions
                    .entry(id.to_string())
                    .or_insert_with(|| Arc::new(Session::new(id.to_string()))),
            )
        };
        session.touch();
        session
    }

    /// Accept loop: one task per HTTP connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "accept error (continuing)");
                    continue;
                }
            };

            let handler = Arc::clone(&self);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| Arc::clone(&handler).handle(req));
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(%peer_addr, %err, "connection error");
                }
            });
        }
    }

    /// Route one request. The session id is required; dispatch is on method
    /// so the handler serves any path, including the prober's HEAD target.
    pub async fn handle<B>(
        self: Arc<Self>,
        req: Request<B>,
    ) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        let session_id = match query_param(req.uri().query(), "session_id") {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Ok(text_response(
                    StatusCode::BAD_REQUEST,
                    "missing session_id",
                ))
            }
        };

        let session = self.session(&session_id);

        if req.method() == Method::POST {
            let body = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(err) => {
                    warn!(session = %session.id, %err, "failed to read upload body");
                    return Ok(text_response(
                        StatusCode::BAD_REQUEST,
                        "failed to read body",
                    ));
                }
            };
            Ok(self.handle_upload(&session, body).await)
        } else if req.method() == Method::GET {
            Ok(self.handle_download(&session).await)
        } else {
            Ok(text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed",
            ))
        }
    }

    /// Process one upload POST body: decrypt, parse, buffer, dial on the
    /// first frame, and drain whatever became deliverable.
    async fn handle_upload(&self, session: &Arc<Session>, body: Bytes) -> Response<Full<Bytes>> {
        if body.len() < NONCE_LEN {
            return text_response(StatusCode::BAD_REQUEST, "failed to read nonce");
        }
        let nonce: [u8; NONCE_LEN] = body[..NONCE_LEN].try_into().expect("nonce slice");

        let encrypted = &body[NONCE_LEN..];
        if encrypted.is_empty() {
            // Keepalive: nonce with no record.
            return empty_response(StatusCode::OK);
        }

        let mut plain = encrypted.to_vec();
        crypto::xor_ctr_in_place(&self.key, &nonce, &mut plain);

        let (seq, first, target_addr, payload) = match frame::parse(&plain) {
            Ok(f) => (
                f.seq,
                f.first,
                f.target.map(str::to_string),
                Bytes::copy_from_slice(f.payload),
            ),
            Err(err) => {
                warn!(session = %session.id, %err, "invalid upload frame");
                return text_response(StatusCode::BAD_REQUEST, "invalid upload frame");
            }
        };

        let need_dial = {
            let mut inner = session.inner.lock().expect("session lock poisoned");
            if matches!(inner.target, TargetState::Closed) {
                return text_response(StatusCode::GONE, "session closed");
            }
            if seq < inner.next_upload_seq {
                // Duplicate of an already-delivered frame.
                return empty_response(StatusCode::OK);
            }
            inner.pending_upload.entry(seq).or_insert(payload);
            matches!(inner.target, TargetState::NotDialed) && first
        };

        if need_dial {
            let addr = target_addr.unwrap_or_default();
            let conn = match timeout(TARGET_DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(err)) => {
                    error!(session = %session.id, target = %addr, %err, "target dial failed");
                    return text_response(StatusCode::BAD_GATEWAY, "dial failed");
                }
                Err(_) => {
                    error!(session = %session.id, target = %addr, "target dial timed out");
                    return text_response(StatusCode::BAD_GATEWAY, "dial timed out");
                }
            };

            let (read_half, write_half) = conn.into_split();
            let handles = TargetHandles {
                reader: Arc::new(AsyncMutex::new(read_half)),
                writer: Arc::new(AsyncMutex::new(write_half)),
            };

            let mut inner = session.inner.lock().expect("session lock poisoned");
            if matches!(inner.target, TargetState::Closed) {
                return text_response(StatusCode::GONE, "session closed");
            }
            if matches!(inner.target, TargetState::NotDialed) {
                inner.target = TargetState::Open(handles);
            }
            // Otherwise we lost the dial race; ours is dropped, the winner kept.
        }

        match self.drain_session(session).await {
            Ok(()) => empty_response(StatusCode::OK),
            Err(()) => text_response(StatusCode::BAD_GATEWAY, "target connection closed"),
        }
    }

    /// Deliver consecutive pending frames to the target, in seq order.
    async fn drain_session(&self, session: &Arc<Session>) -> Result<(), ()> {
        let writer = {
            let inner = session.inner.lock().expect("session lock poisoned");
            match &inner.target {
                TargetState::Open(handles) => Arc::clone(&handles.writer),
                _ => return Ok(()),
            }
        };

        // The writer lock is held for the whole drain; concurrent uploads
        // queue behind it instead of interleaving writes out of order.
        let mut writer = writer.lock().await;
        loop {
            let payload = {
                let mut inner = session.inner.lock().expect("session lock poisoned");
                if !matches!(inner.target, TargetState::Open(_)) {
                    return Ok(());
                }
                let seq = inner.next_upload_seq;
                match inner.pending_upload.remove(&seq) {
                    Some(payload) => {
                        inner.next_upload_seq += 1;
                        payload
                    }
                    None => return Ok(()),
                }
            };

            if payload.is_empty() {
                continue;
            }
            if let Err(err) = writer.write_all(&payload).await {
                warn!(session = %session.id, %err, "target write failed");
                let mut inner = session.inner.lock().expect("session lock poisoned");
                inner.target = TargetState::Closed;
                inner.pending_upload.clear();
                return Err(());
            }
        }
    }

    /// Long-poll one download GET: read once with a 3 s deadline, coalesce
    /// briefly, encrypt, and answer.
    async fn handle_download(&self, session: &Arc<Session>) -> Response<Full<Bytes>> {
        let reader = {
            let inner = session.inner.lock().expect("session lock poisoned");
            match &inner.target {
                TargetState::Closed => {
                    return text_response(StatusCode::GONE, "session closed");
                }
                TargetState::NotDialed => return empty_response(StatusCode::NO_CONTENT),
                TargetState::Open(handles) => Arc::clone(&handles.reader),
            }
        };

        let mut reader = reader.lock().await;
        let mut lease = BufferLease::acquire(&self.read_buffers).await;
        let buf = lease.as_mut_slice();

        let first_read = timeout(DOWNLOAD_FIRST_READ_TIMEOUT, reader.read(buf)).await;
        let mut total = match first_read {
            Ok(Ok(0)) => return empty_response(StatusCode::NO_CONTENT),
            Ok(Ok(n)) => n,
            Ok(Err(_)) | Err(_) => return empty_response(StatusCode::NO_CONTENT),
        };

        // Opportunistically coalesce bytes that are already queued.
        while total < buf.len() {
            match timeout(DOWNLOAD_COALESCE_TIMEOUT, reader.read(&mut buf[total..])).await {
                Ok(Ok(n)) if n > 0 => total += n,
                _ => break,
            }
        }
        drop(reader);

        let nonce = crypto::generate_nonce();
        crypto::xor_ctr_in_place(&self.key, &nonce, &mut buf[..total]);

        let mut body = BytesMut::with_capacity(NONCE_LEN + total);
        body.put_slice(&nonce);
        body.put_slice(&buf[..total]);

        let mut response = Response::new(Full::new(body.freeze()));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        response
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    #[cfg(test)]
    fn force_idle(&self, id: &str, idle_for: Duration) {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.get(id).expect("session should exist");
        session.inner.lock().unwrap().last_active = Instant::now() - idle_for;
    }
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(key) {
            return Some(parts.next().unwrap_or_default().to_string());
        }
    }
    None
}

fn text_response(status: StatusCode, msg: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(msg.as_bytes())));
    *response.status_mut() = status;
    response
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_config(secret: &str) -> Config {
        Config {
            addresses: Vec::new(),
            host: "h".to_string(),
            tls: false,
            sni: String::new(),
            port: 18080,
            proxy_port: 11080,
            secret: secret.to_string(),
        }
    }

    fn encrypt_frame(secret: &str, seq: u32, first: bool, target: &str, data: &[u8]) -> Bytes {
        let key = crypto::derive_key(secret);
        let nonce = crypto::generate_nonce();

        let mut buf = BytesMut::new();
        buf.put_slice(&nonce);
        frame::encode(seq, first, target, data, &mut buf).unwrap();
        crypto::xor_ctr_in_place(&key, &nonce, &mut buf[NONCE_LEN..]);
        buf.freeze()
    }

    /// Loopback target that forwards everything it reads to a channel.
    async fn spawn_sink() -> (String, mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        (addr.to_string(), rx)
    }

    /// Loopback target that echoes bytes back.
    async fn spawn_echo() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if conn.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        addr.to_string()
    }

    async fn collect_exact(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            let chunk = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for target bytes")
                .expect("target closed early");
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn upload_reorders_frames_before_delivery() {
        let handler = Handler::new(&test_config("s"));
        let (target, mut rx) = spawn_sink().await;
        let session = handler.session("reorder-session");

        // Deliver seqs 2, 0, 1; the wire may reorder racing POSTs.
        let resp = handler
            .handle_upload(&session, encrypt_frame("s", 2, false, "", b"charlie"))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = handler
            .handle_upload(&session, encrypt_frame("s", 0, true, &target, b"alpha"))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = handler
            .handle_upload(&session, encrypt_frame("s", 1, false, "", b"bravo"))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let delivered = collect_exact(&mut rx, "alphabravocharlie".len()).await;
        assert_eq!(delivered, b"alphabravocharlie");
    }

    #[tokio::test]
    async fn duplicate_frames_are_acked_and_discarded() {
        let handler = Handler::new(&test_config("s"));
        let (target, mut rx) = spawn_sink().await;
        let session = handler.session("dup-session");

        let resp = handler
            .handle_upload(&session, encrypt_frame("s", 0, true, &target, b"only-once"))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(collect_exact(&mut rx, 9).await, b"only-once");

        // Same seq again, after the cursor moved past it.
        let resp = handler
            .handle_upload(&session, encrypt_frame("s", 0, true, &target, b"only-once"))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        // Nothing further may reach the target.
        let extra = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(extra.is_err(), "duplicate frame reached the target");
    }

    #[tokio::test]
    async fn second_first_frame_is_a_normal_frame() {
        let handler = Handler::new(&test_config("s"));
        let (target, mut rx) = spawn_sink().await;
        let session = handler.session("refirst-session");

        handler
            .handle_upload(&session, encrypt_frame("s", 0, true, &target, b"one"))
            .await;
        // FIRST flag again on seq 1, pointing somewhere unreachable: the
        // target field must be ignored on an already-dialed session.
        let resp = handler
            .handle_upload(
                &session,
                encrypt_frame("s", 1, true, "127.0.0.1:1", b"two"),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        assert_eq!(collect_exact(&mut rx, 6).await, b"onetwo");
    }

    #[tokio::test]
    async fn wrong_secret_yields_bad_request() {
        let handler = Handler::new(&test_config("server-secret"));
        let session = handler.session("bad-secret-session");

        // A wrong-key frame decrypts to random bytes; without a MAC the
        // flags and target-length checks do the rejecting, so a single
        // frame has a small chance of slipping through as a no-op. Over
        // many frames the session must stay undialed and nearly all must
        // bounce with 400.
        let mut rejected = 0;
        for seq in 0..50u32 {
            let resp = handler
                .handle_upload(
                    &session,
                    encrypt_frame("client-secret", seq, true, "127.0.0.1:9", b"x"),
                )
                .await;
            if resp.status() == StatusCode::BAD_REQUEST {
                rejected += 1;
            }
        }
        assert!(rejected >= 45, "only {rejected}/50 garbage frames rejected");

        // No garbage frame may have triggered a dial.
        let resp = handler.handle_download(&session).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn short_nonce_yields_bad_request() {
        let handler = Handler::new(&test_config("s"));
        let session = handler.session("short-session");

        let resp = handler
            .handle_upload(&session, Bytes::from_static(&[1, 2, 3]))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn nonce_only_body_is_a_keepalive() {
        let handler = Handler::new(&test_config("s"));
        let session = handler.session("keepalive-session");

        let resp = handler
            .handle_upload(&session, Bytes::copy_from_slice(&[0u8; NONCE_LEN]))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unreachable_target_yields_bad_gateway() {
        let handler = Handler::new(&test_config("s"));
        let session = handler.session("unreachable-session");

        let resp = handler
            .handle_upload(
                &session,
                encrypt_frame("s", 0, true, "127.0.0.1:1", b"data"),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn download_round_trips_through_echo() {
        let handler = Handler::new(&test_config("s"));
        let target = spawn_echo().await;
        let session = handler.session("echo-session");

        let resp = handler
            .handle_upload(&session, encrypt_frame("s", 0, true, &target, b"ping"))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = handler.handle_download(&session).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.len() > NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = body[..NONCE_LEN].try_into().unwrap();
        let mut plain = body[NONCE_LEN..].to_vec();
        crypto::xor_ctr_in_place(&crypto::derive_key("s"), &nonce, &mut plain);
        assert_eq!(plain, b"ping");
    }

    #[tokio::test]
    async fn download_before_dial_is_no_content() {
        let handler = Handler::new(&test_config("s"));
        let session = handler.session("fresh-session");

        let resp = handler.handle_download(&session).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn reaper_closes_then_evicts_idle_sessions() {
        let handler = Handler::new(&test_config("s"));
        let target = spawn_echo().await;
        let session = handler.session("idle-session");
        handler
            .handle_upload(&session, encrypt_frame("s", 0, true, &target, b"x"))
            .await;

        // Fresh sessions survive a cycle untouched.
        handler.reap_idle();
        assert_eq!(handler.session_count(), 1);

        handler.force_idle("idle-session", Duration::from_secs(180));
        handler.reap_idle();

        // First cycle: closed tombstone, still answering 410.
        assert_eq!(handler.session_count(), 1);
        let resp = handler.handle_download(&session).await;
        assert_eq!(resp.status(), StatusCode::GONE);
        let resp = handler
            .handle_upload(&session, encrypt_frame("s", 1, false, "", b"late"))
            .await;
        assert_eq!(resp.status(), StatusCode::GONE);

        // Second cycle: entry evicted.
        handler.force_idle("idle-session", Duration::from_secs(180));
        handler.reap_idle();
        assert_eq!(handler.session_count(), 0);
    }

    #[tokio::test]
    async fn handle_requires_session_id_and_known_method() {
        let handler = Handler::new(&test_config("s"));

        let req = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = Arc::clone(&handler).handle(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = Request::builder()
            .method(Method::DELETE)
            .uri("/upload?session_id=abc")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = Arc::clone(&handler).handle(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

        let req = Request::builder()
            .method(Method::GET)
            .uri("/download?session_id=abc")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = Arc::clone(&handler).handle(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn query_param_extraction() {
        assert_eq!(
            query_param(Some("session_id=abc123"), "session_id").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            query_param(Some("x=1&session_id=abc&y=2"), "session_id").as_deref(),
            Some("abc")
        );
        assert_eq!(query_param(Some("session_id="), "session_id").as_deref(), Some(""));
        assert_eq!(query_param(Some("other=1"), "session_id"), None);
        assert_eq!(query_param(None, "session_id"), None);
    }
}
