use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use aes::cipher::StreamCipher;
use bytes::{BufMut, Bytes, BytesMut};
use reqwest::header::{CONTENT_TYPE, HOST};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer_pool::{BufferLease, BufferPool};
use crate::config::Config;
use crate::crypto::{self, NONCE_LEN};
use crate::frame::{self, FrameError, MAX_TARGET_LEN};
use crate::pool::AddressPool;
use crate::session::{is_valid_session_id, new_session_id};

pub const MIN_UPLOAD_CHUNK: usize = 16 * 1024;
pub const INITIAL_UPLOAD_CHUNK: usize = 64 * 1024;
pub const MAX_UPLOAD_CHUNK: usize = 512 * 1024;

const UPLOAD_PIPELINE_LIMIT: usize = 4;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const PEER_READ_TIMEOUT: Duration = Duration::from_secs(2);
const DOWNLOAD_NO_DATA_BACKOFF: Duration = Duration::from_millis(120);
const DOWNLOAD_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Error type for a single upload POST
#[derive(Debug, Error)]
enum UploadError {
    #[error("upload request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upload failed with status {0}")]
    Status(StatusCode),
}

/// Client side of the HTTP tunnel.
///
/// One `Transport` is shared by all SOCKS5 connections. Each accepted
/// connection becomes a tunnel session: an upload flow that frames,
/// encrypts, and POSTs chunks read from the peer, and a download flow that
/// polls GETs and streams decrypted bytes back. The two flows share one
/// cancellation token; either side failing stops both.
pub struct Transport {
    config: Arc<Config>,
    pool: Arc<AddressPool>,
    client: reqwest::Client,
    key: [u8; crypto::KEY_LEN],
    read_buffers: Arc<BufferPool>,
}

impl Transport {
    pub fn new(config: Arc<Config>, pool: Arc<AddressPool>) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .http1_only()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_TIMEOUT)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(100);
        if config.tls {
            // Endpoints are typically raw IPs fronting the real host, so the
            // certificate cannot match the URL authority. Same trade as the
            // prober's IP-literal fallback.
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;

        Ok(Self {
            key: crypto::derive_key(&config.secret),
            config,
            pool,
            client,
            read_buffers: BufferPool::new(MAX_UPLOAD_CHUNK),
        })
    }

    fn scheme(&self) -> &'static str {
        if self.config.tls {
            "https"
        } else {
            "http"
        }
    }

    /// Run one tunnel session until either flow stops.
    ///
    /// `target` is the "host:port" the server should dial; `peer` is the
    /// SOCKS5 connection carrying the application stream.
    pub async fn tunnel(&self, target: String, peer: TcpStream) {
        if target.len() > MAX_TARGET_LEN {
            warn!("target address too long, refusing tunnel");
            return;
        }

        let server_ip = self.pool.pick_best();
        let session_id = new_session_id();
        debug_assert!(is_valid_session_id(&session_id));

        let authority = if server_ip.contains(':') && !server_ip.starts_with('[') {
            format!("[{server_ip}]")
        } else {
            server_ip.clone()
        };
        let base_url = format!("{}://{}:{}", self.scheme(), authority, self.config.port);
        debug!(%session_id, %server_ip, %target, "opening tunnel");

        let cancel = CancellationToken::new();
        // Dropping the tunnel future must take the child tasks down with it.
        let _guard = cancel.clone().drop_guard();

        let (peer_rd, peer_wr) = peer.into_split();
        tokio::join!(
            self.upload_loop(
                &base_url,
                &session_id,
                &target,
                &server_ip,
                peer_rd,
                cancel.clone()
            ),
            self.download_loop(&base_url, &session_id, peer_wr, cancel.clone()),
        );
        debug!(%session_id, "tunnel closed");
    }

    async fn upload_loop(
        &self,
        base_url: &str,
        session_id: &str,
        target: &str,
        server_ip: &str,
        mut peer_rd: OwnedReadHalf,
        cancel: CancellationToken,
    ) {
        let url = format!("{base_url}/upload?session_id={session_id}");
        let sizer = Arc::new(AdaptiveChunkSizer::new(
            INITIAL_UPLOAD_CHUNK,
            MIN_UPLOAD_CHUNK,
            MAX_UPLOAD_CHUNK,
        ));
        let sem = Arc::new(Semaphore::new(UPLOAD_PIPELINE_LIMIT));
        let mut sends = JoinSet::new();

        let mut lease = BufferLease::acquire(&self.read_buffers).await;
        let mut seq: u32 = 0;
        let mut first = true;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let chunk_size = sizer.next().clamp(MIN_UPLOAD_CHUNK, MAX_UPLOAD_CHUNK);
            let n = match timeout(
                PEER_READ_TIMEOUT,
                peer_rd.read(&mut lease.as_mut_slice()[..chunk_size]),
            )
            .await
            {
                // The short deadline keeps an idle tunnel responsive to
                // cancellation; it is not an error.
                Err(_) => continue,
                Ok(Ok(0)) => {
                    cancel.cancel();
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(_)) => {
                    cancel.cancel();
                    break;
                }
            };

            let body = match self.build_upload_frame(seq, first, target, &lease.as_slice()[..n]) {
                Ok(body) => body,
                Err(err) => {
                    warn!(%err, "failed to build upload frame");
                    cancel.cancel();
                    break;
                }
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&sem).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let client = self.client.clone();
            let url = url.clone();
            let host = self.config.host.clone();
            let pool = Arc::clone(&self.pool);
            let sizer = Arc::clone(&sizer);
            let cancel = cancel.clone();
            let server_ip = server_ip.to_string();
            sends.spawn(async move {
                let _permit = permit;
                let start = Instant::now();
                let result = tokio::select! {
                    _ = cancel.cancelled() => None,
                    res = send_upload(&client, &url, &host, body) => Some(res),
                };
                let rtt = start.elapsed();
                match result {
                    None => {}
                    Some(Ok(())) => {
                        sizer.observe(rtt, true);
                        pool.report_runtime_result(&server_ip, true, rtt);
                    }
                    Some(Err(err)) => {
                        sizer.observe(rtt, false);
                        pool.report_runtime_result(&server_ip, false, rtt);
                        warn!(%err, "upload chunk failed");
                        cancel.cancel();
                    }
                }
            });

            first = false;
            seq = seq.wrapping_add(1);
        }

        while sends.join_next().await.is_some() {}
    }

    /// Assemble one encrypted upload body: nonce in the clear, then the
    /// CTR-encrypted record.
    fn build_upload_frame(
        &self,
        seq: u32,
        first: bool,
        target: &str,
        data: &[u8],
    ) -> Result<Bytes, FrameError> {
        let nonce = crypto::generate_nonce();

        let mut buf =
            BytesMut::with_capacity(NONCE_LEN + frame::HEADER_LEN + 2 + target.len() + data.len());
        buf.put_slice(&nonce);
        frame::encode(seq, first, target, data, &mut buf)?;

        crypto::xor_ctr_in_place(&self.key, &nonce, &mut buf[NONCE_LEN..]);
        Ok(buf.freeze())
    }

    async fn download_loop(
        &self,
        base_url: &str,
        session_id: &str,
        mut peer_wr: OwnedWriteHalf,
        cancel: CancellationToken,
    ) {
        let url = format!("{base_url}/download?session_id={session_id}");

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let mut request = self.client.get(&url);
            if !self.config.host.is_empty() {
                request = request.header(HOST, self.config.host.as_str());
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return,
                response = request.send() => response,
            };
            let mut response = match response {
                Ok(response) => response,
                Err(err) => {
                    debug!(%err, "download poll failed");
                    if !sleep_unless_cancelled(&cancel, DOWNLOAD_RETRY_BACKOFF).await {
                        return;
                    }
                    continue;
                }
            };

            match response.status() {
                StatusCode::OK => {}
                StatusCode::NO_CONTENT => {
                    if !sleep_unless_cancelled(&cancel, DOWNLOAD_NO_DATA_BACKOFF).await {
                        return;
                    }
                    continue;
                }
                StatusCode::GONE => {
                    debug!("session closed by server");
                    cancel.cancel();
                    return;
                }
                status => {
                    debug!(%status, "unexpected download status");
                    if !sleep_unless_cancelled(&cancel, DOWNLOAD_RETRY_BACKOFF).await {
                        return;
                    }
                    continue;
                }
            }

            if !self
                .relay_download_body(&mut response, &mut peer_wr, &cancel)
                .await
            {
                return;
            }
        }
    }

    /// Decrypt one download response body into the peer, chunk by chunk.
    ///
    /// Returns false when the tunnel should stop (peer write failure or a
    /// mid-body transport error); a body that ends before the nonce is
    /// complete is treated as an empty poll.
    async fn relay_download_body(
        &self,
        response: &mut reqwest::Response,
        peer_wr: &mut OwnedWriteHalf,
        cancel: &CancellationToken,
    ) -> bool {
        let mut nonce = [0u8; NONCE_LEN];
        let mut filled = 0usize;
        let mut leftover: Option<Bytes> = None;

        while filled < NONCE_LEN {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return false,
                chunk = response.chunk() => chunk,
            };
            match chunk {
                Ok(Some(chunk)) => {
                    let take = (NONCE_LEN - filled).min(chunk.len());
                    nonce[filled..filled + take].copy_from_slice(&chunk[..take]);
                    filled += take;
                    if take < chunk.len() {
                        leftover = Some(chunk.slice(take..));
                    }
                }
                // Short or broken body before the nonce: not data, poll again.
                Ok(None) | Err(_) => return true,
            }
        }

        let mut cipher = crypto::keystream(&self.key, &nonce);

        if let Some(chunk) = leftover {
            let mut data = chunk.to_vec();
            cipher.apply_keystream(&mut data);
            if peer_wr.write_all(&data).await.is_err() {
                cancel.cancel();
                return false;
            }
        }

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return false,
                chunk = response.chunk() => chunk,
            };
            match chunk {
                Ok(Some(chunk)) => {
                    let mut data = chunk.to_vec();
                    cipher.apply_keystream(&mut data);
                    if peer_wr.write_all(&data).await.is_err() {
                        cancel.cancel();
                        return false;
                    }
                }
                Ok(None) => return true,
                Err(err) => {
                    debug!(%err, "download body interrupted");
                    cancel.cancel();
                    return false;
                }
            }
        }
    }
}

async fn send_upload(
    client: &reqwest::Client,
    url: &str,
    host: &str,
    body: Bytes,
) -> Result<(), UploadError> {
    let mut request = client
        .post(url)
        .header(CONTENT_TYPE, "application/octet-stream")
        .body(body);
    if !host.is_empty() {
        request = request.header(HOST, host);
    }

    let response = request.send().await?;
    if response.status() != StatusCode::OK {
        return Err(UploadError::Status(response.status()));
    }
    Ok(())
}

async fn sleep_unless_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Upload chunk sizing driven by observed round-trip times.
///
/// Fast acknowledgements grow the chunk, slow ones shrink it, failures halve
/// it. The current value is always clamped to `[min, max]`.
pub struct AdaptiveChunkSizer {
    min: usize,
    max: usize,
    cur: Mutex<usize>,
}

impl AdaptiveChunkSizer {
    pub fn new(initial: usize, min: usize, max: usize) -> Self {
        Self {
            min,
            max,
            cur: Mutex::new(initial.clamp(min, max)),
        }
    }

    pub fn next(&self) -> usize {
        *self.cur.lock().expect("sizer lock poisoned")
    }

    pub fn observe(&self, rtt: Duration, ok: bool) {
        let mut cur = self.cur.lock().expect("sizer lock poisoned");

        if !ok {
            *cur = (*cur / 2).clamp(self.min, self.max);
            return;
        }

        if rtt < Duration::from_millis(180) {
            *cur += 16 * 1024;
        } else if rtt > Duration::from_millis(1200) {
            *cur /= 2;
        } else if rtt > Duration::from_millis(700) {
            *cur = cur.saturating_sub(8 * 1024);
        }

        *cur = (*cur).clamp(self.min, self.max);
    }
}
