use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PROBE_INTERVAL: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const PROBE_CONCURRENCY: usize = 40;
const MAX_CANDIDATES: usize = 1000;
const CIDR_DRAW_PER_REFRESH: usize = 5;
const MAX_PROBE_FAILS: u32 = 3;
const TOP_CANDIDATES: usize = 3;
const RUNTIME_EWMA_ALPHA: f64 = 0.2;

/// Health and latency bookkeeping for one candidate endpoint.
#[derive(Debug, Clone, Default)]
pub struct EndpointStats {
    pub ip: String,
    pub healthy: bool,
    pub tcp_latency: Duration,
    pub app_latency: Duration,
    pub latency: Duration,
    pub quality: f64,
    pub fails: u32,
    pub successes: u64,
    pub last_check: Option<Instant>,
    pub last_runtime: Option<Instant>,
}

#[derive(Default)]
struct PoolInner {
    candidates: HashMap<String, EndpointStats>,
    /// Healthy candidates, best quality first. Rebuilt after each probe cycle.
    sorted: Vec<String>,
}

/// Result of one two-stage endpoint probe.
#[derive(Debug, Clone, Copy, Default)]
struct ProbeOutcome {
    tcp_latency: Duration,
    app_latency: Duration,
    ok: bool,
}

/// Pool of candidate server endpoints with background health probing.
///
/// Config entries expand into concrete candidates (CIDRs are sampled, plain
/// addresses used verbatim). A background task probes every candidate each
/// cycle with a TCP dial followed by a HEAD request (through TLS when
/// configured) and keeps a quality-sorted healthy list. The transport reads
/// from the pool via [`AddressPool::pick_best`] and feeds live results back
/// via [`AddressPool::report_runtime_result`].
pub struct AddressPool {
    config_addrs: Vec<String>,
    port: u16,
    host: String,
    tls: bool,
    tls_trusted: Arc<ClientConfig>,
    tls_insecure: Arc<ClientConfig>,
    inner: RwLock<PoolInner>,
    cancel: CancellationToken,
}

impl AddressPool {
    pub fn new(addrs: &[String], port: u16, host: &str, tls: bool) -> Arc<Self> {
        // Pin the crypto provider explicitly so builder behavior does not
        // depend on which provider features other crates enable.
        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let trusted = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .expect("ring provider supports the default protocol versions")
            .with_root_certificates(roots)
            .with_no_client_auth();
        let insecure = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .expect("ring provider supports the default protocol versions")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerification::new()))
            .with_no_client_auth();

        let pool = Arc::new(Self {
            config_addrs: addrs.to_vec(),
            port,
            host: host.trim().to_string(),
            tls,
            tls_trusted: Arc::new(trusted),
            tls_insecure: Arc::new(insecure),
            inner: RwLock::new(PoolInner::default()),
            cancel: CancellationToken::new(),
        });
        pool.refresh_candidates();
        pool
    }

    /// Start the background probe loop. Runs until [`AddressPool::stop`].
    pub fn spawn_prober(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.check_loop().await })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn check_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(PROBE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            Arc::clone(&self).run_probe_cycle().await;
        }
    }

    /// Top up candidates from the configured entries.
    ///
    /// CIDR entries are sampled rather than enumerated; existing candidates
    /// are never pruned here, only by probe-failure eviction.
    fn refresh_candidates(&self) {
        let mut inner = self.inner.write().expect("pool lock poisoned");
        if inner.candidates.len() >= MAX_CANDIDATES {
            return;
        }

        for addr in &self.config_addrs {
            if let Some(cidr) = Ipv4Cidr::parse(addr) {
                let mut rng = rand::thread_rng();
                for _ in 0..CIDR_DRAW_PER_REFRESH {
                    if inner.candidates.len() >= MAX_CANDIDATES {
                        return;
                    }
                    let ip = cidr.random_host(&mut rng).to_string();
                    inner
                        .candidates
                        .entry(ip.clone())
                        .or_insert_with(|| EndpointStats {
                            ip,
                            ..EndpointStats::default()
                        });
                }
                continue;
            }

            if inner.candidates.len() < MAX_CANDIDATES && !inner.candidates.contains_key(addr) {
                inner.candidates.insert(
                    addr.clone(),
                    EndpointStats {
                        ip: addr.clone(),
                        ..EndpointStats::default()
                    },
                );
            }
        }
    }

    async fn run_probe_cycle(self: Arc<Self>) {
        self.refresh_candidates();

        let check_list: Vec<String> = {
            let inner = self.inner.read().expect("pool lock poisoned");
            inner.candidates.keys().cloned().collect()
        };

        let sem = Arc::new(Semaphore::new(PROBE_CONCURRENCY));
        let mut set = JoinSet::new();
        for ip in check_list {
            let pool = Arc::clone(&self);
            let sem = Arc::clone(&sem);
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                let outcome = pool.probe_endpoint(&ip).await;
                (ip, outcome)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(pair) = joined {
                results.push(pair);
            }
        }

        let mut inner = self.inner.write().expect("pool lock poisoned");
        for (ip, outcome) in results {
            apply_probe_result(&mut inner, &ip, outcome);
        }
        resort(&mut inner);

        if let Some(best) = inner.sorted.first().and_then(|ip| inner.candidates.get(ip)) {
            debug!(
                active = inner.sorted.len(),
                best = %best.ip,
                tcp = ?best.tcp_latency,
                app = ?best.app_latency,
                "probe cycle complete"
            );
        } else {
            warn!("no quality-healthy endpoints available");
        }
    }

    /// Probe one endpoint: TCP dial, then (optionally TLS and) a HEAD
    /// request that must come back with an HTTP status line.
    async fn probe_endpoint(&self, ip: &str) -> ProbeOutcome {
        let addr = join_host_port(ip, self.port);

        let start = Instant::now();
        let conn = match timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(conn)) => conn,
            _ => return ProbeOutcome::default(),
        };
        let tcp_latency = start.elapsed();

        let host = if self.host.is_empty() { ip } else { &self.host };

        // TLS handshake plus HEAD exchange share one cumulative deadline.
        // SNI comes from the configured host; when that would be an IP
        // literal there is no name to verify, so verification is skipped.
        let app = timeout(PROBE_TIMEOUT, async {
            if self.tls {
                let config = if host.parse::<IpAddr>().is_ok() {
                    Arc::clone(&self.tls_insecure)
                } else {
                    Arc::clone(&self.tls_trusted)
                };
                let name = ServerName::try_from(host.to_string())
                    .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
                let stream = TlsConnector::from(config).connect(name, conn).await?;
                head_probe(stream, host).await
            } else {
                head_probe(conn, host).await
            }
        })
        .await;

        match app {
            Ok(Ok(app_latency)) => ProbeOutcome {
                tcp_latency,
                app_latency,
                ok: true,
            },
            _ => ProbeOutcome {
                tcp_latency,
                ..ProbeOutcome::default()
            },
        }
    }

    /// Pick an endpoint for a new tunnel: uniformly among the top three by
    /// quality, with progressively weaker fallbacks when nothing is healthy.
    pub fn pick_best(&self) -> String {
        let inner = self.inner.read().expect("pool lock poisoned");

        if inner.sorted.is_empty() {
            if let Some(ip) = inner.candidates.keys().next() {
                return ip.clone();
            }
            if let Some(first) = self.config_addrs.first() {
                return first.clone();
            }
            return "127.0.0.1".to_string();
        }

        let top = inner.sorted.len().min(TOP_CANDIDATES);
        inner.sorted[rand::thread_rng().gen_range(0..top)].clone()
    }

    /// Feed an upload round-trip result back into the candidate's stats.
    pub fn report_runtime_result(&self, ip: &str, success: bool, rtt: Duration) {
        let mut inner = self.inner.write().expect("pool lock poisoned");
        let Some(stats) = inner.candidates.get_mut(ip) else {
            return;
        };

        stats.last_runtime = Some(Instant::now());
        if success {
            stats.successes += 1;
            stats.fails = stats.fails.saturating_sub(1);
            if !rtt.is_zero() {
                stats.app_latency = if stats.app_latency.is_zero() {
                    rtt
                } else {
                    ewma_duration(stats.app_latency, rtt, RUNTIME_EWMA_ALPHA)
                };
                stats.latency = stats.tcp_latency + stats.app_latency;
            }
            stats.healthy = true;
            stats.quality =
                quality_score(stats.tcp_latency, stats.app_latency, true, stats.fails);
        } else {
            stats.fails += 1;
            stats.healthy = false;
            stats.quality =
                quality_score(stats.tcp_latency, stats.app_latency, false, stats.fails);
        }
    }

    /// Snapshot of a candidate's stats, mainly for diagnostics and tests.
    pub fn stats_for(&self, ip: &str) -> Option<EndpointStats> {
        let inner = self.inner.read().expect("pool lock poisoned");
        inner.candidates.get(ip).cloned()
    }

    /// Number of known candidates.
    pub fn candidate_count(&self) -> usize {
        let inner = self.inner.read().expect("pool lock poisoned");
        inner.candidates.len()
    }
}

fn apply_probe_result(inner: &mut PoolInner, ip: &str, outcome: ProbeOutcome) {
    let Some(stats) = inner.candidates.get_mut(ip) else {
        return;
    };

    stats.last_check = Some(Instant::now());
    if outcome.ok {
        stats.healthy = true;
        stats.tcp_latency = outcome.tcp_latency;
        stats.app_latency = outcome.app_latency;
        stats.latency = outcome.tcp_latency + outcome.app_latency;
        stats.fails = 0;
        stats.quality = quality_score(outcome.tcp_latency, outcome.app_latency, true, 0);
    } else {
        stats.healthy = false;
        stats.fails += 1;
        stats.quality = quality_score(
            outcome.tcp_latency,
            outcome.app_latency,
            false,
            stats.fails,
        );
        if stats.fails > MAX_PROBE_FAILS {
            inner.candidates.remove(ip);
        }
    }
}

/// Rebuild the quality-sorted healthy list.
fn resort(inner: &mut PoolInner) {
    let mut active: Vec<String> = inner
        .candidates
        .values()
        .filter(|s| s.healthy)
        .map(|s| s.ip.clone())
        .collect();

    active.sort_by(|a, b| {
        let a = &inner.candidates[a];
        let b = &inner.candidates[b];
        a.quality
            .partial_cmp(&b.quality)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.latency.cmp(&b.latency))
    });
    inner.sorted = active;
}

/// Blend probe latencies, liveness, and failure count into one scalar.
/// Lower is better; the unit is microseconds.
fn quality_score(tcp_latency: Duration, app_latency: Duration, ok: bool, fails: u32) -> f64 {
    let mut base = (tcp_latency + app_latency).as_micros() as f64;
    if base == 0.0 {
        base = Duration::from_secs(3).as_micros() as f64;
    }
    if !ok {
        base += Duration::from_secs(2).as_micros() as f64;
    }
    if fails > 0 {
        base += fails as f64 * Duration::from_millis(250).as_micros() as f64;
    }
    base
}

fn ewma_duration(prev: Duration, curr: Duration, alpha: f64) -> Duration {
    if prev.is_zero() {
        return curr;
    }
    let blended = alpha * curr.as_secs_f64() + (1.0 - alpha) * prev.as_secs_f64();
    Duration::from_secs_f64(blended)
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Write the fixed quality-probe HEAD request and require an HTTP status
/// line back. Returns the latency from first write to first response byte.
async fn head_probe<S>(mut stream: S, host: &str) -> io::Result<Duration>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "HEAD /download?session_id=quality HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"
    );

    let start = Instant::now();
    stream.write_all(request.as_bytes()).await?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 || !line.starts_with("HTTP/") {
        return Err(io::ErrorKind::InvalidData.into());
    }
    Ok(start.elapsed())
}

/// IPv4 network prefix, hand-parsed from "a.b.c.d/len".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ipv4Cidr {
    base: u32,
    mask: u32,
}

impl Ipv4Cidr {
    fn parse(s: &str) -> Option<Self> {
        let (addr, len) = s.split_once('/')?;
        let base: Ipv4Addr = addr.parse().ok()?;
        let prefix: u8 = len.parse().ok()?;
        if prefix > 32 {
            return None;
        }
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        };
        Some(Self {
            base: u32::from(base) & mask,
            mask,
        })
    }

    fn random_host(&self, rng: &mut impl Rng) -> Ipv4Addr {
        let host_bits: u32 = rng.gen();
        Ipv4Addr::from(self.base | (host_bits & !self.mask))
    }
}

/// Accepts any certificate. Used only for the probe's IP-literal SNI
/// fallback, where there is no name to verify against.
#[derive(Debug)]
struct NoCertVerification(CryptoProvider);

impl NoCertVerification {
    fn new() -> Self {
        Self(tokio_rustls::rustls::crypto::ring::default_provider())
    }
}

impl ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
