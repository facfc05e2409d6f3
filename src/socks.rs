use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::transport::Transport;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 front-end: a strict RFC 1928 subset.
///
/// NO AUTH only, CONNECT only. The success reply is sent before the tunnel
/// is attempted, so applications observe end-to-end failures as a closed
/// connection rather than a SOCKS error code.
pub struct Socks5Server {
    transport: Arc<Transport>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Socks5Server {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self {
            transport,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Bind the listener and start accepting. Returns the bound address.
    pub async fn start(&self, port: u16) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;
        info!("SOCKS5 proxy listening on {addr}");

        let transport = Arc::clone(&self.transport);
        let cancel = self.cancel.clone();
        let tracker = self.tracker.clone();
        tokio::spawn(accept_loop(listener, transport, cancel, tracker));
        Ok(addr)
    }

    /// Start and serve until stopped.
    pub async fn run(&self, port: u16) -> io::Result<()> {
        self.start(port).await?;
        self.cancel.cancelled().await;
        Ok(())
    }

    /// Graceful shutdown: stop accepting, cancel tracked connections, and
    /// wait up to `grace` for their handlers to return.
    pub async fn stop(&self, grace: Duration) {
        self.cancel.cancel();
        self.tracker.close();
        if timeout(grace, self.tracker.wait()).await.is_err() {
            warn!("timed out waiting for SOCKS5 connections to close");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    transport: Arc<Transport>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            // Shutting down: returning drops (and closes) the listener.
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                debug!(%peer_addr, "accepted SOCKS5 connection");
                let transport = Arc::clone(&transport);
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = handle_connection(stream, transport) => {}
                    }
                });
            }
            Err(err) => {
                warn!(%err, "accept failed (continuing)");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, transport: Arc<Transport>) {
    let target = match handshake(&mut stream).await {
        Ok(target) => target,
        Err(err) => {
            debug!(%err, "SOCKS5 handshake failed");
            return;
        }
    };
    transport.tunnel(target, stream).await;
}

fn proto_err(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Run method negotiation and the CONNECT request, returning the target as
/// "host:port" (IPv6 hosts bracketed).
///
/// Violations drop the connection without a reply, except the optimistic
/// success written once the request parses.
async fn handshake<S>(stream: &mut S) -> io::Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Negotiation: [VER, NMETHODS, METHODS...]
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(proto_err("unsupported SOCKS version"));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: [VER, CMD, RSV, ATYP, DST.ADDR, DST.PORT]
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[1] != CMD_CONNECT {
        return Err(proto_err("only CONNECT is supported"));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| proto_err("domain is not valid UTF-8"))?
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            format!("[{}]", Ipv6Addr::from(ip))
        }
        _ => return Err(proto_err("unsupported address type")),
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    // Optimistic success reply; the real outcome is only known once the
    // tunnel starts forwarding.
    stream
        .write_all(&[SOCKS_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;

    Ok(format!("{host}:{port}"))
}
