//! HTTP probe plumbing: test-URL parsing, hand-written HEAD round trips, and
//! the timed GET used for throughput estimation. Requests are written
//! directly onto the adapter-dialed stream; responses are parsed only as far
//! as the status line and header boundary.

use crate::error::CoreError;
use crate::types::{join_host_port, Metadata, Network};
use crate::util::ewma::MovingAverage;
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-read cap for the download loop, independent of the advertised
/// Content-Length.
const DOWNLOAD_CHUNK: usize = 64 * 1024;

const RESPONSE_HEAD_LIMIT: usize = 16 * 1024;

/// A probe destination parsed out of a test URL.
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Request target: path plus any query string.
    pub path: String,
}

impl ProbeTarget {
    pub fn metadata(&self) -> Result<Metadata, CoreError> {
        let mut md = Metadata::new(Network::Tcp);
        md.set_remote_address(&join_host_port(&self.host, self.port))?;
        Ok(md)
    }

    fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            join_host_port(&self.host, self.port)
        }
    }
}

/// Splits a test URL into dialable parts. `http` defaults to port 80,
/// `https` to 443; any other scheme is refused.
pub fn parse_probe_url(url: &str) -> Result<ProbeTarget, CoreError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| CoreError::InvalidUrl(url.to_string()))?;
    let (tls, default_port) = match scheme {
        "http" => (false, 80),
        "https" => (true, 443),
        _ => return Err(CoreError::UnknownScheme(url.to_string())),
    };
    let (authority, path) = match rest.split_once('/') {
        Some((authority, tail)) => (authority, format!("/{tail}")),
        None => (rest, "/".to_string()),
    };
    if authority.is_empty() {
        return Err(CoreError::InvalidUrl(url.to_string()));
    }
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| CoreError::InvalidUrl(url.to_string()))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| CoreError::InvalidUrl(url.to_string()))?,
            None => default_port,
        };
        (host.to_string(), port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse()
                    .map_err(|_| CoreError::InvalidUrl(url.to_string()))?,
            ),
            None => (authority.to_string(), default_port),
        }
    };
    if host.is_empty() {
        return Err(CoreError::InvalidUrl(url.to_string()));
    }
    Ok(ProbeTarget {
        host,
        port,
        tls,
        path,
    })
}

static TLS_CONFIG: Lazy<Arc<rustls::ClientConfig>> = Lazy::new(|| {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
});

/// Wraps an established stream in a TLS client session for `host`.
pub async fn tls_handshake(
    stream: crate::adapter::BoxedStream,
    host: &str,
) -> Result<crate::adapter::BoxedStream, CoreError> {
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| CoreError::Transport(format!("invalid sni host: {e}")))?;
    let connector = tokio_rustls::TlsConnector::from(TLS_CONFIG.clone());
    let tls = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(server_name, stream))
        .await
        .map_err(|_| CoreError::Timeout(TLS_HANDSHAKE_TIMEOUT))?
        .map_err(|e| CoreError::Transport(format!("tls handshake: {e}")))?;
    Ok(Box::new(tls))
}

/// Writes one HEAD request and reads the response head, returning the status
/// code. Keep-alive is requested so a follow-up probe can reuse the
/// connection.
pub async fn head_roundtrip<S>(stream: &mut S, target: &ProbeTarget) -> Result<u16, CoreError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let request = format!(
        "HEAD {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: flowgate\r\nAccept: */*\r\n\r\n",
        target.path,
        target.host_header(),
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| CoreError::Transport(e.to_string()))?;
    let (status, _leftover) = read_response_head(stream).await?;
    Ok(status)
}

/// Issues a GET and reads the body for exactly `window`, returning estimated
/// bytes per second. Throughput is smoothed over 100 equal time slices of
/// the window.
pub async fn download_speed<S>(
    stream: &mut S,
    target: &ProbeTarget,
    window: Duration,
) -> Result<f64, CoreError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: flowgate\r\nAccept: */*\r\n\r\n",
        target.path,
        target.host_header(),
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| CoreError::Transport(e.to_string()))?;
    let (status, leftover) = read_response_head(stream).await?;
    if status != 200 {
        return Err(CoreError::Transport(format!(
            "unexpected download status {status}"
        )));
    }

    let start = Instant::now();
    let deadline = start + window;
    let slice = window / 100;
    let mut avg = MovingAverage::new();
    let mut content_read = leftover.len() as u64;
    let mut last_read = 0u64;
    let mut slice_index = 1u32;
    let mut next_tick = start + slice * slice_index;
    let mut buf = vec![0u8; DOWNLOAD_CHUNK];

    loop {
        let now = Instant::now();
        if now >= next_tick {
            slice_index += 1;
            next_tick = start + slice * slice_index;
            avg.add((content_read - last_read) as f64);
            last_read = content_read;
        }
        if now >= deadline {
            break;
        }
        match tokio::time::timeout(deadline - now, stream.read(&mut buf)).await {
            // Window elapsed mid-read.
            Err(_) => break,
            Ok(Ok(0)) => {
                // Early EOF: fold the partial slice in, scaled by how much of
                // the slice actually elapsed. The ratio can be near zero when
                // EOF lands on a slice boundary, so it is guarded.
                let remaining = next_tick.saturating_duration_since(now).as_secs_f64();
                let ratio = remaining / slice.as_secs_f64();
                if ratio > f64::EPSILON {
                    avg.add((content_read - last_read) as f64 / ratio);
                }
                break;
            }
            Ok(Ok(n)) => content_read += n as u64,
            Ok(Err(e)) => return Err(CoreError::Transport(e.to_string())),
        }
    }
    // Average bytes per slice, converted to bytes per second.
    Ok(avg.value() / (window.as_secs_f64() / 100.0))
}

/// Reads until the end of the response headers; returns the status code and
/// any body bytes pulled in along with the head.
async fn read_response_head<S>(stream: &mut S) -> Result<(u16, Vec<u8>), CoreError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    let boundary = loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        if n == 0 {
            return Err(CoreError::Transport(
                "connection closed before response head".into(),
            ));
        }
        head.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_header_end(&head) {
            break end;
        }
        if head.len() > RESPONSE_HEAD_LIMIT {
            return Err(CoreError::Transport("response head too large".into()));
        }
    };
    let status = parse_status_line(&head)?;
    Ok((status, head.split_off(boundary)))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_status_line(head: &[u8]) -> Result<u16, CoreError> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| CoreError::Transport("missing status line".into()))?;
    let line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| CoreError::Transport("status line is not utf-8".into()))?;
    if !line.starts_with("HTTP/1.") {
        return Err(CoreError::Transport(format!("not an http response: {line}")));
    }
    line.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| CoreError::Transport(format!("bad status line: {line}")))
}
