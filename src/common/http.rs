//! Minimal HTTP/1.1 client over an outbound's stream.
//!
//! Subscription downloads and latency probes must dial through a configured
//! outbound, so a general-purpose HTTP client is of no use here: requests are
//! written directly onto whatever stream the outbound hands back, with an
//! optional rustls wrap for https destinations. Redirects are never followed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;

use crate::common::{Address, ProxyStream};
use crate::proxy::{DialOptions, OutboundHandler, Session};

/// Parsed probe / fetch target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ParsedUrl {
    pub fn address(&self) -> Address {
        Address::Domain(self.host.clone(), self.port)
    }
}

/// 解析简单 URL 为 (scheme, host, port, path)
pub fn parse_url(url: &str) -> ParsedUrl {
    let (tls, rest) = if let Some(r) = url.strip_prefix("https://") {
        (true, r)
    } else if let Some(r) = url.strip_prefix("http://") {
        (false, r)
    } else {
        (false, url)
    };

    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    let default_port: u16 = if tls { 443 } else { 80 };

    let (host, port) = match host_port.rfind(':') {
        Some(idx) => {
            let port_str = &host_port[idx + 1..];
            match port_str.parse::<u16>() {
                Ok(p) => (host_port[..idx].to_string(), p),
                Err(_) => (host_port.to_string(), default_port),
            }
        }
        None => (host_port.to_string(), default_port),
    };

    ParsedUrl {
        tls,
        host,
        port,
        path: path.to_string(),
    }
}

fn tls_client_config() -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(config)
}

/// Open a stream to the URL's host through the given outbound, wrapping it
/// with TLS for https targets.
pub async fn open(
    outbound: &dyn OutboundHandler,
    url: &ParsedUrl,
    opts: &DialOptions,
) -> Result<ProxyStream> {
    let session = Session::tcp(url.address());
    let stream = outbound.connect(&session, opts).await?;
    if !url.tls {
        return Ok(stream);
    }
    let config = tls_client_config()?;
    let server_name = ServerName::try_from(url.host.clone())
        .with_context(|| format!("invalid TLS server name: {}", url.host))?;
    let connector = TlsConnector::from(Arc::new(config));
    let tls_stream = connector.connect(server_name, stream).await?;
    Ok(Box::new(tls_stream))
}

/// Issue a GET and wait for the first response byte, returning the elapsed
/// wall-clock time measured from before the dial.
pub async fn first_byte(
    outbound: &dyn OutboundHandler,
    url: &str,
    opts: &DialOptions,
) -> Result<Duration> {
    let parsed = parse_url(url);
    let start = Instant::now();
    let mut stream = open(outbound, &parsed, opts).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        parsed.path, parsed.host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        anyhow::bail!("empty response from {}", parsed.host);
    }
    Ok(start.elapsed())
}

/// Issue a GET and read the whole response. Returns (status code, body).
/// Redirects are not followed; the caller decides what status is acceptable.
pub async fn fetch(
    outbound: &dyn OutboundHandler,
    url: &str,
    opts: &DialOptions,
) -> Result<(u16, Vec<u8>)> {
    let parsed = parse_url(url);
    let mut stream = open(outbound, &parsed, opts).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        parsed.path, parsed.host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::with_capacity(8 * 1024);
    let mut buf = [0u8; 8 * 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buf[..n]);
    }

    split_response(&raw)
}

fn split_response(raw: &[u8]) -> Result<(u16, Vec<u8>)> {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow::anyhow!("malformed HTTP response: missing header terminator"))?;
    let header_text = String::from_utf8_lossy(&raw[..header_end]);
    let status_line = header_text.lines().next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("malformed HTTP status line: {:?}", status_line))?;

    let chunked = header_text.lines().any(|line| {
        let lower = line.to_ascii_lowercase();
        lower.starts_with("transfer-encoding:") && lower.contains("chunked")
    });

    let body = &raw[header_end + 4..];
    let body = if chunked {
        dechunk(body)?
    } else {
        body.to_vec()
    };
    Ok((status, body))
}

fn dechunk(mut body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    loop {
        let line_end = body
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| anyhow::anyhow!("malformed chunked body: missing size line"))?;
        let size_text = std::str::from_utf8(&body[..line_end])?;
        let size_text = size_text.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| anyhow::anyhow!("malformed chunk size: {:?}", size_text))?;
        body = &body[line_end + 2..];
        if size == 0 {
            break;
        }
        if body.len() < size + 2 {
            anyhow::bail!("truncated chunked body");
        }
        out.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }
    Ok(out)
}
