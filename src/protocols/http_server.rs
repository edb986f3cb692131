//! HTTPS front door for the AirDrop endpoints.
//!
//! A deliberately small HTTP/1.1 server over rustls: per-connection task,
//! request-line and header parse, `Content-Length`-bounded bodies, dispatch
//! on method and path. Keep-alive is honoured whenever the body was fully
//! consumed. Next to the three AirDrop POSTs it serves delivered files back
//! to peers under `/uploads/`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::{Certificate as RustlsCert, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocols::airdrop::{AirDropService, UPLOAD_CONTENT_TYPE};
use crate::protocols::wire::PLIST_MAX_BYTES;
use crate::utils::{BridgeError, BridgeResult};

const MAX_HEADER_LINE: usize = 16 * 1024;
const MAX_HEADERS: usize = 100;

pub struct HttpServer {
    acceptor: TlsAcceptor,
    service: Arc<AirDropService>,
}

impl HttpServer {
    pub fn new(service: Arc<AirDropService>) -> BridgeResult<Self> {
        let config = build_rustls_config()?;
        Ok(HttpServer {
            acceptor: TlsAcceptor::from(config),
            service,
        })
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        info!("airdrop https server listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, remote).await {
                                debug!(%remote, error = %e, "connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "https accept failed");
                        break;
                    }
                },
            }
        }
        debug!("airdrop https server stopped");
    }

    async fn handle_connection(&self, stream: TcpStream, remote: SocketAddr) -> BridgeResult<()> {
        let tls = self.acceptor.accept(stream).await?;
        let mut io = BufReader::new(tls);
        while let Some(request) = read_request(&mut io).await? {
            debug!(%remote, method = %request.method, path = %request.path, "request");
            let keep_alive = self.handle_request(&mut io, &request).await?;
            if !keep_alive {
                break;
            }
        }
        Ok(())
    }

    /// Dispatch one request. Returns whether the connection may be reused:
    /// it may not once a body was skipped or left half-read.
    async fn handle_request<R>(&self, io: &mut R, request: &Request) -> BridgeResult<bool>
    where
        R: AsyncBufRead + AsyncWrite + Unpin,
    {
        let content_length = request.content_length()?;
        match (request.method.as_str(), request.path.as_str()) {
            ("POST", "/Discover" | "/Ask" | "/Upload") => {
                let host = request.header("host").unwrap_or("");
                let Some(peer) = self.service.registry.lookup_host(host).await else {
                    // Unknown receiver: answer before touching the body.
                    write_response(io, 404, b"unknown receiver").await?;
                    return Ok(false);
                };

                if request.path == "/Upload" {
                    let content_type = request
                        .header("content-type")
                        .unwrap_or("")
                        .split(';')
                        .next()
                        .unwrap_or("")
                        .trim()
                        .to_ascii_lowercase();
                    if content_type != UPLOAD_CONTENT_TYPE {
                        write_response(io, 422, b"expected application/x-cpio").await?;
                        return Ok(false);
                    }
                    let mut body = (&mut *io).take(content_length);
                    match self.service.upload(&peer, &mut body).await {
                        Ok(()) => {
                            write_response(io, 200, b"").await?;
                            Ok(true)
                        }
                        Err(e) => {
                            self.write_error(io, &e).await?;
                            Ok(false)
                        }
                    }
                } else {
                    if content_length > PLIST_MAX_BYTES as u64 {
                        write_response(io, 400, b"body exceeds property list cap").await?;
                        return Ok(false);
                    }
                    let mut body = vec![0u8; content_length as usize];
                    io.read_exact(&mut body).await?;
                    let result = if request.path == "/Discover" {
                        self.service.discover(&peer, &body).await
                    } else {
                        self.service.ask(&peer, &body).await
                    };
                    match result {
                        Ok(payload) => {
                            write_response(io, 200, &payload).await?;
                            Ok(true)
                        }
                        Err(e) => {
                            self.write_error(io, &e).await?;
                            Ok(true)
                        }
                    }
                }
            }
            ("GET", path) if path.starts_with("/uploads/") => {
                self.serve_upload(io, path).await?;
                Ok(true)
            }
            _ => {
                write_response(io, 404, b"not found").await?;
                Ok(content_length == 0)
            }
        }
    }

    async fn write_error<W>(&self, io: &mut W, error: &BridgeError) -> BridgeResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let status = error.http_status();
        if status >= 500 {
            warn!(status, error = %error, "request failed");
        } else {
            info!(status, error = %error, "request refused");
        }
        let body = if status == 406 {
            // Rejection is the answer; the body stays empty.
            Vec::new()
        } else {
            error.to_string().into_bytes()
        };
        write_response(io, status, &body).await
    }

    async fn serve_upload<R>(&self, io: &mut R, path: &str) -> BridgeResult<()>
    where
        R: AsyncWrite + Unpin,
    {
        let Some(rel) = decode_upload_path(path) else {
            write_response(io, 404, b"no such file").await?;
            return Ok(());
        };
        let full = self.service.upload_root().join(rel);
        match tokio::fs::File::open(&full).await {
            Ok(mut file) => {
                let len = file.metadata().await?.len();
                write_head(io, 200, len).await?;
                tokio::io::copy(&mut file, io).await?;
                io.flush().await?;
                Ok(())
            }
            Err(_) => {
                write_response(io, 404, b"no such file").await?;
                Ok(())
            }
        }
    }
}

struct Request {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn content_length(&self) -> BridgeResult<u64> {
        match self.header("content-length") {
            None => Ok(0),
            Some(value) => value
                .parse()
                .map_err(|_| BridgeError::Plist(format!("bad content-length {value:?}"))),
        }
    }
}

/// Read one request head. `None` means the client closed the connection
/// cleanly between requests.
async fn read_request<R>(io: &mut R) -> BridgeResult<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if io.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        if line.len() > MAX_HEADER_LINE {
            return Err(BridgeError::Plist("request line too long".into()));
        }
        if !line.trim_end().is_empty() {
            break;
        }
        // Tolerate stray blank lines between pipelined requests.
    }

    let start = line.trim_end().to_string();
    let mut parts = start.split_whitespace();
    let (Some(method), Some(path), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(BridgeError::Plist(format!("bad request line {start:?}")));
    };
    let method = method.to_string();
    let path = path.to_string();

    let mut headers = Vec::new();
    loop {
        line.clear();
        if io.read_line(&mut line).await? == 0 {
            return Err(BridgeError::Plist("connection closed mid-headers".into()));
        }
        if line.len() > MAX_HEADER_LINE || headers.len() > MAX_HEADERS {
            return Err(BridgeError::Plist("oversized request head".into()));
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        let Some((name, value)) = trimmed.split_once(':') else {
            return Err(BridgeError::Plist(format!("bad header line {trimmed:?}")));
        };
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }

    Ok(Some(Request {
        method,
        path,
        headers,
    }))
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        406 => "Not Acceptable",
        422 => "Unprocessable Entity",
        502 => "Bad Gateway",
        _ => "Internal Server Error",
    }
}

async fn write_head<W>(io: &mut W, status: u16, len: u64) -> BridgeResult<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: application/octet-stream\r\nContent-Length: {len}\r\nConnection: keep-alive\r\n\r\n",
        reason(status)
    );
    io.write_all(head.as_bytes()).await?;
    Ok(())
}

async fn write_response<W>(io: &mut W, status: u16, body: &[u8]) -> BridgeResult<()>
where
    W: AsyncWrite + Unpin,
{
    write_head(io, status, body.len() as u64).await?;
    io.write_all(body).await?;
    io.flush().await?;
    Ok(())
}

/// Self-signed certificate for `airdrop.local`: matching CN and SAN,
/// serverAuth EKU, one year of validity. AirDrop senders accept any
/// certificate on the local link; the name just has to be consistent.
fn build_rustls_config() -> BridgeResult<Arc<ServerConfig>> {
    info!("generating self-signed https certificate");
    let mut params = CertificateParams::new(vec!["airdrop.local".to_string()]);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "airdrop.local");
    params.distinguished_name = dn;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(365);

    let cert = Certificate::from_params(params).map_err(|e| BridgeError::Other(e.into()))?;
    let cert_der = cert.serialize_der().map_err(|e| BridgeError::Other(e.into()))?;
    let key_der = cert.serialize_private_key_der();

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![RustlsCert(cert_der)], PrivateKey(key_der))
        .map_err(|e| BridgeError::Other(e.into()))?;
    Ok(Arc::new(config))
}

/// Percent-encode one path segment for the URLs sent to peers.
pub(crate) fn encode_path_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn decode_path_segment(segment: &str) -> Option<String> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 3 > bytes.len() {
                return None;
            }
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Map `/uploads/...` to a path relative to the upload root, refusing
/// anything that could step outside it.
fn decode_upload_path(path: &str) -> Option<PathBuf> {
    let rel = path.strip_prefix("/uploads/")?;
    let mut out = PathBuf::new();
    for segment in rel.split('/') {
        if segment.is_empty() {
            continue;
        }
        let segment = decode_path_segment(segment)?;
        if segment == "." || segment == ".." || segment.contains(['/', '\\', ':']) {
            return None;
        }
        out.push(segment);
    }
    if out.as_os_str().is_empty() {
        return None;
    }
    Some(out)
}
