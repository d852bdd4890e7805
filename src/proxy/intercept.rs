//! The INSPECT data path.
//!
//! After CONNECT is upgraded, this module terminates the client's TLS with a
//! leaf from the certificate cache, decodes the single HTTP/1.1 request,
//! classifies the body, applies the enforcement verdict, and relays the
//! upstream response annotated with diagnostic headers.
//!
//! Two properties shape the control flow:
//!
//! - **Block short-circuits.** The upstream connection is only opened after
//!   the verdict is known, so a blocked exchange never touches the network.
//! - **Decode failure falls back to tunneling.** Non-HTTP traffic that lands
//!   on an inspected host is spliced through raw (re-encrypted upstream)
//!   instead of being dropped. Interception is best-effort; breaking traffic
//!   is not acceptable.

use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::error::ProxyError;
use super::server::ExchangeContext;
use super::tls::{create_tls_acceptor, create_tls_connector, domain_to_server_name};
use crate::classifier::{self, Classification};
use crate::enforcement::{self, EnforcementMode, Verdict};
use crate::recorder::{ActivityEvent, ExchangeRecord};

/// Maximum bytes of request head we will buffer.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Maximum request body we will decode; larger bodies fall back to tunneling.
const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Deadline for reading the request head and body from the client.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for connecting and handshaking with the upstream host.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

/// A decoded HTTP/1.1 request.
struct DecodedRequest {
    method: String,
    path: String,
    /// Headers in original order, names lowercased.
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl DecodedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Run the full interception exchange on an upgraded CONNECT stream.
pub async fn intercept_exchange(
    upgraded: Upgraded,
    host: &str,
    port: u16,
    ctx: Arc<ExchangeContext>,
) -> Result<(), ProxyError> {
    let started = Instant::now();

    let cert_cache = ctx
        .cert_cache
        .clone()
        .ok_or_else(|| ProxyError::Tls("certificate authority unavailable".into()))?;

    // Terminate the client's TLS with our leaf.
    let acceptor = create_tls_acceptor(cert_cache, host.to_string());
    let mut client = acceptor
        .accept(TokioIo::new(upgraded))
        .await
        .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))?;

    debug!("TLS established with client for {}:{}", host, port);

    // Decode one HTTP request; on failure, splice the connection through.
    let mut buffered = Vec::new();
    let request = match decode_request(&mut client, &mut buffered).await {
        Ok(request) => request,
        Err(e) => {
            debug!(
                "Decode failed for {}:{} ({}), falling back to raw tunnel",
                host, port, e
            );
            return splice_with_upstream(client, &buffered, host, port).await;
        }
    };

    let settings = ctx.settings_rx.borrow().clone();
    let body_text = String::from_utf8_lossy(&request.body).into_owned();

    // Classification is deterministic local scanning and must not fail for
    // well-formed input; if it somehow does, the content is treated as
    // maximal risk rather than silently allowed.
    let (classification, files_meta) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
        || classify_exchange(&settings, &request, &body_text),
    ))
    .unwrap_or_else(|_| (Classification::maximal("classifier panicked"), None));

    let mode = enforcement::resolve_enforcement_mode(&settings);
    let verdict = enforcement::decide(&classification, mode, settings.risk_threshold, &body_text);

    // Build and record the activity event before any response goes back.
    let event = ActivityEvent::from_exchange(ExchangeRecord {
        host,
        api_path: &request.path,
        user: &ctx.user,
        content: &body_text,
        classification: &classification,
        enforcement_action: verdict.action(),
        blocked: verdict.is_block(),
        full_audit: settings.full_audit_mode,
        files: files_meta.as_deref(),
    });
    let event_id = event.id.clone();
    ctx.recorder.record(event);

    match verdict {
        Verdict::Block { reason } => {
            info!("Blocking exchange to {} ({})", host, reason);
            let body = block_body(&reason, &classification, &event_id, started);
            write_json_response(&mut client, 403, "Forbidden", &body, &response_headers(&event_id, &classification, mode, started)).await?;
            client.shutdown().await.ok();
            Ok(())
        }
        Verdict::Warn { reason } => {
            // The request proceeds; the caller gets a soft signal instead of
            // the upstream body, with the upstream status attached.
            let upstream_status =
                match forward_discarding_response(&request, &request.body, host, port).await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!("Upstream failed during warn forward for {}: {}", host, e);
                        let body = serde_json::json!({
                            "error": "upstream_unreachable",
                            "message": e.to_string(),
                        });
                        write_json_response(&mut client, 502, "Bad Gateway", &body, &response_headers(&event_id, &classification, mode, started)).await?;
                        client.shutdown().await.ok();
                        return Ok(());
                    }
                };
            info!("Warned exchange to {} ({})", host, reason);
            let body = serde_json::json!({
                "warning": true,
                "override_allowed": true,
                "reason": reason,
                "enforcement_mode": "warn",
                "classification": &classification,
                "upstream_status": upstream_status,
                "event_id": event_id,
                "processing_time_ms": started.elapsed().as_millis() as u64,
            });
            write_json_response(&mut client, 299, "Flagged", &body, &response_headers(&event_id, &classification, mode, started)).await?;
            client.shutdown().await.ok();
            Ok(())
        }
        Verdict::Redact { body, spans, reason } => {
            info!("Redacted {} span(s) for {} ({})", spans, host, reason);
            relay_exchange(
                &mut client,
                &request,
                body.as_bytes(),
                host,
                port,
                &response_headers(&event_id, &classification, mode, started),
            )
            .await
        }
        Verdict::Allow | Verdict::Monitor => {
            relay_exchange(
                &mut client,
                &request,
                &request.body,
                host,
                port,
                &response_headers(&event_id, &classification, mode, started),
            )
            .await
        }
    }
}

/// Classify one decoded exchange.
///
/// Multipart uploads go file-by-file when the workspace asks for attachment
/// inspection; everything else scans the body directly. Returns the
/// classification and, for uploads, the (name, content type) inventory.
fn classify_exchange(
    settings: &crate::config::ProxySettings,
    request: &DecodedRequest,
    body_text: &str,
) -> (Classification, Option<Vec<(String, String)>>) {
    if settings.inspect_attachments {
        if let Some(boundary) = multipart_boundary(request.header("content-type")) {
            let parts = parse_multipart(&request.body, &boundary);
            if !parts.is_empty() {
                let scans: Vec<_> = parts
                    .iter()
                    .map(|p| {
                        classifier::scan_file(
                            &p.filename,
                            &p.content_type,
                            &String::from_utf8_lossy(&p.data),
                        )
                    })
                    .collect();
                let meta = parts
                    .iter()
                    .map(|p| (p.filename.clone(), p.content_type.clone()))
                    .collect();
                return (classifier::classify_files(&scans), Some(meta));
            }
        }
    }
    (classifier::classify(body_text), None)
}

/// Diagnostic headers added to every inspected response.
fn response_headers(
    event_id: &str,
    classification: &Classification,
    mode: EnforcementMode,
    started: Instant,
) -> Vec<(String, String)> {
    vec![
        ("x-promptguard-event-id".into(), event_id.to_string()),
        (
            "x-promptguard-sensitivity".into(),
            classification.sensitivity_score.to_string(),
        ),
        ("x-promptguard-mode".into(), mode.as_str().to_string()),
        (
            "x-promptguard-processing-ms".into(),
            (started.elapsed().as_millis() as u64).to_string(),
        ),
    ]
}

/// Structured rejection body, distinguishable from a genuine upstream error.
fn block_body(
    reason: &str,
    classification: &Classification,
    event_id: &str,
    started: Instant,
) -> serde_json::Value {
    serde_json::json!({
        "blocked": true,
        "reason": reason,
        "enforcement_mode": "block",
        "classification": classification,
        "event_id": event_id,
        "processing_time_ms": started.elapsed().as_millis() as u64,
    })
}

/// Read and parse one HTTP/1.1 request from the client stream.
///
/// All bytes consumed are also appended to `buffered` so a decode failure can
/// hand the intact stream to the raw tunnel fallback.
async fn decode_request<S>(client: &mut S, buffered: &mut Vec<u8>) -> Result<DecodedRequest, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let head_end = tokio::time::timeout(READ_TIMEOUT, read_head(client, buffered))
        .await
        .map_err(|_| ProxyError::Timeout)??;

    let head = &buffered[..head_end];
    let (method, path, headers) = parse_request_head(head)?;

    if headers.iter().any(|(n, _)| n == "transfer-encoding") {
        return Err(ProxyError::Decode("chunked request body".into()));
    }

    let content_length: usize = headers
        .iter()
        .find(|(n, _)| n == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse()
                .map_err(|_| ProxyError::Decode(format!("bad content-length: {}", v)))
        })
        .transpose()?
        .unwrap_or(0);

    if content_length > MAX_BODY_BYTES {
        return Err(ProxyError::Decode(format!(
            "body too large to decode: {} bytes",
            content_length
        )));
    }

    // Body bytes may already be sitting in the buffer past the head.
    let mut body = buffered[head_end..].to_vec();
    while body.len() < content_length {
        let mut chunk = vec![0u8; (content_length - body.len()).min(64 * 1024)];
        let n = tokio::time::timeout(READ_TIMEOUT, client.read(&mut chunk))
            .await
            .map_err(|_| ProxyError::Timeout)??;
        if n == 0 {
            return Err(ProxyError::Decode("connection closed mid-body".into()));
        }
        chunk.truncate(n);
        buffered.extend_from_slice(&chunk);
        body.extend_from_slice(&chunk);
    }
    body.truncate(content_length);

    Ok(DecodedRequest {
        method,
        path,
        headers,
        body,
    })
}

/// Read until the end of the header block (`\r\n\r\n`), returning the offset
/// just past it.
async fn read_head<S>(client: &mut S, buffered: &mut Vec<u8>) -> Result<usize, ProxyError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = find_double_crlf(buffered) {
            return Ok(pos);
        }
        if buffered.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::Decode("request head too large".into()));
        }

        let mut chunk = [0u8; 8 * 1024];
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::Decode("connection closed before head".into()));
        }
        buffered.extend_from_slice(&chunk[..n]);
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parse the request line and header block.
fn parse_request_head(head: &[u8]) -> Result<(String, String, Vec<(String, String)>), ProxyError> {
    let text = std::str::from_utf8(head).map_err(|_| ProxyError::Decode("non-UTF8 head".into()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| ProxyError::Decode("empty head".into()))?;
    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty() && m.chars().all(|c| c.is_ascii_uppercase()))
        .ok_or_else(|| ProxyError::Decode("bad request line".into()))?
        .to_string();
    let path = parts
        .next()
        .filter(|p| p.starts_with('/'))
        .ok_or_else(|| ProxyError::Decode("bad request path".into()))?
        .to_string();
    let version = parts
        .next()
        .ok_or_else(|| ProxyError::Decode("missing HTTP version".into()))?;
    if !version.starts_with("HTTP/1.") {
        return Err(ProxyError::Decode(format!("unsupported version: {}", version)));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::Decode(format!("bad header line: {}", line)))?;
        headers.push((name.trim().to_lowercase(), value.trim().to_string()));
    }

    Ok((method, path, headers))
}

/// Extract the multipart boundary from a content-type header, if any.
fn multipart_boundary(content_type: Option<&str>) -> Option<String> {
    let ct = content_type?;
    if !ct.to_lowercase().starts_with("multipart/form-data") {
        return None;
    }
    ct.split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').to_string())
}

/// One file part of a multipart upload.
struct MultipartFile {
    filename: String,
    content_type: String,
    data: Vec<u8>,
}

/// Minimal multipart/form-data parser: extracts file parts only.
fn parse_multipart(body: &[u8], boundary: &str) -> Vec<MultipartFile> {
    let delimiter = format!("--{}", boundary);
    let text = String::from_utf8_lossy(body);
    let mut files = Vec::new();

    for segment in text.split(delimiter.as_str()).skip(1) {
        let segment = segment.trim_start_matches("\r\n");
        if segment.starts_with("--") {
            break; // closing delimiter
        }
        let Some((head, data)) = segment.split_once("\r\n\r\n") else {
            continue;
        };

        let mut filename = None;
        let mut content_type = "application/octet-stream".to_string();
        for line in head.split("\r\n") {
            let lower = line.to_lowercase();
            if lower.starts_with("content-disposition:") {
                filename = line
                    .split(';')
                    .map(str::trim)
                    .find_map(|p| p.strip_prefix("filename="))
                    .map(|f| f.trim_matches('"').to_string());
            } else if let Some(ct) = lower.strip_prefix("content-type:") {
                content_type = ct.trim().to_string();
            }
        }

        // Parts without a filename are ordinary form fields, not uploads.
        if let Some(filename) = filename {
            files.push(MultipartFile {
                filename,
                content_type,
                data: data.trim_end_matches("\r\n").as_bytes().to_vec(),
            });
        }
    }

    files
}

/// Open a validated TLS connection to the real upstream host.
async fn connect_upstream(
    host: &str,
    port: u16,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ProxyError> {
    let addr = format!("{}:{}", host, port);
    let tcp = tokio::time::timeout(UPSTREAM_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: addr.clone(),
            message: e.to_string(),
        })?;

    let connector = create_tls_connector()?;
    let server_name = domain_to_server_name(host)?;
    let tls = tokio::time::timeout(UPSTREAM_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(|e| ProxyError::Tls(format!("Upstream TLS handshake failed: {}", e)))?;

    debug!("TLS established with upstream {}:{}", host, port);
    Ok(tls)
}

/// Serialize the forwarded request head with a (possibly rewritten) body
/// length and `Connection: close` so the upstream response is EOF-delimited.
fn build_forward_head(request: &DecodedRequest, body_len: usize) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\n", request.method, request.path).into_bytes();
    for (name, value) in &request.headers {
        if name == "content-length" || name == "connection" || name == "proxy-connection" {
            continue;
        }
        head.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    if body_len > 0 || request.method == "POST" || request.method == "PUT" {
        head.extend_from_slice(format!("content-length: {}\r\n", body_len).as_bytes());
    }
    head.extend_from_slice(b"connection: close\r\n\r\n");
    head
}

/// Forward the request and relay the upstream response back to the client,
/// injecting the diagnostic headers into the response head.
async fn relay_exchange<S>(
    client: &mut S,
    request: &DecodedRequest,
    body: &[u8],
    host: &str,
    port: u16,
    diag_headers: &[(String, String)],
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = match connect_upstream(host, port).await {
        Ok(upstream) => upstream,
        Err(e) => {
            // Upstream failure surfaces as a gateway error, not a dropped
            // connection; the activity event was already recorded.
            warn!("Upstream connect failed for {}:{}: {}", host, port, e);
            let body = serde_json::json!({
                "error": "upstream_unreachable",
                "message": e.to_string(),
            });
            write_json_response(client, 502, "Bad Gateway", &body, diag_headers).await?;
            client.shutdown().await.ok();
            return Ok(());
        }
    };

    upstream.write_all(&build_forward_head(request, body.len())).await?;
    upstream.write_all(body).await?;
    upstream.flush().await?;

    // Read the upstream response head so we can annotate it.
    let mut response_buf = Vec::new();
    let head_end = tokio::time::timeout(READ_TIMEOUT, read_head(&mut upstream, &mut response_buf))
        .await
        .map_err(|_| ProxyError::Timeout)??;

    let head = &response_buf[..head_end];
    let annotated = inject_response_headers(head, diag_headers)?;
    client.write_all(&annotated).await?;

    // Remaining buffered body bytes, then stream until upstream EOF.
    client.write_all(&response_buf[head_end..]).await?;
    tokio::io::copy(&mut upstream, client).await?;
    client.flush().await?;
    client.shutdown().await.ok();

    Ok(())
}

/// Forward the request but discard the upstream response body, returning only
/// its status code. Used for warn verdicts, where the caller receives the
/// structured warning instead.
async fn forward_discarding_response(
    request: &DecodedRequest,
    body: &[u8],
    host: &str,
    port: u16,
) -> Result<u16, ProxyError> {
    let mut upstream = connect_upstream(host, port).await?;

    upstream.write_all(&build_forward_head(request, body.len())).await?;
    upstream.write_all(body).await?;
    upstream.flush().await?;

    let mut response_buf = Vec::new();
    let head_end = tokio::time::timeout(READ_TIMEOUT, read_head(&mut upstream, &mut response_buf))
        .await
        .map_err(|_| ProxyError::Timeout)??;

    let status = parse_status_code(&response_buf[..head_end])?;

    // Drain the remainder so the upstream sees a clean close.
    let mut sink = tokio::io::sink();
    tokio::io::copy(&mut upstream, &mut sink).await.ok();

    Ok(status)
}

fn parse_status_code(head: &[u8]) -> Result<u16, ProxyError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| ProxyError::Decode("non-UTF8 response head".into()))?;
    let status_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| ProxyError::Decode("empty response head".into()))?;
    status_line
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProxyError::Decode(format!("bad status line: {}", status_line)))
}

/// Rebuild a response head with the diagnostic headers inserted after the
/// status line.
fn inject_response_headers(
    head: &[u8],
    diag_headers: &[(String, String)],
) -> Result<Vec<u8>, ProxyError> {
    let split = find_crlf(head).ok_or_else(|| ProxyError::Decode("bad response head".into()))?;
    let mut out = Vec::with_capacity(head.len() + 128);
    out.extend_from_slice(&head[..split + 2]);
    for (name, value) in diag_headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(&head[split + 2..]);
    Ok(out)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Write a complete JSON response with the diagnostic headers and close
/// framing.
async fn write_json_response<S>(
    client: &mut S,
    status: u16,
    reason: &str,
    body: &serde_json::Value,
    diag_headers: &[(String, String)],
) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(body).unwrap_or_default();
    let mut response = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n",
        status,
        reason,
        payload.len()
    )
    .into_bytes();
    for (name, value) in diag_headers {
        response.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    response.extend_from_slice(b"\r\n");
    response.extend_from_slice(&payload);

    client.write_all(&response).await?;
    client.flush().await?;
    Ok(())
}

/// Raw tunnel fallback after a decode failure: replay the bytes already read
/// from the client, then splice both directions until either side closes.
async fn splice_with_upstream<S>(
    client: S,
    buffered: &[u8],
    host: &str,
    port: u16,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = connect_upstream(host, port).await?;
    upstream.write_all(buffered).await?;
    upstream.flush().await?;

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = async { tokio::io::copy(&mut client_read, &mut upstream_write).await };
    let upstream_to_client = async { tokio::io::copy(&mut upstream_read, &mut client_write).await };

    tokio::select! {
        result = client_to_upstream => {
            if let Err(e) = result {
                debug!("Client->upstream copy ended: {}", e);
            }
        }
        result = upstream_to_client => {
            if let Err(e) = result {
                debug!("Upstream->client copy ended: {}", e);
            }
        }
    }

    debug!("Fallback tunnel closed for {}:{}", host, port);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoded(method: &str, path: &str, headers: &[(&str, &str)], body: &[u8]) -> DecodedRequest {
        DecodedRequest {
            method: method.to_string(),
            path: path.to_string(),
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn test_parse_request_head() {
        let head = b"POST /v1/chat/completions HTTP/1.1\r\nhost: api.openai.com\r\ncontent-length: 5\r\n\r\n";
        let (method, path, headers) = parse_request_head(head).unwrap();
        assert_eq!(method, "POST");
        assert_eq!(path, "/v1/chat/completions");
        assert_eq!(headers[0], ("host".to_string(), "api.openai.com".to_string()));
    }

    #[test]
    fn test_parse_request_head_rejects_garbage() {
        assert!(parse_request_head(b"\x16\x03\x01 garbage\r\n\r\n").is_err());
        assert!(parse_request_head(b"GET\r\n\r\n").is_err());
        assert!(parse_request_head(b"GET /x SPDY/3\r\n\r\n").is_err());
    }

    #[test]
    fn test_find_double_crlf() {
        assert_eq!(find_double_crlf(b"a\r\n\r\nbody"), Some(5));
        assert_eq!(find_double_crlf(b"incomplete\r\n"), None);
    }

    #[tokio::test]
    async fn test_decode_request_with_body() {
        let raw = b"POST /v1/messages HTTP/1.1\r\nhost: api.anthropic.com\r\ncontent-length: 11\r\n\r\nhello world";
        let mut reader = &raw[..];
        let mut buffered = Vec::new();
        let request = decode_request(&mut reader, &mut buffered).await.unwrap();

        assert_eq!(request.method, "POST");
        assert_eq!(request.body, b"hello world");
        // Everything consumed is retained for the fallback path.
        assert_eq!(buffered, raw);
    }

    #[tokio::test]
    async fn test_decode_rejects_chunked() {
        let raw = b"POST /x HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n0\r\n\r\n";
        let mut reader = &raw[..];
        let mut buffered = Vec::new();
        assert!(decode_request(&mut reader, &mut buffered).await.is_err());
    }

    #[tokio::test]
    async fn test_decode_rejects_tls_bytes() {
        // A TLS record where HTTP was expected (e.g. pinned client retrying).
        let raw = b"\x16\x03\x01\x02\x00\x01\x00\x01\xfc\x03\x03\r\n\r\n";
        let mut reader = &raw[..];
        let mut buffered = Vec::new();
        assert!(decode_request(&mut reader, &mut buffered).await.is_err());
    }

    #[test]
    fn test_build_forward_head_rewrites_length_and_connection() {
        let request = decoded(
            "POST",
            "/v1/x",
            &[
                ("host", "api.openai.com"),
                ("content-length", "100"),
                ("connection", "keep-alive"),
                ("authorization", "Bearer abc"),
            ],
            b"",
        );
        let head = String::from_utf8(build_forward_head(&request, 42)).unwrap();

        assert!(head.starts_with("POST /v1/x HTTP/1.1\r\n"));
        assert!(head.contains("content-length: 42\r\n"));
        assert!(head.contains("connection: close\r\n"));
        assert!(head.contains("authorization: Bearer abc\r\n"));
        assert!(!head.contains("keep-alive"));
    }

    #[test]
    fn test_inject_response_headers() {
        let head = b"HTTP/1.1 200 OK\r\nserver: upstream\r\n\r\n";
        let diag = vec![("x-promptguard-sensitivity".to_string(), "15".to_string())];
        let annotated = inject_response_headers(head, &diag).unwrap();
        let text = String::from_utf8(annotated).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\nx-promptguard-sensitivity: 15\r\n"));
        assert!(text.contains("server: upstream\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code(b"HTTP/1.1 200 OK\r\n\r\n").unwrap(), 200);
        assert_eq!(
            parse_status_code(b"HTTP/1.1 429 Too Many Requests\r\n\r\n").unwrap(),
            429
        );
        assert!(parse_status_code(b"garbage\r\n\r\n").is_err());
    }

    #[test]
    fn test_multipart_boundary_extraction() {
        assert_eq!(
            multipart_boundary(Some("multipart/form-data; boundary=XYZ")),
            Some("XYZ".to_string())
        );
        assert_eq!(
            multipart_boundary(Some("multipart/form-data; boundary=\"quoted\"")),
            Some("quoted".to_string())
        );
        assert_eq!(multipart_boundary(Some("application/json")), None);
        assert_eq!(multipart_boundary(None), None);
    }

    #[test]
    fn test_parse_multipart_extracts_files() {
        let body = b"--XYZ\r\n\
            content-disposition: form-data; name=\"purpose\"\r\n\r\n\
            assistants\r\n\
            --XYZ\r\n\
            content-disposition: form-data; name=\"file\"; filename=\"w2.txt\"\r\n\
            content-type: text/plain\r\n\r\n\
            SSN 123-45-6789\r\n\
            --XYZ--\r\n";
        let files = parse_multipart(body, "XYZ");

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "w2.txt");
        assert_eq!(files[0].content_type, "text/plain");
        assert_eq!(files[0].data, b"SSN 123-45-6789");
    }

    #[test]
    fn test_parse_multipart_empty() {
        assert!(parse_multipart(b"not multipart at all", "XYZ").is_empty());
    }
}
