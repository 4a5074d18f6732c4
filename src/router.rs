use crate::error::ForwardError;
use crate::pool::{ConnectionPool, PoolConfig};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded port
const X_FORWARDED_PORT: &str = "x-forwarded-port";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Upper bound on the backend's upgrade response head
const MAX_UPGRADE_HEAD: usize = 16 * 1024;
/// Upper bound on the body of a refused upgrade
const MAX_REJECTION_BODY: usize = 1024 * 1024;

/// Forwards requests and upgrades to the fixed loopback backend
pub struct ProxyRouter {
    target: String,
    pool: ConnectionPool,
    request_timeout: Duration,
}

impl ProxyRouter {
    pub fn new(target: String, request_timeout: Duration, pool_config: PoolConfig) -> Self {
        Self {
            target,
            pool: ConnectionPool::new(pool_config),
            request_timeout,
        }
    }

    /// The `host:port` every request is sent to
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Forward an HTTP request and stream the backend's response back.
    ///
    /// Connectivity failures become a 502; nothing is retried.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        add_forwarded_headers(req.headers_mut(), client_addr, "http");

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!(%method, path, backend = %self.target, "Forwarding request");

        let result = tokio::time::timeout(
            self.request_timeout,
            self.pool.send_request(req, &self.target),
        )
        .await;

        match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(%method, path, backend = %self.target, error = %e, "Proxy error");
                e.into_response()
            }
            Err(_) => {
                let e = ForwardError::Timeout(self.request_timeout);
                warn!(%method, path, backend = %self.target, error = %e, "Proxy error");
                e.into_response()
            }
        }
    }

    /// Forward an upgrade handshake and, once the backend switches
    /// protocols, splice the two connections until either side closes.
    pub async fn forward_upgrade(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        add_forwarded_headers(req.headers_mut(), client_addr, "ws");

        let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
        debug!(upgrade_type, backend = %self.target, "Handling upgrade request");

        let (mut backend_stream, head) = match self.upgrade_handshake(&req).await {
            Ok(handshake) => handshake,
            Err(e) => {
                error!(upgrade_type, backend = %self.target, error = %e, "Proxy error on upgrade");
                return e.into_response();
            }
        };

        let (status, response_headers, leftover) = head;

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(status = %status, "Backend rejected upgrade request");

            let framing = BodyFraming::of(status, &response_headers);
            let read = tokio::time::timeout(
                self.request_timeout,
                read_rejection_body(&mut backend_stream, framing, leftover),
            );
            let body = match read.await {
                Ok(Ok(body)) => body,
                Ok(Err(e)) => {
                    error!(status = %status, error = %e, "Failed to read rejected upgrade body");
                    return e.into_response();
                }
                Err(_) => return ForwardError::Timeout(self.request_timeout).into_response(),
            };

            let mut response = Response::builder().status(status);
            for (name, value) in &response_headers {
                if is_framing_header(name) {
                    continue;
                }
                response = response.header(name.as_str(), value.as_slice());
            }
            return response
                .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
                .unwrap_or_else(|_| ForwardError::InvalidResponse.into_response());
        }

        info!(upgrade_type, "Upgrade accepted by backend");

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &response_headers {
            if is_framing_header(name) {
                continue;
            }
            response = response.header(name.as_str(), value.as_slice());
        }

        let response = match response
            .body(Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
        {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Backend sent unusable upgrade headers");
                return ForwardError::InvalidResponse.into_response();
            }
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    debug!(upgrade_type, "Client upgrade complete, starting forwarding");
                    forward_bidirectional(upgraded, backend_stream, leftover).await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to upgrade client connection");
                }
            }
        });

        response
    }

    /// Connect to the backend, send the raw upgrade request and read the
    /// response head. Returns the open stream, the parsed head and any bytes
    /// the backend sent after the head.
    async fn upgrade_handshake(
        &self,
        req: &Request<Incoming>,
    ) -> Result<(TcpStream, UpgradeHead), ForwardError> {
        let raw_request = build_upgrade_request(req, &self.target);

        let mut backend_stream =
            match tokio::time::timeout(self.request_timeout, TcpStream::connect(&self.target)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(ForwardError::Connect(e)),
                Err(_) => return Err(ForwardError::Timeout(self.request_timeout)),
            };

        backend_stream
            .write_all(&raw_request)
            .await
            .map_err(ForwardError::Connect)?;

        let read = tokio::time::timeout(self.request_timeout, read_response_head(&mut backend_stream));
        let (head, leftover) = match read.await {
            Ok(result) => result?,
            Err(_) => return Err(ForwardError::Timeout(self.request_timeout)),
        };

        let (status, headers) =
            parse_upgrade_response(&head).ok_or(ForwardError::InvalidResponse)?;

        Ok((backend_stream, (status, headers, leftover)))
    }
}

/// Status, headers and early body bytes of the backend's upgrade answer
type UpgradeHead = (StatusCode, Vec<(String, Vec<u8>)>, Vec<u8>);

/// Append the client to the X-Forwarded-* chain.
///
/// `for`, `port` and `proto` are appended to any value the client sent;
/// `host` is only set when absent.
pub fn add_forwarded_headers(headers: &mut HeaderMap, client_addr: SocketAddr, proto: &str) {
    let port = headers
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.rsplit_once(':'))
        .map(|(_, port)| port.to_string())
        .unwrap_or_else(|| "80".to_string());

    append_header(headers, X_FORWARDED_FOR, &client_addr.ip().to_string());
    append_header(headers, X_FORWARDED_PORT, &port);
    append_header(headers, X_FORWARDED_PROTO, proto);

    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = headers.get(hyper::header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }
}

fn append_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    let combined = match headers.get(name).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{},{}", existing, value),
        _ => value.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(name, value);
    }
}

/// Check if a request asks for a protocol upgrade (e.g. WebSocket)
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
}

/// Build the raw HTTP/1.1 upgrade request sent to the backend
fn build_upgrade_request<B>(req: &Request<B>, target: &str) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path).into_bytes();

    for (name, value) in req.headers() {
        request.extend_from_slice(name.as_str().as_bytes());
        request.extend_from_slice(b": ");
        request.extend_from_slice(value.as_bytes());
        request.extend_from_slice(b"\r\n");
    }

    if !req.headers().contains_key(hyper::header::HOST) {
        request.extend_from_slice(format!("host: {}\r\n", target).as_bytes());
    }
    request.extend_from_slice(b"\r\n");

    request
}

/// Read until the end of the response head. Returns the head and whatever
/// followed it in the same reads.
async fn read_response_head(stream: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>), ForwardError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await.map_err(ForwardError::Connect)?;
        if n == 0 {
            return Err(ForwardError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(ForwardError::InvalidResponse);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// How the body of a non-101 upgrade answer is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Length(usize),
    Chunked,
    UntilClose,
}

impl BodyFraming {
    fn of(status: StatusCode, headers: &[(String, Vec<u8>)]) -> Self {
        if status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return BodyFraming::Length(0);
        }

        let value = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .and_then(|(_, v)| std::str::from_utf8(v).ok())
        };

        if value("transfer-encoding")
            .map(|te| te.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
        {
            return BodyFraming::Chunked;
        }

        match value("content-length").and_then(|v| v.trim().parse().ok()) {
            Some(len) => BodyFraming::Length(len),
            None => BodyFraming::UntilClose,
        }
    }
}

/// Keep reading a refused upgrade's body after the head. `body` starts with
/// the bytes that arrived together with the head. Chunked bodies are
/// decoded, since the client gets them re-framed with a content length.
async fn read_rejection_body(
    stream: &mut TcpStream,
    framing: BodyFraming,
    mut body: Vec<u8>,
) -> Result<Vec<u8>, ForwardError> {
    let mut chunk = [0u8; 4096];

    loop {
        match framing {
            BodyFraming::Length(len) if body.len() >= len => {
                body.truncate(len);
                return Ok(body);
            }
            BodyFraming::Chunked => {
                if let Some(decoded) = decode_chunked(&body)? {
                    return Ok(decoded);
                }
            }
            _ => {}
        }

        if body.len() > MAX_REJECTION_BODY {
            return Err(ForwardError::InvalidResponse);
        }

        let n = stream.read(&mut chunk).await.map_err(ForwardError::Connect)?;
        if n == 0 {
            return match framing {
                BodyFraming::UntilClose => Ok(body),
                _ => Err(ForwardError::Closed),
            };
        }
        body.extend_from_slice(&chunk[..n]);
    }
}

/// Decode a complete chunked body, or `None` if more bytes are needed
fn decode_chunked(buf: &[u8]) -> Result<Option<Vec<u8>>, ForwardError> {
    let mut decoded = Vec::new();
    let mut pos = 0;

    loop {
        let line_end = match buf[pos..].windows(2).position(|w| w == b"\r\n") {
            Some(i) => pos + i,
            None => return Ok(None),
        };
        let size_line =
            std::str::from_utf8(&buf[pos..line_end]).map_err(|_| ForwardError::InvalidResponse)?;
        let size_hex = size_line.split(';').next().unwrap_or_default().trim();
        let size =
            usize::from_str_radix(size_hex, 16).map_err(|_| ForwardError::InvalidResponse)?;
        let data_start = line_end + 2;

        if size == 0 {
            // Optional trailers, then an empty line
            let rest = &buf[data_start..];
            let done = rest.starts_with(b"\r\n") || find_head_end(rest).is_some();
            return Ok(done.then_some(decoded));
        }

        let data_end = data_start + size;
        if buf.len() < data_end + 2 {
            return Ok(None);
        }
        decoded.extend_from_slice(&buf[data_start..data_end]);
        pos = data_end + 2;
    }
}

/// Parse the status line and headers of the backend's upgrade response
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, Vec<u8>)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.split("\r\n");

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let status_code: u16 = parts.next()?.parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().as_bytes().to_vec()));
        }
    }

    Some((status, headers))
}

/// Copy bytes both ways between client and backend until either closes.
/// `early` holds backend bytes that arrived with the 101 head.
async fn forward_bidirectional(client: Upgraded, mut backend: TcpStream, early: Vec<u8>) {
    let mut client_io = TokioIo::new(client);

    if !early.is_empty() {
        if let Err(e) = client_io.write_all(&early).await {
            debug!(error = %e, "Failed to relay early backend bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(error = %e, "Upgraded connection closed with error");
        }
    }
}
