//! HTTP/1.x message heads as seen by the proxy front-end
//!
//! Parses the request line and headers sent by a client, rewrites them for the
//! upstream hop and reads upstream response heads.

use bytes::{BufMut, BytesMut};
use http::header::{HeaderName, HeaderValue, CONNECTION, HOST, PROXY_AUTHORIZATION};
use http::{HeaderMap, Method, Uri};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{GateError, Result};
use crate::proxy::transport::{join_host_port, parse_authority};

/// Largest accepted head, start line and headers together
const MAX_HEAD: usize = 64 * 1024;
/// Header slots tried first; doubled up to `MAX_HEADERS` when a head carries more
const INITIAL_HEADERS: usize = 64;
const MAX_HEADERS: usize = 1024;

static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");
static KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

/// Check if a header is hop-by-hop and must not cross the proxy
///
/// `Transfer-Encoding` stays because bodies are streamed through unchanged.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "proxy-connection"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "trailer"
            | "upgrade"
    )
}

/// A parsed client request head
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Request target exactly as sent
    pub uri: String,
    pub proto: String,
    /// Raw `Proxy-Authorization` value
    pub auth: Option<String>,
    /// Headers with hop-by-hop entries removed and `Connection: close` set
    pub headers: HeaderMap,
    /// Upstream `host:port`
    pub target: String,
    /// Origin-form target used on the upstream hop
    pub request_uri: String,
}

impl Request {
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// Serialize the rewritten head for the upstream hop
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.request_uri.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.proto.as_bytes());
        buf.put_slice(b"\r\n");
        write_headers(&mut buf, &self.headers);
        buf
    }
}

/// Read and parse one request head
///
/// Returns `Ok(None)` when the client closed before sending anything.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(head) = read_head(reader, parse_request_head).await? else {
        return Ok(None);
    };
    let RawRequest {
        method,
        uri,
        proto,
        mut headers,
    } = head;

    let auth = headers
        .get(PROXY_AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (target, request_uri) = if method == Method::CONNECT {
        let (host, port) = parse_authority(&uri, 443)?;
        (join_host_port(&host, port), uri.clone())
    } else {
        resolve_target(&uri, &mut headers)?
    };

    clean_headers(&mut headers);
    headers.insert(CONNECTION, HeaderValue::from_static("close"));

    Ok(Some(Request {
        method,
        uri,
        proto,
        auth,
        headers,
        target,
        request_uri,
    }))
}

/// Derive `host:port` and the origin-form target for a plain HTTP request
fn resolve_target(uri: &str, headers: &mut HeaderMap) -> Result<(String, String)> {
    let absolute = uri
        .get(..7)
        .is_some_and(|p| p.eq_ignore_ascii_case("http://"))
        || uri
            .get(..8)
            .is_some_and(|p| p.eq_ignore_ascii_case("https://"));

    if absolute {
        let parsed: Uri = uri
            .parse()
            .map_err(|_| GateError::InvalidRequest(format!("bad request URI: {}", uri)))?;
        let authority = parsed
            .authority()
            .ok_or_else(|| GateError::InvalidRequest(format!("missing host in {}", uri)))?;

        // Plain requests are always relayed in cleartext, so every scheme defaults to 80
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        let port = authority.port_u16().unwrap_or(80);

        if !headers.contains_key(HOST) {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|_| GateError::InvalidRequest(format!("bad host: {}", authority)))?;
            headers.insert(HOST, value);
        }

        let request_uri = parsed
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/")
            .to_string();

        return Ok((join_host_port(host, port), request_uri));
    }

    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| GateError::InvalidRequest("missing Host header".to_string()))?;
    let (host, port) = parse_authority(host, 80)?;

    Ok((join_host_port(&host, port), uri.to_string()))
}

/// Drop hop-by-hop headers
pub fn clean_headers(headers: &mut HeaderMap) {
    let hop_by_hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();

    for name in hop_by_hop {
        headers.remove(name);
    }
}

/// An upstream response head
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub proto: String,
    pub code: u16,
    pub status: String,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Mark the response as the last one on this connection
    pub fn force_close(&mut self) {
        self.headers
            .insert(PROXY_CONNECTION.clone(), HeaderValue::from_static("close"));
        self.headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
        self.headers.remove(&KEEP_ALIVE);
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(self.proto.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(format!("{:03}", self.code).as_bytes());
        if !self.status.is_empty() {
            buf.put_u8(b' ');
            buf.put_slice(self.status.as_bytes());
        }
        buf.put_slice(b"\r\n");
        write_headers(&mut buf, &self.headers);
        buf
    }
}

/// Read and parse a response head from the upstream
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    read_head(reader, parse_response_head)
        .await?
        .ok_or_else(|| GateError::InvalidRequest("upstream closed before responding".to_string()))
}

/// Request line and headers as they came off the wire
struct RawRequest {
    method: Method,
    uri: String,
    proto: String,
    headers: HeaderMap,
}

/// Buffer bytes from `reader` until `parse` reports a complete head
///
/// Only the head is consumed; anything after it stays in the reader. Returns
/// `Ok(None)` on EOF before the first byte.
async fn read_head<R, T, F>(reader: &mut R, parse: F) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    F: Fn(&[u8]) -> Result<Option<(usize, T)>>,
{
    let mut buf = Vec::new();

    loop {
        let before = buf.len();
        let read = {
            let available = reader.fill_buf().await?;
            buf.extend_from_slice(available);
            available.len()
        };

        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(GateError::InvalidRequest("unexpected EOF in head".to_string()));
        }

        if let Some((len, head)) = parse(&buf)? {
            reader.consume(len.saturating_sub(before));
            return Ok(Some(head));
        }
        reader.consume(read);

        if buf.len() > MAX_HEAD {
            return Err(GateError::InvalidRequest("head too large".to_string()));
        }
    }
}

/// Run `parse` with a header table that grows while httparse runs out of slots
fn with_header_slots<'b, T>(
    mut parse: impl FnMut(&mut [httparse::Header<'b>]) -> std::result::Result<T, httparse::Error>,
) -> std::result::Result<T, httparse::Error> {
    let mut slots = INITIAL_HEADERS;
    loop {
        let mut headers: Vec<httparse::Header<'b>> = vec![httparse::EMPTY_HEADER; slots];
        match parse(&mut headers) {
            Err(httparse::Error::TooManyHeaders) if slots < MAX_HEADERS => slots *= 2,
            result => return result,
        }
    }
}

fn parse_request_head(buf: &[u8]) -> Result<Option<(usize, RawRequest)>> {
    let parsed = with_header_slots(|slots| {
        let mut req = httparse::Request::new(slots);
        Ok(match req.parse(buf)? {
            httparse::Status::Partial => None,
            httparse::Status::Complete(len) => Some((
                len,
                req.method.unwrap_or_default().to_string(),
                req.path.unwrap_or_default().to_string(),
                req.version.unwrap_or(1),
                header_map(req.headers),
            )),
        })
    })
    .map_err(|e| GateError::InvalidRequest(format!("malformed request head: {}", e)))?;

    let Some((len, method, uri, version, headers)) = parsed else {
        return Ok(None);
    };

    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| GateError::InvalidRequest(format!("bad method: {}", method)))?;

    Ok(Some((
        len,
        RawRequest {
            method,
            uri,
            proto: format!("HTTP/1.{}", version),
            headers: headers?,
        },
    )))
}

fn parse_response_head(buf: &[u8]) -> Result<Option<(usize, ResponseHead)>> {
    let parsed = with_header_slots(|slots| {
        let mut resp = httparse::Response::new(slots);
        Ok(match resp.parse(buf)? {
            httparse::Status::Partial => None,
            httparse::Status::Complete(len) => Some((
                len,
                ResponseHead {
                    proto: format!("HTTP/1.{}", resp.version.unwrap_or(1)),
                    code: resp.code.unwrap_or_default(),
                    status: resp.reason.unwrap_or_default().to_string(),
                    headers: HeaderMap::new(),
                },
                header_map(resp.headers),
            )),
        })
    })
    .map_err(|e| GateError::InvalidRequest(format!("malformed response head: {}", e)))?;

    match parsed {
        None => Ok(None),
        Some((len, mut head, headers)) => {
            head.headers = headers?;
            Ok(Some((len, head)))
        }
    }
}

/// Copy parsed headers into a `HeaderMap`, keeping values as raw bytes
fn header_map(raw: &[httparse::Header<'_>]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for header in raw {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| GateError::InvalidRequest(format!("bad header name: {}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| GateError::InvalidRequest(format!("bad value for {}", name)))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn write_headers(buf: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;
    use tokio_test::io::Builder;

    async fn parse(raw: &[u8]) -> Result<Option<Request>> {
        let mut builder = Builder::new();
        if !raw.is_empty() {
            builder.read(raw);
        }
        let mut reader = BufReader::new(builder.build());
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn test_parse_connect() {
        let req = parse(b"CONNECT example.com:8443 HTTP/1.1\r\nHost: example.com:8443\r\n\r\n")
            .await
            .unwrap()
            .unwrap();

        assert!(req.is_connect());
        assert_eq!(req.target, "example.com:8443");
        assert_eq!(req.proto, "HTTP/1.1");
        assert!(req.auth.is_none());
    }

    #[tokio::test]
    async fn test_parse_connect_default_port() {
        let req = parse(b"CONNECT example.com HTTP/1.0\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.target, "example.com:443");
        assert_eq!(req.proto, "HTTP/1.0");
    }

    #[tokio::test]
    async fn test_parse_absolute_uri_rewrites_head() {
        let raw = b"GET http://example.com/index.html?q=1 HTTP/1.1\r\n\
                    Proxy-Connection: keep-alive\r\n\
                    Proxy-Authorization: Basic dXNlcjpwYXNz\r\n\
                    Keep-Alive: timeout=5\r\n\
                    Transfer-Encoding: chunked\r\n\
                    Accept: */*\r\n\r\n";
        let req = parse(raw).await.unwrap().unwrap();

        assert_eq!(req.target, "example.com:80");
        assert_eq!(req.request_uri, "/index.html?q=1");
        assert_eq!(req.auth.as_deref(), Some("Basic dXNlcjpwYXNz"));
        assert_eq!(req.headers.get(HOST).unwrap(), "example.com");
        assert_eq!(req.headers.get(CONNECTION).unwrap(), "close");
        assert!(req.headers.get("proxy-connection").is_none());
        assert!(req.headers.get(PROXY_AUTHORIZATION).is_none());
        assert!(req.headers.get("keep-alive").is_none());
        assert_eq!(req.headers.get("transfer-encoding").unwrap(), "chunked");

        let encoded = String::from_utf8(req.encode().to_vec()).unwrap();
        assert!(encoded.starts_with("GET /index.html?q=1 HTTP/1.1\r\n"));
        assert!(encoded.contains("connection: close\r\n"));
        assert!(encoded.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_parse_origin_form_uses_host_header() {
        let req = parse(b"GET /status HTTP/1.1\r\nHost: [::1]:8080\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.target, "[::1]:8080");
        assert_eq!(req.request_uri, "/status");
    }

    #[tokio::test]
    async fn test_parse_absolute_uri_without_path() {
        let req = parse(b"GET http://example.com:8080 HTTP/1.1\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.target, "example.com:8080");
        assert_eq!(req.request_uri, "/");
        assert_eq!(req.headers.get(HOST).unwrap(), "example.com:8080");
    }

    #[tokio::test]
    async fn test_parse_rejects_bad_heads() {
        assert!(parse(b"GARBAGE\r\n\r\n").await.is_err());
        assert!(parse(b"GET / FTP/1.0\r\n\r\n").await.is_err());
        assert!(parse(b"GET /no-host HTTP/1.1\r\n\r\n").await.is_err());
        assert!(parse(b"GET http://example.com/ HTTP/1.1\r\nbad header\r\n\r\n")
            .await
            .is_err());
        assert!(parse(b"GET http://example.com/ HTTP/1.1\r\nAccept: */*\r\n")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_parse_eof_before_request() {
        assert!(parse(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parse_rejects_oversized_head() {
        let mut raw = b"GET /".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD + 10));
        raw.extend_from_slice(b" HTTP/1.1\r\n\r\n");
        assert!(parse(&raw).await.is_err());
    }

    #[tokio::test]
    async fn test_parse_https_absolute_uri_defaults_to_port_80() {
        let req = parse(b"GET https://example.com/login HTTP/1.1\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.target, "example.com:80");
        assert_eq!(req.request_uri, "/login");

        let req = parse(b"GET https://example.com:8443/ HTTP/1.1\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.target, "example.com:8443");
    }

    #[tokio::test]
    async fn test_parse_request_with_many_headers() {
        let mut raw = b"GET http://example.com/ HTTP/1.1\r\n".to_vec();
        for i in 0..150 {
            raw.extend_from_slice(format!("X-Trace-{}: {}\r\n", i, i).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");

        let req = parse(&raw).await.unwrap().unwrap();
        assert_eq!(req.headers.get("x-trace-149").unwrap(), "149");
        assert_eq!(req.target, "example.com:80");
    }

    #[tokio::test]
    async fn test_read_response_head_and_force_close() {
        let mut reader = BufReader::new(
            Builder::new()
                .read(b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nKeep-Alive: timeout=5\r\nContent-Length: 2\r\n\r\nok")
                .build(),
        );
        let mut head = read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.code, 200);
        assert_eq!(head.status, "OK");

        head.force_close();
        assert_eq!(head.headers.get(CONNECTION).unwrap(), "close");
        assert_eq!(head.headers.get("proxy-connection").unwrap(), "close");
        assert!(head.headers.get("keep-alive").is_none());

        let encoded = String::from_utf8(head.encode().to_vec()).unwrap();
        assert!(encoded.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(encoded.contains("content-length: 2\r\n"));

        // The body stays in the reader
        let mut body = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut body)
            .await
            .unwrap();
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_read_response_head_keeps_obs_text_values() {
        let mut raw = b"HTTP/1.1 200 OK\r\nContent-Disposition: attachment; filename=\"caf".to_vec();
        raw.push(0xE9);
        raw.extend_from_slice(b".txt\"\r\nContent-Length: 0\r\n\r\n");

        let mut reader = BufReader::new(Builder::new().read(&raw).build());
        let head = read_response_head(&mut reader).await.unwrap();

        let value = head.headers.get("content-disposition").unwrap();
        assert!(value.to_str().is_err());
        assert!(value.as_bytes().contains(&0xE9));

        let encoded = head.encode();
        assert!(encoded.windows(5).any(|w| w == b"caf\xE9."));
    }

    #[tokio::test]
    async fn test_read_response_head_with_many_headers() {
        let mut raw = b"HTTP/1.1 200 OK\r\n".to_vec();
        for i in 0..120 {
            raw.extend_from_slice(format!("Set-Cookie: c{}=v\r\n", i).as_bytes());
        }
        raw.extend_from_slice(b"Content-Length: 0\r\n\r\n");

        let mut reader = BufReader::new(Builder::new().read(&raw).build());
        let head = read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.headers.get_all("set-cookie").iter().count(), 120);
    }

    #[tokio::test]
    async fn test_read_response_head_split_across_reads() {
        let mut reader = BufReader::new(
            Builder::new()
                .read(b"HTTP/1.0 404 Not")
                .read(b" Found\r\nContent-Length: 0\r")
                .read(b"\n\r\n")
                .build(),
        );
        let head = read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.proto, "HTTP/1.0");
        assert_eq!(head.code, 404);
        assert_eq!(head.status, "Not Found");
    }

    #[tokio::test]
    async fn test_read_response_head_rejects_garbage() {
        let mut reader = BufReader::new(Builder::new().read(b"SSH-2.0-OpenSSH\r\n\r\n").build());
        assert!(read_response_head(&mut reader).await.is_err());
    }

    #[test]
    fn test_is_hop_by_hop_header() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("proxy-authorization"));
        assert!(is_hop_by_hop_header("Upgrade"));
        assert!(!is_hop_by_hop_header("Transfer-Encoding"));
        assert!(!is_hop_by_hop_header("Content-Type"));
    }
}
