use std::borrow::Cow;
use std::collections::HashMap;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::reply::{HTTP_BAD_REQUEST, HTTP_METHOD_NOT_ALLOWED};
use crate::request::{ParsedRequest, ProxyMode};
use crate::{Error, Result};

const MAX_LINE: u64 = 16 * 1024;
const MAX_HEADERS: usize = 128;
const MAX_BODY: usize = 10 * 1024 * 1024;

const FORWARD_METHODS: [&str; 8] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE",
];

const STRIPPED_HEADERS: [&str; 2] = ["proxy-connection", "proxy-authorization"];

/// Request head as received. Line bytes are kept raw so a forwarded request
/// leaves exactly as the client sent it; only lookups are decoded.
struct Request {
    method: String,
    uri: Vec<u8>,
    version: Vec<u8>,
    /// raw lines in arrival order, without line terminators
    header_lines: Vec<Vec<u8>>,
    /// lowercase name -> trimmed value
    headers: HashMap<String, String>,
}

impl Request {
    fn uri_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.uri)
    }
}

/// HTTP proxy front-end. Reads one request from a buffered client stream
/// that still holds the method's first byte.
pub struct HttpProxy<'a, S> {
    down_stream: &'a mut S,
    client_addr: &'a str,
}

impl<'a, S> HttpProxy<'a, S>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    pub fn new(down_stream: &'a mut S, client_addr: &'a str) -> Self {
        Self {
            down_stream,
            client_addr,
        }
    }

    pub async fn process(&mut self) -> Result<ParsedRequest> {
        let req = self.read_request().await?;
        debug!(
            client = self.client_addr,
            method = %req.method,
            uri = %req.uri_lossy(),
            "http request"
        );

        match req.method.as_str() {
            "CONNECT" => Ok(ParsedRequest::new(req.uri_lossy(), ProxyMode::HttpConnect)),
            m if FORWARD_METHODS.contains(&m) => self.forward(req).await,
            _ => {
                self.reject(HTTP_METHOD_NOT_ALLOWED).await;
                Err(Error::Rejected(format!("method {} not allowed", req.method)))
            }
        }
    }

    async fn forward(&mut self, req: Request) -> Result<ParsedRequest> {
        let (target, path): (String, &[u8]) = match req.uri.strip_prefix(b"http://") {
            Some(rest) => match rest.iter().position(|&b| b == b'/') {
                Some(idx) if idx > 0 => (lossy(&rest[..idx]), &rest[idx..]),
                _ => (lossy(rest), &b"/"[..]),
            },
            None => (
                req.headers.get("host").cloned().unwrap_or_default(),
                &req.uri[..],
            ),
        };

        if target.is_empty() {
            self.reject(HTTP_BAD_REQUEST).await;
            return Err(Error::Rejected("no target host".into()));
        }

        let target = with_default_port(target, 80);

        let request_line: [&[u8]; 6] =
            [req.method.as_bytes(), b" ", path, b" ", &req.version, b"\r\n"];
        let mut frame = Vec::new();
        for part in request_line {
            frame.extend_from_slice(part);
        }
        for line in &req.header_lines {
            if is_stripped(line) {
                continue;
            }
            frame.extend_from_slice(line);
            frame.extend_from_slice(b"\r\n");
        }
        frame.extend_from_slice(b"\r\n");

        let body_len = req
            .headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0 && n < MAX_BODY);
        if let Some(len) = body_len {
            let mut body = vec![0; len];
            // a short body is dropped, the headers still go out
            if self.down_stream.read_exact(&mut body).await.is_ok() {
                frame.extend_from_slice(&body);
            }
        }

        Ok(ParsedRequest::new(target, ProxyMode::HttpForward).with_first_frame(frame))
    }

    async fn read_request(&mut self) -> Result<Request> {
        let request_line = self.read_line().await?;
        let mut parts = request_line
            .split(|b: &u8| b.is_ascii_whitespace())
            .filter(|part| !part.is_empty());
        let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::protocol("malformed request line"));
        };
        let (method, uri, version) = (lossy(method), uri.to_vec(), version.to_vec());

        let mut header_lines = Vec::new();
        let mut headers = HashMap::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            if header_lines.len() == MAX_HEADERS {
                return Err(Error::protocol("too many headers"));
            }
            if let Some(idx) = line.iter().position(|&b| b == b':') {
                if idx > 0 {
                    headers.insert(
                        lossy(&line[..idx]).trim().to_ascii_lowercase(),
                        lossy(&line[idx + 1..]).trim().to_string(),
                    );
                }
            }
            header_lines.push(line);
        }

        Ok(Request {
            method,
            uri,
            version,
            header_lines,
            headers,
        })
    }

    /// One line with its terminator stripped.
    async fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        (&mut *self.down_stream)
            .take(MAX_LINE)
            .read_until(b'\n', &mut line)
            .await?;
        if !line.ends_with(b"\n") {
            return Err(Error::protocol("truncated or oversized request line"));
        }
        while matches!(line.last(), Some(b'\r' | b'\n')) {
            line.pop();
        }
        Ok(line)
    }

    async fn reject(&mut self, response: &[u8]) {
        let _ = self.down_stream.write_all(response).await;
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn is_stripped(line: &[u8]) -> bool {
    let name = line.split(|&b| b == b':').next().unwrap_or_default();
    let name = lossy(name).trim().to_ascii_lowercase();
    STRIPPED_HEADERS.contains(&name.as_str())
}

fn with_default_port(target: String, port: u16) -> String {
    let has_port = match target.strip_prefix('[') {
        Some(rest) => rest.contains("]:"),
        None => target.contains(':'),
    };
    if has_port {
        target
    } else {
        format!("{target}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, BufReader};

    async fn run(request: &[u8]) -> (Result<ParsedRequest>, Vec<u8>) {
        let (mut client, proxy) = duplex(64 * 1024);
        client.write_all(request).await.unwrap();

        let mut proxy = BufReader::new(proxy);
        let result = HttpProxy::new(&mut proxy, "test").process().await;
        drop(proxy);

        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        (result, written)
    }

    #[tokio::test]
    async fn connect_uses_uri_verbatim() {
        let (result, written) =
            run(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n").await;
        let req = result.unwrap();
        assert_eq!(req.target, "example.com:443");
        assert_eq!(req.mode, ProxyMode::HttpConnect);
        assert!(req.first_frame.is_none());
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn get_with_body() {
        let (result, _) = run(
            b"GET /x HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await;
        let req = result.unwrap();
        assert_eq!(req.target, "example.com:80");
        assert_eq!(req.mode, ProxyMode::HttpForward);
        assert_eq!(
            req.first_frame.unwrap(),
            b"GET /x HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello"
        );
    }

    #[tokio::test]
    async fn absolute_uri_and_proxy_headers() {
        let (result, _) = run(
            b"GET http://example.com:8080/a/b?c=d HTTP/1.1\r\n\
              Host: example.com:8080\r\n\
              Proxy-Connection: keep-alive\r\n\
              proxy-authorization: Basic Zm9v\r\n\
              Accept: */*\r\n\r\n",
        )
        .await;
        let req = result.unwrap();
        assert_eq!(req.target, "example.com:8080");
        assert_eq!(
            String::from_utf8(req.first_frame.unwrap()).unwrap(),
            "GET /a/b?c=d HTTP/1.1\r\nHost: example.com:8080\r\nAccept: */*\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn absolute_uri_without_path() {
        let (result, _) = run(b"HEAD http://example.com HTTP/1.0\r\n\r\n").await;
        let req = result.unwrap();
        assert_eq!(req.target, "example.com:80");
        assert!(req.first_frame.unwrap().starts_with(b"HEAD / HTTP/1.0\r\n"));
    }

    #[tokio::test]
    async fn missing_host_is_bad_request() {
        let (result, written) = run(b"GET /x HTTP/1.1\r\nAccept: */*\r\n\r\n").await;
        assert!(matches!(result, Err(Error::Rejected(_))));
        assert_eq!(written, HTTP_BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_method_not_allowed() {
        let (result, written) = run(b"PROPFIND / HTTP/1.1\r\nHost: a\r\n\r\n").await;
        assert!(matches!(result, Err(Error::Rejected(_))));
        assert_eq!(written, HTTP_METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn oversized_content_length_is_not_read() {
        let (result, _) = run(
            b"POST /up HTTP/1.1\r\nHost: a.example\r\nContent-Length: 99999999\r\n\r\n",
        )
        .await;
        let frame = result.unwrap().first_frame.unwrap();
        assert!(frame.ends_with(b"Content-Length: 99999999\r\n\r\n"));
    }

    #[tokio::test]
    async fn malformed_request_line_is_silent() {
        let (result, written) = run(b"GARBAGE\r\n\r\n").await;
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn non_utf8_bytes_forwarded_verbatim() {
        let raw: &[u8] = b"GET /caf\xe9?q=\xff HTTP/1.1\r\nHost: example.com\r\nX-Name: caf\xe9\r\n\r\n";
        let (result, _) = run(raw).await;
        let req = result.unwrap();
        assert_eq!(req.target, "example.com:80");
        assert_eq!(req.first_frame.unwrap(), raw);
    }

    #[tokio::test]
    async fn stripped_header_next_to_non_utf8_line() {
        let (result, _) = run(
            b"GET http://example.com/\xe9 HTTP/1.1\r\nProxy-Connection: keep-alive\r\nX-Name: \xe9\r\n\r\n",
        )
        .await;
        assert_eq!(
            result.unwrap().first_frame.unwrap(),
            b"GET /\xe9 HTTP/1.1\r\nX-Name: \xe9\r\n\r\n"
        );
    }

    #[test]
    fn default_port() {
        assert_eq!(with_default_port("a.example".into(), 80), "a.example:80");
        assert_eq!(with_default_port("a.example:81".into(), 80), "a.example:81");
        assert_eq!(with_default_port("[::1]".into(), 80), "[::1]:80");
        assert_eq!(with_default_port("[::1]:8080".into(), 80), "[::1]:8080");
    }
}
