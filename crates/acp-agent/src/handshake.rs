use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::{Host, Url};

/// RFC 6455 key suffix for `Sec-WebSocket-Accept`.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const MAX_RESPONSE_BYTES: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("invalid server url {0}")]
    InvalidUrl(String),
    #[error("unsupported scheme {0}; expected ws or wss")]
    UnsupportedScheme(String),
    #[error("handshake io: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed during handshake")]
    Closed,
    #[error("handshake response exceeds {MAX_RESPONSE_BYTES} bytes")]
    TooLarge,
    #[error("malformed handshake response: {0}")]
    Malformed(String),
    #[error("upgrade refused with status {0}")]
    Status(u16),
    #[error("Sec-WebSocket-Accept does not match the request key")]
    BadAccept,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    /// Request target: path plus query.
    pub path: String,
}

impl ServerTarget {
    pub fn parse(raw: &str) -> Result<Self, HandshakeError> {
        let url = Url::parse(raw).map_err(|err| HandshakeError::InvalidUrl(format!("{raw}: {err}")))?;
        let secure = match url.scheme() {
            "wss" => true,
            "ws" => false,
            other => return Err(HandshakeError::UnsupportedScheme(other.to_string())),
        };
        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(HandshakeError::InvalidUrl(format!("{raw}: missing host"))),
        };
        let port = url
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });
        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Self {
            secure,
            host,
            port,
            path,
        })
    }

    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let default_port = if self.secure { 443 } else { 80 };
        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    STANDARD.encode(nonce)
}

pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

pub fn build_request(target: &ServerTarget, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         User-Agent: acp-agent/{version}\r\n\
         \r\n",
        path = target.path,
        host = target.host_header(),
        version = env!("CARGO_PKG_VERSION"),
    )
}

/// Parses the upgrade response accumulated so far. `Ok(Some(n))` means the
/// header block is complete and spans the first `n` bytes.
pub fn parse_response(buf: &[u8], key: &str) -> Result<Option<usize>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    let header_len = match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_RESPONSE_BYTES {
                return Err(HandshakeError::TooLarge);
            }
            return Ok(None);
        }
        Err(err) => return Err(HandshakeError::Malformed(err.to_string())),
    };

    let status = response.code.unwrap_or_default();
    if status != 101 {
        return Err(HandshakeError::Status(status));
    }
    let accept = response
        .headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case("sec-websocket-accept"));
    if let Some(header) = accept {
        let value = std::str::from_utf8(header.value).map(str::trim).unwrap_or_default();
        if value != accept_key(key) {
            return Err(HandshakeError::BadAccept);
        }
    }
    Ok(Some(header_len))
}

/// Runs the client side of the upgrade on `stream` and returns any bytes the
/// server sent after the header block.
pub async fn perform<S>(stream: &mut S, target: &ServerTarget) -> Result<Vec<u8>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    stream.write_all(build_request(target, &key).as_bytes()).await?;
    stream.flush().await?;

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(HandshakeError::Closed);
        }
        buf.extend_from_slice(&chunk[..read]);
        if let Some(header_len) = parse_response(&buf, &key)? {
            return Ok(buf.split_off(header_len));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    #[test]
    fn accept_key_matches_rfc_sample() {
        assert_eq!(accept_key(SAMPLE_KEY), SAMPLE_ACCEPT);
    }

    #[test]
    fn generated_keys_are_16_random_bytes() {
        let key = generate_key();
        assert_eq!(STANDARD.decode(&key).expect("base64").len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn parses_targets() {
        let target = ServerTarget::parse("wss://relay.example.com/ws").expect("wss");
        assert!(target.secure);
        assert_eq!(target.port, 443);
        assert_eq!(target.path, "/ws");
        assert_eq!(target.host_header(), "relay.example.com");

        let target = ServerTarget::parse("ws://127.0.0.1:8787/ws?agent=1").expect("ws");
        assert!(!target.secure);
        assert_eq!(target.host, "127.0.0.1");
        assert_eq!(target.port, 8787);
        assert_eq!(target.path, "/ws?agent=1");
        assert_eq!(target.host_header(), "127.0.0.1:8787");

        let target = ServerTarget::parse("ws://[::1]:9000").expect("v6");
        assert_eq!(target.host, "::1");
        assert_eq!(target.path, "/");
        assert_eq!(target.host_header(), "[::1]:9000");

        assert!(matches!(
            ServerTarget::parse("https://relay.example.com/ws"),
            Err(HandshakeError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            ServerTarget::parse("not a url"),
            Err(HandshakeError::InvalidUrl(_))
        ));
    }

    #[test]
    fn request_carries_upgrade_headers() {
        let target = ServerTarget::parse("ws://relay.local:8787/ws").expect("target");
        let request = build_request(&target, SAMPLE_KEY);
        assert!(request.starts_with("GET /ws HTTP/1.1\r\n"));
        assert!(request.contains("Host: relay.local:8787\r\n"));
        assert!(request.contains("Upgrade: websocket\r\n"));
        assert!(request.contains(&format!("Sec-WebSocket-Key: {SAMPLE_KEY}\r\n")));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_parsing() {
        let ok = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {SAMPLE_ACCEPT}\r\n\r\nXYZ"
        );
        let len = parse_response(ok.as_bytes(), SAMPLE_KEY)
            .expect("valid")
            .expect("complete");
        assert_eq!(&ok.as_bytes()[len..], b"XYZ");

        assert!(parse_response(b"HTTP/1.1 101 Switching", SAMPLE_KEY)
            .expect("partial")
            .is_none());
        assert!(matches!(
            parse_response(b"HTTP/1.1 403 Forbidden\r\n\r\n", SAMPLE_KEY),
            Err(HandshakeError::Status(403))
        ));
        assert!(matches!(
            parse_response(
                b"HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: nope\r\n\r\n",
                SAMPLE_KEY
            ),
            Err(HandshakeError::BadAccept)
        ));
        // No accept header at all is tolerated.
        assert!(parse_response(b"HTTP/1.1 101 Switching Protocols\r\n\r\n", SAMPLE_KEY)
            .expect("valid")
            .is_some());
    }

    #[tokio::test]
    async fn perform_returns_bytes_after_headers() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut request = Vec::new();
            let mut chunk = [0u8; 256];
            while !request.ends_with(b"\r\n\r\n") {
                let read = server.read(&mut chunk).await.expect("read");
                request.extend_from_slice(&chunk[..read]);
            }
            let text = String::from_utf8(request).expect("utf8");
            let key = text
                .lines()
                .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
                .expect("key header")
                .trim()
                .to_string();
            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: {}\r\n\r\nextra",
                accept_key(&key)
            );
            server.write_all(response.as_bytes()).await.expect("write");
        });

        let target = ServerTarget::parse("ws://localhost:1/ws").expect("target");
        let leftover = perform(&mut client, &target).await.expect("handshake");
        assert_eq!(leftover, b"extra");
        server_task.await.expect("server");
    }
}
