//! Minimal HTTP/1.1 plumbing for CONNECT tunnels
//!
//! The gateway only ever sees one request per connection and the client
//! only ever opens tunnels, so a hand-rolled head parser is all that is
//! needed. Bytes that arrive after the head belong to the tunneled stream
//! and are handed back to the caller.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Upper bound for a request or response head.
const MAX_HEAD_SIZE: usize = 8 * 1024;

/// A parsed request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The token of an `Authorization: Bearer <token>` header.
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.header("authorization")?;
        let (scheme, token) = value.split_once(' ')?;
        if scheme.eq_ignore_ascii_case("bearer") {
            Some(token.trim())
        } else {
            None
        }
    }
}

/// Read bytes until the end of the head; returns head bytes and whatever
/// arrived beyond it.
async fn read_head<R>(reader: &mut R) -> Result<(Vec<u8>, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(pos) = find_head_end(&buf) {
            let trailing = buf.split_off(pos);
            return Ok((buf, trailing));
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(Error::Http("header section too large".into()));
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Http("connection closed before end of header".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_headers(lines: std::str::Lines<'_>) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Http(format!("malformed header line: {line:?}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

/// Read and parse one request head. The second element of the result is
/// trailing data that was already received past the head.
pub async fn read_request_head<R>(reader: &mut R) -> Result<(RequestHead, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let (head, trailing) = read_head(reader).await?;
    let head = std::str::from_utf8(&head).map_err(|_| Error::Http("head is not UTF-8".into()))?;

    let mut lines = head.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| Error::Http("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::Http("missing method".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| Error::Http("missing request target".into()))?;
    match parts.next() {
        Some(version) if version.starts_with("HTTP/1.") => {}
        _ => return Err(Error::Http("unsupported HTTP version".into())),
    }

    Ok((
        RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            headers: parse_headers(lines)?,
        },
        trailing,
    ))
}

/// Write a short response with an optional plain-text body and close-delimited
/// semantics (the gateway always finishes the connection after an error).
pub async fn write_response<W>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: Option<&str>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
    match body {
        Some(body) => {
            head.push_str("Content-Type: text/plain; charset=utf-8\r\n");
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
            head.push_str("Connection: close\r\n\r\n");
            head.push_str(body);
        }
        None => head.push_str("\r\n"),
    }
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Open a CONNECT tunnel on an established stream.
///
/// On success the stream carries the tunneled protocol; bytes the peer sent
/// past the response head are returned.
pub async fn open_tunnel<S>(stream: &mut S, authority: &str, token: &str) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "CONNECT {authority} HTTP/1.1\r\n\
         Host: {authority}\r\n\
         Authorization: Bearer {token}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let (head, trailing) = read_head(stream).await?;
    let head = std::str::from_utf8(&head).map_err(|_| Error::Http("head is not UTF-8".into()))?;
    let status_line = head
        .lines()
        .next()
        .ok_or_else(|| Error::Http("empty response".into()))?;

    let mut parts = status_line.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| Error::Http("missing HTTP version".into()))?;
    if !version.starts_with("HTTP/1.") {
        return Err(Error::Http(format!("unexpected version: {version}")));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Http("missing status code".into()))?;
    if status != 200 {
        return Err(Error::Http(format!(
            "tunnel request failed with status {status}"
        )));
    }

    Ok(trailing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let client_task = tokio::spawn(async move {
            let trailing = open_tunnel(&mut client, "tcp:scpi@3", "secret").await.unwrap();
            (client, trailing)
        });

        let (head, trailing) = read_request_head(&mut server).await.unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "tcp:scpi@3");
        assert_eq!(head.bearer_token(), Some("secret"));
        assert!(trailing.is_empty());

        write_response(&mut server, 200, "Connection established", None)
            .await
            .unwrap();
        // Data sent right after the head must survive the handshake.
        tokio::io::AsyncWriteExt::write_all(&mut server, b"early").await.unwrap();

        let (_client, trailing) = client_task.await.unwrap();
        assert_eq!(trailing, b"early");
    }

    #[tokio::test]
    async fn test_non_200_fails() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let client_task =
            tokio::spawn(async move { open_tunnel(&mut client, "tcp:x@1", "nope").await });

        let (_head, _) = read_request_head(&mut server).await.unwrap();
        write_response(&mut server, 403, "Forbidden", Some("not allowed\n"))
            .await
            .unwrap();

        assert!(client_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_trailing_data_after_request_head() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(
            &mut client,
            b"CONNECT usb:1-2@1 HTTP/1.1\r\nAuthorization: Bearer t\r\n\r\n\x01\x11",
        )
        .await
        .unwrap();

        let (head, trailing) = read_request_head(&mut server).await.unwrap();
        assert_eq!(head.target, "usb:1-2@1");
        assert_eq!(trailing, b"\x01\x11");
    }

    #[tokio::test]
    async fn test_malformed_request_line() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"BOGUS\r\n\r\n")
            .await
            .unwrap();
        assert!(read_request_head(&mut server).await.is_err());
    }
}
