//! The HTTP/1.1 side of the rdv handshake.
//!
//! rdv needs exactly one request head and one response head per connection,
//! after which the stream is hijacked into a raw bearer. This module is that
//! subset: a head reader that preserves any bytes past the head, writers for
//! the upgrade request and response, and terminal plain-text error responses.

use std::{io, net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use url::Url;

use crate::{
    addr::{format_addrs, parse_addrs},
    conn::Meta,
    error::Error,
};

/// The name carried in the `Upgrade` header.
pub(crate) const PROTOCOL_NAME: &str = "rdv/1";

/// Upper bound on addresses exchanged per peer, observed address included.
pub(crate) const MAX_ADDRS: usize = 10;

/// Token for this rdv conn, chosen by a client. Request and response.
const H_TOKEN: &str = "Rdv-Token";

/// Comma-separated list of self-reported ip:port addrs. Request only.
const H_SELF_ADDRS: &str = "Rdv-Self-Addrs";

/// A comma-separated list of observed and self-reported ip:port addrs of the
/// peer. Response only.
const H_PEER_ADDRS: &str = "Rdv-Peer-Addrs";

/// Observed public ipv4:port addr of the requesting client, from the server's
/// point of view. Response only.
const H_OBSERVED_ADDR: &str = "Rdv-Observed-Addr";

/// Cap on the request or response head, start line and headers included.
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// How much of an error response body is kept for diagnosis.
const SLURP_LIMIT: usize = 1024;

/// Deadline for writes that happen right before closing a conn.
pub(crate) const VERY_SOON: Duration = Duration::from_millis(10);

const SLURP_TIMEOUT: Duration = Duration::from_secs(1);

/// A parsed HTTP/1.1 head: the start line, the header fields, and whatever
/// bytes arrived past the terminating blank line.
#[derive(Debug)]
pub(crate) struct Head {
    pub line: String,
    pub headers: Vec<(String, String)>,
    pub leftover: Vec<u8>,
}

/// Reads one head off the stream. Bytes past the blank line end up in
/// [`Head::leftover`]: a protocol violation server-side, early relayed bytes
/// client-side.
pub(crate) async fn read_head<R: AsyncRead + Unpin>(r: &mut R) -> Result<Head, Error> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];
    let end = loop {
        let n = r.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        let search_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);
        if let Some(at) = find_terminator(&buf[search_from..]) {
            break search_from + at;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(Error::Protocol("http head too large".into()));
        }
    };

    let leftover = buf.split_off(end + 4);
    buf.truncate(end);
    let text = std::str::from_utf8(&buf)
        .map_err(|_| Error::Protocol("http head is not valid utf-8".into()))?;

    let mut lines = text.split("\r\n");
    let line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::Protocol("empty http head".into()))?
        .to_owned();
    let mut headers = Vec::new();
    for header in lines {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("bad http header [{header}]")))?;
        headers.push((name.trim().to_owned(), value.trim().to_owned()));
    }
    Ok(Head {
        line,
        headers,
        leftover,
    })
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

pub(crate) fn get_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Checks the `Connection` and `Upgrade` headers. `single` additionally
/// requires rdv to be the only offered protocol, which both sides of this
/// implementation always send.
fn check_upgrade(headers: &[(String, String)], single: bool) -> Result<(), Error> {
    let connection = get_header(headers, "Connection").unwrap_or("");
    if !connection.eq_ignore_ascii_case("upgrade") {
        return Err(Error::Upgrade("requires connection upgrade".into()));
    }
    let upgrade = get_header(headers, "Upgrade").unwrap_or("");
    if upgrade.is_empty() {
        return Err(Error::Upgrade("missing upgrade header".into()));
    }
    let mut protos = upgrade.split(',').map(|p| p.trim().to_ascii_lowercase());
    if !protos.any(|p| p == PROTOCOL_NAME) || (single && upgrade.contains(',')) {
        return Err(Error::Upgrade(format!("bad upgrade {upgrade}")));
    }
    Ok(())
}

/// The upgrade request a client sent, kept on the server-side [`Conn`] for
/// logging and for custom observed-address extraction (e.g. reading
/// `X-Forwarded-For` behind a reverse proxy).
///
/// [`Conn`]: crate::Conn
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub remote_addr: SocketAddr,
}

impl UpgradeRequest {
    /// Returns the first header with this name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        get_header(&self.headers, name)
    }
}

/// Validates an upgrade request head and extracts its metadata.
///
/// [`Error::Upgrade`] maps to a 426 response, anything else to a 400.
pub(crate) fn parse_request(
    head: &Head,
    remote_addr: SocketAddr,
) -> Result<(UpgradeRequest, Meta), Error> {
    check_upgrade(&head.headers, true)?;

    let mut parts = head.line.split_whitespace();
    let (method, path, proto) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v), None) => (m, p, v),
        _ => return Err(Error::Protocol(format!("bad request line [{}]", head.line))),
    };
    if !proto.eq_ignore_ascii_case("HTTP/1.1") {
        return Err(Error::Upgrade(format!("bad http version for upgrade {proto}")));
    }
    let is_dialer = method == "DIAL";
    if !is_dialer && method != "ACCEPT" {
        return Err(Error::Protocol(format!("bad http method {method}")));
    }

    let token = get_header(&head.headers, H_TOKEN).unwrap_or("");
    if token.is_empty() {
        return Err(Error::Protocol("missing token".into()));
    }
    let raw_addrs = get_header(&head.headers, H_SELF_ADDRS).unwrap_or("");
    let self_addrs = parse_addrs(raw_addrs)
        .map_err(|_| Error::Protocol(format!("invalid self addrs {raw_addrs}")))?;
    if self_addrs.len() > MAX_ADDRS - 1 {
        return Err(Error::Protocol(format!("too many self addrs {raw_addrs}")));
    }

    let mut meta = Meta::new(is_dialer, "", token);
    meta.self_addrs = self_addrs;
    let req = UpgradeRequest {
        method: method.to_owned(),
        path: path.to_owned(),
        headers: head.headers.clone(),
        remote_addr,
    };
    Ok((req, meta))
}

/// Writes the upgrade request for this attempt. Required headers come first,
/// so they shadow any caller-supplied duplicates.
pub(crate) async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    meta: &Meta,
    extra_headers: &[(&str, &str)],
    url: &Url,
) -> io::Result<()> {
    let method = match meta.is_dialer {
        true => "DIAL",
        false => "ACCEPT",
    };
    let mut target = url.path().to_owned();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    let host = url.host_str().unwrap_or("");

    let mut head = format!("{method} {target} HTTP/1.1\r\n");
    match url.port() {
        Some(port) => head.push_str(&format!("Host: {host}:{port}\r\n")),
        None => head.push_str(&format!("Host: {host}\r\n")),
    }
    head.push_str("Connection: upgrade\r\n");
    head.push_str(&format!("Upgrade: {PROTOCOL_NAME}\r\n"));
    head.push_str(&format!("{H_TOKEN}: {}\r\n", meta.token));
    head.push_str(&format!("{H_SELF_ADDRS}: {}\r\n", format_addrs(&meta.self_addrs)));
    for (name, value) in extra_headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    w.write_all(head.as_bytes()).await?;
    w.flush().await
}

/// An HTTP response from the rendezvous server. Returned inside
/// [`Error::Handshake`] when an attempt fails before the upgrade, with up to
/// 1 KiB of the body slurped for diagnosis. The underlying stream is closed;
/// the body is not readable past what's here.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    /// Returns the first header with this name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        get_header(&self.headers, name)
    }
}

pub(crate) fn parse_response_head(head: &Head) -> Result<Response, Error> {
    let bad = || Error::Handshake {
        reason: format!("bad http response line [{}]", head.line),
        response: None,
    };
    let rest = head.line.strip_prefix("HTTP/1.1 ").ok_or_else(bad)?;
    let (code, reason) = match rest.split_once(' ') {
        Some((code, reason)) => (code, reason),
        None => (rest, ""),
    };
    let status: u16 = code.parse().map_err(|_| bad())?;
    Ok(Response {
        status,
        reason: reason.to_owned(),
        headers: head.headers.clone(),
        body: Vec::new(),
    })
}

/// Validates a `101 Switching Protocols` response and absorbs the peer and
/// observed addresses into the attempt's metadata. Returns the failure reason
/// on a bad handshake; the caller attaches the response itself.
pub(crate) fn apply_response(meta: &mut Meta, resp: &Response) -> Result<(), String> {
    if resp.status != 101 {
        return Err(format!("unexpected http status {} {}", resp.status, resp.reason));
    }
    check_upgrade(&resp.headers, true).map_err(|err| err.to_string())?;

    let raw = resp.header(H_PEER_ADDRS).unwrap_or("");
    meta.peer_addrs = parse_addrs(raw).map_err(|_| format!("invalid peer addrs {raw}"))?;
    if meta.peer_addrs.len() > MAX_ADDRS {
        return Err(format!("too many peer addrs {raw}"));
    }
    if let Some(raw) = resp.header(H_OBSERVED_ADDR).filter(|v| !v.is_empty()) {
        let observed = raw.parse().map_err(|_| format!("invalid observed addr {raw}"))?;
        meta.observed_addr = Some(observed);
    }
    Ok(())
}

/// Writes the deferred `101 Switching Protocols` response carrying the
/// matched partner's candidate addresses.
pub(crate) async fn write_response<W: AsyncWrite + Unpin>(w: &mut W, meta: &Meta) -> io::Result<()> {
    let mut head = format!("HTTP/1.1 101 {}\r\n", status_reason(101));
    head.push_str("Connection: upgrade\r\n");
    head.push_str(&format!("Upgrade: {PROTOCOL_NAME}\r\n"));
    head.push_str(&format!("{H_PEER_ADDRS}: {}\r\n", format_addrs(&meta.peer_addrs)));
    if let Some(observed) = meta.observed_addr {
        head.push_str(&format!("{H_OBSERVED_ADDR}: {observed}\r\n"));
    }
    head.push_str("\r\n");
    w.write_all(head.as_bytes()).await?;
    w.flush().await
}

/// Writes a terminal plain-text response and shuts the stream down, all under
/// a short deadline so a stuck peer can't hold the server up.
pub(crate) async fn write_response_err<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: u16,
    reason: &str,
) -> io::Result<()> {
    let body = format!("{reason}\n");
    let mut head = format!("HTTP/1.1 {status} {}\r\n", status_reason(status));
    head.push_str("Connection: upgrade\r\n");
    head.push_str(&format!("Upgrade: {PROTOCOL_NAME}\r\n"));
    head.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    head.push_str("X-Content-Type-Options: nosniff\r\n");
    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    head.push_str("\r\n");
    head.push_str(&body);

    let write = async {
        w.write_all(head.as_bytes()).await?;
        w.shutdown().await
    };
    match timeout(VERY_SOON, write).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut)),
    }
}

fn status_reason(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        400 => "Bad Request",
        408 => "Request Timeout",
        409 => "Conflict",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// Reads up to 1 KiB of an error response body, bounded by `Content-Length`
/// when present. Read failures just end the slurp; the body is best-effort.
pub(crate) async fn slurp<R: AsyncRead + Unpin>(
    r: &mut R,
    leftover: &[u8],
    headers: &[(String, String)],
) -> Vec<u8> {
    let want = get_header(headers, "Content-Length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(SLURP_LIMIT)
        .min(SLURP_LIMIT);

    let mut body = leftover[..leftover.len().min(want)].to_vec();
    let mut chunk = [0u8; 256];
    while body.len() < want {
        match timeout(SLURP_TIMEOUT, r.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => {
                let take = n.min(want - body.len());
                body.extend_from_slice(&chunk[..take]);
            }
            _ => break,
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "22.22.22.22:12345".parse().unwrap()
    }

    async fn head_of(raw: &str) -> Head {
        let mut reader = raw.as_bytes();
        read_head(&mut reader).await.unwrap()
    }

    #[tokio::test]
    async fn test_read_head_leftover() {
        let head = head_of("DIAL / HTTP/1.1\r\nHost: x\r\n\r\nrdv/1 HELLO t\r\n").await;
        assert_eq!(head.line, "DIAL / HTTP/1.1");
        assert_eq!(head.headers, vec![("Host".to_owned(), "x".to_owned())]);
        assert_eq!(head.leftover, b"rdv/1 HELLO t\r\n");

        // A head with no header fields at all still parses.
        let head = head_of("ACCEPT / HTTP/1.1\r\n\r\n").await;
        assert_eq!(head.line, "ACCEPT / HTTP/1.1");
        assert!(head.headers.is_empty());
        assert!(head.leftover.is_empty());
    }

    #[tokio::test]
    async fn test_parse_request() {
        let head = head_of(
            "DIAL /hello HTTP/1.1\r\n\
             Connection: Upgrade\r\n\
             Upgrade: rdv/1\r\n\
             Rdv-Token: abc\r\n\
             Rdv-Self-Addrs: 192.168.1.16:38289, 172.17.0.1:38289\r\n\r\n",
        )
        .await;
        let (req, meta) = parse_request(&head, remote()).unwrap();
        assert_eq!(req.method, "DIAL");
        assert_eq!(req.path, "/hello");
        assert_eq!(req.remote_addr, remote());
        assert!(meta.is_dialer);
        assert_eq!(meta.token, "abc");
        assert_eq!(meta.self_addrs.len(), 2);
    }

    #[tokio::test]
    async fn test_parse_request_errors() {
        let no_upgrade = head_of("DIAL / HTTP/1.1\r\nRdv-Token: abc\r\n\r\n").await;
        assert!(matches!(
            parse_request(&no_upgrade, remote()),
            Err(Error::Upgrade(_))
        ));

        let bad_method = head_of(
            "GET / HTTP/1.1\r\nConnection: upgrade\r\nUpgrade: rdv/1\r\nRdv-Token: abc\r\n\r\n",
        )
        .await;
        assert!(matches!(
            parse_request(&bad_method, remote()),
            Err(Error::Protocol(_))
        ));

        let no_token =
            head_of("DIAL / HTTP/1.1\r\nConnection: upgrade\r\nUpgrade: rdv/1\r\n\r\n").await;
        assert!(matches!(
            parse_request(&no_token, remote()),
            Err(Error::Protocol(_))
        ));

        let bad_version = head_of(
            "DIAL / HTTP/1.0\r\nConnection: upgrade\r\nUpgrade: rdv/1\r\nRdv-Token: abc\r\n\r\n",
        )
        .await;
        assert!(matches!(
            parse_request(&bad_version, remote()),
            Err(Error::Upgrade(_))
        ));

        let too_many = (0..10)
            .map(|i| format!("10.0.0.{i}:2000"))
            .collect::<Vec<_>>()
            .join(", ");
        let head = head_of(&format!(
            "DIAL / HTTP/1.1\r\nConnection: upgrade\r\nUpgrade: rdv/1\r\nRdv-Token: abc\r\n\
             Rdv-Self-Addrs: {too_many}\r\n\r\n"
        ))
        .await;
        assert!(matches!(parse_request(&head, remote()), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let mut meta = Meta::new(false, "http://example.com:8080/room", "tok");
        meta.self_addrs = vec!["192.168.0.2:40000".parse().unwrap()];
        let url = Url::parse(&meta.server_addr).unwrap();

        let mut raw = Vec::new();
        write_request(&mut raw, &meta, &[("X-App", "demo")], &url)
            .await
            .unwrap();
        let mut reader = raw.as_slice();
        let head = read_head(&mut reader).await.unwrap();
        let (req, parsed) = parse_request(&head, remote()).unwrap();

        assert_eq!(req.method, "ACCEPT");
        assert_eq!(req.path, "/room");
        assert_eq!(req.header("host"), Some("example.com:8080"));
        assert_eq!(req.header("x-app"), Some("demo"));
        assert!(!parsed.is_dialer);
        assert_eq!(parsed.token, "tok");
        assert_eq!(parsed.self_addrs, meta.self_addrs);
    }

    #[tokio::test]
    async fn test_response_round_trip() {
        let mut meta = Meta::new(true, "http://example.com/", "tok");
        meta.peer_addrs = vec!["192.168.0.2:40000".parse().unwrap()];
        meta.observed_addr = Some("22.22.22.22:12345".parse().unwrap());

        let mut raw = Vec::new();
        write_response(&mut raw, &meta).await.unwrap();
        let mut reader = raw.as_slice();
        let head = read_head(&mut reader).await.unwrap();
        let resp = parse_response_head(&head).unwrap();
        assert_eq!(resp.status, 101);

        let mut got = Meta::new(true, "http://example.com/", "tok");
        apply_response(&mut got, &resp).unwrap();
        assert_eq!(got.peer_addrs, meta.peer_addrs);
        assert_eq!(got.observed_addr, meta.observed_addr);
    }

    #[tokio::test]
    async fn test_response_err_and_slurp() {
        let mut raw = Vec::new();
        write_response_err(&mut raw, 409, "replaced by another conn")
            .await
            .unwrap();
        let mut reader = raw.as_slice();
        let head = read_head(&mut reader).await.unwrap();
        let mut resp = parse_response_head(&head).unwrap();
        assert_eq!(resp.status, 409);
        assert_eq!(resp.reason, "Conflict");

        let mut meta = Meta::new(true, "http://example.com/", "tok");
        assert!(apply_response(&mut meta, &resp).is_err());

        resp.body = slurp(&mut reader, &head.leftover, &resp.headers).await;
        assert_eq!(resp.body, b"replaced by another conn\n");
    }

    #[tokio::test]
    async fn test_slurp_limit() {
        let big = vec![b'x'; 4096];
        let mut reader = big.as_slice();
        let headers = vec![("Content-Length".to_owned(), "4096".to_owned())];
        let body = slurp(&mut reader, &[], &headers).await;
        assert_eq!(body.len(), 1024);
    }
}
