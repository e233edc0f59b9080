use std::{
    fmt,
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::{
    addr::format_addrs,
    error::Error,
    http::{UpgradeRequest, PROTOCOL_NAME},
};

/// Any byte stream a [`Conn`] can wrap: a plain TCP stream, a TLS-wrapped
/// one, or an in-memory pipe in tests.
pub(crate) trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub(crate) type BoxStream = Box<dyn Stream>;

/// Metadata for one connection attempt. Created when the attempt starts,
/// filled in until the HTTP handshake completes, and plain read-only data
/// from then on; every candidate conn of the attempt carries its own copy.
#[derive(Debug, Clone)]
pub struct Meta {
    /// The rendezvous server URL.
    pub server_addr: String,

    pub is_dialer: bool,

    /// The token shared out-of-band between the two peers.
    pub token: String,

    /// This peer's source ip:port as observed by the server.
    pub observed_addr: Option<SocketAddr>,

    /// Candidate addresses this peer advertises.
    pub self_addrs: Vec<SocketAddr>,

    /// Candidate addresses of the peer: its self-reported addrs plus its
    /// observed addr.
    pub peer_addrs: Vec<SocketAddr>,
}

impl Meta {
    pub(crate) fn new(is_dialer: bool, server_addr: &str, token: &str) -> Meta {
        Meta {
            server_addr: server_addr.to_owned(),
            is_dialer,
            token: token.to_owned(),
            observed_addr: None,
            self_addrs: Vec::new(),
            peer_addrs: Vec::new(),
        }
    }

    fn method(&self) -> &'static str {
        match self.is_dialer {
            true => "dial",
            false => "accept",
        }
    }

    /// e.g. `accept abc 192.168.1.16:38289, 172.17.0.1:38289 (22.22.22.22:12345) -> 10.0.0.7:38289`
    pub(crate) fn client_summary(&self) -> String {
        format!(
            "{} {} {} ({}) -> {}",
            self.method(),
            self.token,
            format_addrs(&self.self_addrs),
            self.observed_addr.map_or_else(|| "?".to_owned(), |a| a.to_string()),
            format_addrs(&self.peer_addrs),
        )
    }

    /// e.g. `accept abc 22.22.22.22:12345`
    pub(crate) fn server_summary(&self) -> String {
        format!(
            "{} {} {}",
            self.method(),
            self.token,
            self.observed_addr.map_or_else(|| "?".to_owned(), |a| a.to_string()),
        )
    }

    /// Fills the peer candidate list from the matched partner: its
    /// self-reported addrs, then its observed addr.
    pub(crate) fn set_peer_addrs_from(&mut self, peer: &Meta) {
        self.peer_addrs = peer.self_addrs.clone();
        if let Some(observed) = peer.observed_addr {
            self.peer_addrs.push(observed);
        }
    }

    /// The rdv lines for this attempt: the one this peer writes and the one
    /// it expects, in that order. Dialers confirm, acceptors hello.
    pub(crate) fn wire_lines(&self) -> (String, String) {
        let hello = rdv_line("HELLO", &self.token);
        let confirm = rdv_line("CONFIRM", &self.token);
        match self.is_dialer {
            true => (confirm, hello),
            false => (hello, confirm),
        }
    }
}

/// Returns an rdv wire line, e.g. `rdv/1 HELLO token` + CRLF.
pub(crate) fn rdv_line(verb: &str, token: &str) -> String {
    format!("{PROTOCOL_NAME} {verb} {token}\r\n")
}

/// A bearer byte stream between two matched peers, either direct (p2p) or
/// relayed through the rendezvous server. Both kinds present the same
/// protocol, so callers can treat them uniformly.
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]. Relay bearers may hold early
/// peer bytes that arrived together with the HTTP head; those are drained
/// before the underlying stream.
pub struct Conn {
    io: BoxStream,
    buffered: Vec<u8>,
    pos: usize,
    is_relay: bool,
    meta: Meta,
    req: Option<UpgradeRequest>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl Conn {
    /// A direct candidate conn, dialed or accepted on the attempt's socket.
    pub(crate) fn direct(stream: tokio::net::TcpStream, meta: Meta) -> Conn {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        Conn {
            io: Box::new(stream),
            buffered: Vec::new(),
            pos: 0,
            is_relay: false,
            meta,
            req: None,
            local_addr,
            peer_addr,
        }
    }

    /// A relay bearer over an upgraded stream, with any bytes already read
    /// past the HTTP head.
    pub(crate) fn relay(
        io: BoxStream,
        buffered: Vec<u8>,
        meta: Meta,
        req: Option<UpgradeRequest>,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Conn {
        Conn {
            io,
            buffered,
            pos: 0,
            is_relay: true,
            meta,
            req,
            local_addr,
            peer_addr,
        }
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Whether this bearer runs through the rendezvous server rather than
    /// directly to the peer.
    pub fn is_relay(&self) -> bool {
        self.is_relay
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The upgrade request this conn arrived with. Server side only.
    pub fn request(&self) -> Option<&UpgradeRequest> {
        self.req.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn set_is_relay(&mut self, is_relay: bool) {
        self.is_relay = is_relay;
    }

    /// Reads the exact line and fails on anything else.
    pub(crate) async fn expect_line(&mut self, line: &str) -> Result<(), Error> {
        let mut actual = vec![0u8; line.len()];
        self.read_exact(&mut actual).await?;
        if actual != line.as_bytes() {
            return Err(Error::Protocol("invalid peer handshake".into()));
        }
        Ok(())
    }

    /// Establishes a candidate connection. Dialers simply read the hello,
    /// whereas acceptors write the hello and read the confirm. Invoked once
    /// per candidate, but succeeds at most once for acceptors.
    pub(crate) async fn client_hand(&mut self) -> Result<(), Error> {
        let (own, peer) = self.meta.wire_lines();
        if !self.meta.is_dialer {
            self.write_all(own.as_bytes()).await?;
        }
        self.expect_line(&peer).await
    }

    /// Finalizes candidate selection. Dialers write the confirm; acceptors
    /// already read it during [`Conn::client_hand`] and do nothing. Invoked
    /// at most once, on the winning candidate only.
    pub(crate) async fn client_shake(&mut self) -> Result<(), Error> {
        if self.meta.is_dialer {
            let (own, _) = self.meta.wire_lines();
            self.write_all(own.as_bytes()).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("is_relay", &self.is_relay)
            .field("token", &self.meta.token)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.buffered.len() {
            let n = buf.remaining().min(this.buffered.len() - this.pos);
            buf.put_slice(&this.buffered[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn meta(is_dialer: bool) -> Meta {
        Meta::new(is_dialer, "http://localhost:8080/", "abc")
    }

    fn pipe_conn(is_dialer: bool, buffered: Vec<u8>) -> (Conn, tokio::io::DuplexStream) {
        let (near, far) = duplex(64 * 1024);
        let conn = Conn::relay(Box::new(near), buffered, meta(is_dialer), None, None, None);
        (conn, far)
    }

    #[test]
    fn test_wire_lines() {
        let (own, peer) = meta(true).wire_lines();
        assert_eq!(own, "rdv/1 CONFIRM abc\r\n");
        assert_eq!(peer, "rdv/1 HELLO abc\r\n");

        let (own, peer) = meta(false).wire_lines();
        assert_eq!(own, "rdv/1 HELLO abc\r\n");
        assert_eq!(peer, "rdv/1 CONFIRM abc\r\n");
    }

    #[test]
    fn test_set_peer_addrs_from() {
        let mut peer = meta(false);
        peer.self_addrs = vec!["192.168.1.16:38289".parse().unwrap()];
        peer.observed_addr = Some("22.22.22.22:12345".parse().unwrap());

        let mut m = meta(true);
        m.set_peer_addrs_from(&peer);
        assert_eq!(
            m.peer_addrs,
            vec![
                "192.168.1.16:38289".parse().unwrap(),
                "22.22.22.22:12345".parse().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_buffered_reads_first() {
        let (mut conn, mut far) = pipe_conn(true, b"early".to_vec());
        far.write_all(b" late").await.unwrap();

        let mut buf = [0u8; 10];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early late");
    }

    #[tokio::test]
    async fn test_client_hand_dialer() {
        let (mut conn, mut far) = pipe_conn(true, Vec::new());
        far.write_all(b"rdv/1 HELLO abc\r\n").await.unwrap();
        conn.client_hand().await.unwrap();

        conn.client_shake().await.unwrap();
        let mut line = [0u8; 19];
        far.read_exact(&mut line).await.unwrap();
        assert_eq!(&line, b"rdv/1 CONFIRM abc\r\n");
    }

    #[tokio::test]
    async fn test_client_hand_acceptor() {
        let (mut conn, mut far) = pipe_conn(false, Vec::new());
        far.write_all(b"rdv/1 CONFIRM abc\r\n").await.unwrap();
        conn.client_hand().await.unwrap();

        let mut line = [0u8; 17];
        far.read_exact(&mut line).await.unwrap();
        assert_eq!(&line, b"rdv/1 HELLO abc\r\n");
    }

    #[tokio::test]
    async fn test_client_hand_mismatch() {
        let (mut conn, mut far) = pipe_conn(true, Vec::new());
        far.write_all(b"rdv/1 HELLO xyz\r\n").await.unwrap();
        match conn.client_hand().await {
            Err(Error::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }
}
