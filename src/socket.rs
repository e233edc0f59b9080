use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use socket2::{Domain, Protocol, Type};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::{conn::BoxStream, error::Error};

/// An `SO_REUSEPORT` TCP socket suitable for NAT traversal and hole punching,
/// over both ipv4 and ipv6.
///
/// All traffic of a connection attempt, inbound and outbound, shares this
/// socket's local port. That consistency is what lets the NAT mapping created
/// by the server connection carry the peer connections, and what makes TCP
/// simultaneous open possible. Usually, higher level abstractions should be
/// used.
pub struct Socket {
    /// A dual-stack (ipv4/6) TCP listener.
    listener: TcpListener,

    /// Port number for the socket, both stacks.
    port: u16,
}

impl Socket {
    /// Binds the listener. Port 0 picks an ephemeral port. Dual-stack support
    /// is required of the host; the same port serves both families.
    pub async fn bind(port: u16) -> io::Result<Socket> {
        let socket = socket2::Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_only_v6(false)?;
        set_reuse(&socket)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)).into())?;
        socket.listen(1024)?;

        let listener = TcpListener::from_std(socket.into())?;
        let laddr = listener.local_addr()?;
        debug!(laddr = %laddr, "socket bound");
        Ok(Socket {
            listener,
            port: laddr.port(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one inbound connection.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Dials `addr` with the family-appropriate dialer, binding the outbound
    /// connection to this socket's port.
    pub async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = self.dialer(addr.is_ipv6())?;
        socket.connect(addr).await
    }

    fn dialer(&self, v6: bool) -> io::Result<TcpSocket> {
        let (socket, local) = match v6 {
            false => (
                TcpSocket::new_v4()?,
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)),
            ),
            true => (
                TcpSocket::new_v6()?,
                SocketAddr::from((Ipv6Addr::UNSPECIFIED, self.port)),
            ),
        };
        socket.set_reuseaddr(true)?;
        set_reuse_port(&socket)?;
        socket.bind(local)?;
        Ok(socket)
    }

    /// Dials a rendezvous server URL over IPv4, wrapping the stream in TLS
    /// when the scheme is `https`. Returns the stream along with the TCP
    /// local and remote addresses.
    ///
    /// IPv4 is forced so the server observes an IPv4 source address for the
    /// peer candidate list, without needing STUN.
    pub(crate) async fn dial_url(
        &self,
        url: &Url,
        tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Result<(BoxStream, SocketAddr, SocketAddr), Error> {
        let https = match url.scheme() {
            "http" => false,
            "https" => true,
            scheme => return Err(Error::Url(format!("unexpected scheme [{scheme}]"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::Url("missing host".into()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::Url("missing port".into()))?;

        let mut last_err = None;
        let mut stream = None;
        for addr in lookup_host((host, port)).await?.filter(SocketAddr::is_ipv4) {
            match self.dial(addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        let stream = match stream {
            Some(s) => s,
            None => {
                return Err(last_err
                    .unwrap_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("no ipv4 address found for {host}"),
                        )
                    })
                    .into())
            }
        };
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;

        if !https {
            return Ok((Box::new(stream), local, remote));
        }
        let config = tls.ok_or_else(|| {
            Error::Url("https rendezvous server requires a tls client config".into())
        })?;
        let name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|err| Error::Url(format!("bad tls server name: {err}")))?;
        let stream = TlsConnector::from(config).connect(name, stream).await?;
        Ok((Box::new(stream), local, remote))
    }
}

fn set_reuse(socket: &socket2::Socket) -> io::Result<()> {
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    Ok(())
}

#[cfg(unix)]
fn set_reuse_port(socket: &TcpSocket) -> io::Result<()> {
    socket.set_reuseport(true)
}

#[cfg(not(unix))]
fn set_reuse_port(_socket: &TcpSocket) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_same_port_twice() {
        let socket = Socket::bind(0).await.unwrap();
        assert_ne!(socket.port(), 0);

        // Port reuse allows dialing from the listening port.
        let other = Socket::bind(0).await.unwrap();
        let dialed = socket
            .dial(SocketAddr::from(([127, 0, 0, 1], other.port())))
            .await
            .unwrap();
        let (accepted, from) = other.accept().await.unwrap();
        assert_eq!(dialed.local_addr().unwrap().port(), socket.port());
        assert_eq!(from.port(), socket.port());
        drop(accepted);
    }

    #[tokio::test]
    async fn test_dial_url_bad_scheme() {
        let socket = Socket::bind(0).await.unwrap();
        let url = Url::parse("ftp://example.com/").unwrap();
        match socket.dial_url(&url, None).await {
            Err(Error::Url(msg)) => assert!(msg.contains("ftp")),
            Err(other) => panic!("expected url error, got {other}"),
            Ok(_) => panic!("expected url error"),
        }
    }
}
