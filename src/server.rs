use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::TcpListener,
    sync::mpsc,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    addr::good_observed,
    conn::{BoxStream, Conn},
    error::{AddrError, Error},
    http::{self, UpgradeRequest},
    relay::Relayer,
};

/// A boxed pair-handler future.
pub type ServeFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handler for a matched pair. The token is cancelled along with the server;
/// the handler owns both conns and is responsible for closing them.
pub type ServeFn = Arc<dyn Fn(CancellationToken, Conn, Conn) -> ServeFuture + Send + Sync>;

/// Determines the observed addr:port of a client from its upgrade request.
pub type ObservedAddrFn =
    Arc<dyn Fn(&UpgradeRequest) -> Result<SocketAddr, AddrError> + Send + Sync>;

const DEFAULT_LOBBY_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(20);

pub struct ServerConfig {
    /// Amount of time one peer can wait in the lobby for its partner.
    /// Zero means no timeout.
    pub lobby_timeout: Duration,

    /// Amount of inactivity before relay conns are dropped. Zero means no
    /// timeout. Only used by the default pair handler; a custom `serve_fn`
    /// configures its own [`Relayer`].
    pub relay_timeout: Duration,

    /// Handler for matched pairs. Defaults to running a [`Relayer`].
    pub serve_fn: Option<ServeFn>,

    /// Determines the observed addr of a client, which is added to the
    /// candidate addrs sent to the other peer. Defaults to the transport
    /// remote address. Behind a load balancer or reverse proxy, extract the
    /// address from forwarding headers instead. Returning an error omits the
    /// observed addr for that peer.
    pub observed_addr_fn: Option<ObservedAddrFn>,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            lobby_timeout: DEFAULT_LOBBY_TIMEOUT,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
            serve_fn: None,
            observed_addr_fn: None,
        }
    }
}

/// The default observed-address extractor: the transport remote address,
/// required to be a usable public IPv4.
pub fn default_observed_addr(req: &UpgradeRequest) -> Result<SocketAddr, AddrError> {
    good_observed(req.remote_addr)?;
    Ok(req.remote_addr)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorOutcome {
    /// The deadline passed in silence: the peer timed out waiting for a partner.
    Timeout,
    /// The event loop cancelled the monitor to claim the conn.
    Claimed,
    /// The peer spoke or hung up before the response. Answered with a 400.
    Violation,
}

struct MonitorEvent {
    token: String,
    conn: Conn,
    outcome: MonitorOutcome,
}

/// A rendezvous server: pairs up clients by token and relays their bytes.
///
/// [`Server::handle`] upgrades inbound streams ([`Server::listen`] is the TCP
/// convenience wrapper), and [`Server::serve`] runs the matchmaking loop,
/// which must be running for any client to make progress.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: ServerConfig,
    conn_tx: mpsc::Sender<Conn>,
    conn_rx: Mutex<Option<mpsc::Receiver<Conn>>>,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Server {
        let (conn_tx, conn_rx) = mpsc::channel(8);
        Server {
            inner: Arc::new(Inner {
                cfg,
                conn_tx,
                conn_rx: Mutex::new(Some(conn_rx)),
            }),
        }
    }

    /// Upgrades one inbound byte stream and hands it to the matchmaker.
    /// Malformed requests are answered here (426 or 400); `remote_addr` is
    /// the transport source used for the default observed address.
    ///
    /// The response to a well-formed request is deferred until the peer is
    /// matched, times out, or misbehaves.
    pub async fn handle<IO>(&self, io: IO, remote_addr: SocketAddr) -> Result<(), Error>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut io: BoxStream = Box::new(io);
        if self.inner.conn_tx.is_closed() {
            let _ = http::write_response_err(&mut io, 503, "rdv is closed").await;
            return Err(Error::ServerClosed);
        }
        let head = http::read_head(&mut io).await?;
        let (req, mut meta) = match http::parse_request(&head, remote_addr) {
            Ok(parsed) => parsed,
            Err(err) => {
                let status = match err {
                    Error::Upgrade(_) => 426,
                    _ => 400,
                };
                let _ = http::write_response_err(&mut io, status, &err.to_string()).await;
                return Err(err);
            }
        };
        if !head.leftover.is_empty() {
            let err = Error::Protocol("received client data before response header".into());
            let _ = http::write_response_err(&mut io, 400, &err.to_string()).await;
            return Err(err);
        }

        let observed = match &self.inner.cfg.observed_addr_fn {
            Some(observed_fn) => observed_fn(&req),
            None => default_observed_addr(&req),
        };
        match observed {
            Ok(addr) => meta.observed_addr = Some(addr),
            Err(err) => debug!(addr = %req.remote_addr, %err, "ignore observed addr"),
        }

        let conn = Conn::relay(io, Vec::new(), meta, Some(req), None, Some(remote_addr));
        if let Err(failed) = self.inner.conn_tx.send(conn).await {
            let mut conn = failed.0;
            let _ = http::write_response_err(&mut conn, 503, "rdv is closed").await;
            return Err(Error::ServerClosed);
        }
        Ok(())
    }

    /// Accepts TCP connections and feeds them through [`Server::handle`]
    /// until cancelled.
    pub async fn listen(&self, cancel: CancellationToken, listener: TcpListener) -> io::Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = listener.accept() => result,
            };
            let (stream, remote_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(%err, "accept failed");
                    continue;
                }
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.handle(stream, remote_addr).await {
                    debug!(addr = %remote_addr, %err, "inbound conn rejected");
                }
            });
        }
    }

    /// Runs the matchmaking loop until cancelled. The lobby is owned by this
    /// task alone; monitors and pair handlers communicate through channels.
    ///
    /// On cancellation, inbound conns are refused, every still-parked peer is
    /// answered with a 503, and the loop returns once the lobby is empty and
    /// all pair handlers have finished.
    ///
    /// # Panics
    ///
    /// Panics when called a second time on the same server.
    pub async fn serve(&self, cancel: CancellationToken) {
        let mut conn_rx = self
            .inner
            .conn_rx
            .lock()
            .unwrap()
            .take()
            .expect("serve may only be called once");
        let (mon_tx, mut mon_rx) = mpsc::channel::<MonitorEvent>(8);
        let mut lobby: HashMap<String, CancellationToken> = HashMap::new();
        let mut handlers: JoinSet<()> = JoinSet::new();
        let mut draining = false;
        let mut inbound_open = true;

        while inbound_open || !lobby.is_empty() {
            tokio::select! {
                _ = cancel.cancelled(), if !draining => {
                    draining = true;
                    // refuse new conns; already-queued ones still drain below
                    conn_rx.close();
                }
                Some(event) = mon_rx.recv() => self.kick_out(&mut lobby, &mut handlers, event),
                maybe = conn_rx.recv(), if inbound_open => match maybe {
                    Some(conn) => {
                        self.on_conn(&mut lobby, &mut mon_rx, &mon_tx, &mut handlers, &cancel, conn)
                            .await
                    }
                    None => {
                        inbound_open = false;
                        info!(parked = lobby.len(), "rdv server shutting down");
                        for entry in lobby.values() {
                            entry.cancel();
                        }
                    }
                },
            }
        }

        while handlers.join_next().await.is_some() {}
    }

    /// A new upgraded conn arrived at the matchmaker.
    async fn on_conn(
        &self,
        lobby: &mut HashMap<String, CancellationToken>,
        mon_rx: &mut mpsc::Receiver<MonitorEvent>,
        mon_tx: &mpsc::Sender<MonitorEvent>,
        handlers: &mut JoinSet<()>,
        cancel: &CancellationToken,
        conn: Conn,
    ) {
        let token = conn.meta().token.clone();

        // If an entry holds this token, cancel its monitor and drain
        // notifications until that entry's arrives, kicking out any unrelated
        // timeouts encountered on the way. Afterwards the entry is out of the
        // lobby and no longer monitored.
        let claimed = match lobby.get(&token).cloned() {
            None => None,
            Some(entry) => {
                entry.cancel();
                loop {
                    let event = mon_rx.recv().await.expect("monitor channel closed");
                    if event.token == token {
                        lobby.remove(&token);
                        break Some(event.conn);
                    }
                    self.kick_out(lobby, handlers, event);
                }
            }
        };

        match claimed {
            Some(idle_conn) if idle_conn.meta().is_dialer != conn.meta().is_dialer => {
                let (dc, ac) = match conn.meta().is_dialer {
                    true => (conn, idle_conn),
                    false => (idle_conn, conn),
                };
                info!(token = %dc.meta().token, "matched");
                let serve_fn = self.serve_fn();
                handlers.spawn(serve_fn(cancel.child_token(), dc, ac));
            }
            displaced => {
                // No conn with this token, or one with the same role: park
                // the newcomer and kick any same-role predecessor out.
                let summary = conn.meta().server_summary();
                self.add_idle(lobby, mon_tx, conn);
                match displaced {
                    None => info!(conn = %summary, "joined"),
                    Some(old) => {
                        info!(conn = %old.meta().server_summary(), "replaced");
                        handlers.spawn(respond_err(old, 409, "replaced by another conn"));
                    }
                }
            }
        }
    }

    /// Parks a conn in the lobby with a monitor enforcing its silence.
    fn add_idle(
        &self,
        lobby: &mut HashMap<String, CancellationToken>,
        mon_tx: &mpsc::Sender<MonitorEvent>,
        conn: Conn,
    ) {
        let token = conn.meta().token.clone();
        let entry = CancellationToken::new();
        lobby.insert(token.clone(), entry.clone());
        tokio::spawn(monitor(
            conn,
            token,
            self.inner.cfg.lobby_timeout,
            entry,
            mon_tx.clone(),
        ));
    }

    /// Removes a monitored conn from the lobby and answers it.
    fn kick_out(
        &self,
        lobby: &mut HashMap<String, CancellationToken>,
        handlers: &mut JoinSet<()>,
        event: MonitorEvent,
    ) {
        lobby.remove(&event.token);
        let summary = event.conn.meta().server_summary();
        match event.outcome {
            MonitorOutcome::Timeout => {
                info!(conn = %summary, "left: no matching peer");
                handlers.spawn(respond_err(event.conn, 408, "no matching peer found"));
            }
            MonitorOutcome::Violation => {
                // already answered with a 400 by the monitor
                info!(conn = %summary, "left: protocol violation");
            }
            MonitorOutcome::Claimed => {
                // claims are consumed inline by on_conn, so an unclaimed
                // cancellation only happens during shutdown
                handlers.spawn(respond_err(
                    event.conn,
                    503,
                    "rdv server shutting down, try again",
                ));
            }
        }
    }

    fn serve_fn(&self) -> ServeFn {
        match &self.inner.cfg.serve_fn {
            Some(serve_fn) => serve_fn.clone(),
            None => {
                let idle_timeout = self.inner.cfg.relay_timeout;
                Arc::new(move |cancel, dc, ac| -> ServeFuture {
                    Box::pin(async move {
                        let token = dc.meta().token.clone();
                        let relayer = Relayer {
                            idle_timeout,
                            ..Default::default()
                        };
                        let (dn, an, err) = relayer.run(cancel, dc, ac).await;
                        debug!(%token, dial_bytes = dn, accept_bytes = an, err = ?err, "relay finished");
                    })
                })
            }
        }
    }
}

/// Watches a parked conn. The contract is silence: the peer must not send a
/// single byte, nor hang up, until the server responds. There are exactly
/// three ways out: the lobby deadline passes quietly, the event loop claims
/// the conn, or the peer breaks the contract and is ejected with a 400. In
/// every case the conn travels back to the event loop.
async fn monitor(
    mut conn: Conn,
    token: String,
    lobby_timeout: Duration,
    claimed: CancellationToken,
    mon_tx: mpsc::Sender<MonitorEvent>,
) {
    let mut byte = [0u8; 1];
    let outcome = tokio::select! {
        _ = claimed.cancelled() => MonitorOutcome::Claimed,
        _ = lobby_deadline(lobby_timeout) => MonitorOutcome::Timeout,
        _ = conn.read(&mut byte) => MonitorOutcome::Violation,
    };
    if outcome == MonitorOutcome::Violation {
        let _ = http::write_response_err(
            &mut conn,
            400,
            "conn must idle while waiting for response header",
        )
        .await;
    }
    let _ = mon_tx.send(MonitorEvent { token, conn, outcome }).await;
}

async fn lobby_deadline(timeout: Duration) {
    match timeout.is_zero() {
        true => std::future::pending().await,
        false => tokio::time::sleep(timeout).await,
    }
}

async fn respond_err(mut conn: Conn, status: u16, reason: &'static str) {
    let _ = http::write_response_err(&mut conn, status, reason).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    use super::*;
    use crate::conn::Meta;
    use crate::http::{parse_response_head, read_head, Response};

    fn request(method: &str, token: &str, port: u16) -> String {
        format!(
            "{method} / HTTP/1.1\r\nConnection: upgrade\r\nUpgrade: rdv/1\r\n\
             Rdv-Token: {token}\r\nRdv-Self-Addrs: 192.168.1.16:{port}\r\n\r\n"
        )
    }

    /// Spawns a handler for one in-memory client and writes its request.
    async fn connect(server: &Server, raw: &str) -> DuplexStream {
        let (mut client, server_io) = duplex(64 * 1024);
        let server = server.clone();
        let remote: SocketAddr = "22.22.22.22:12345".parse().unwrap();
        tokio::spawn(async move {
            let _ = server.handle(server_io, remote).await;
        });
        client.write_all(raw.as_bytes()).await.unwrap();
        client
    }

    async fn response_of(client: &mut DuplexStream) -> Response {
        let head = read_head(client).await.unwrap();
        parse_response_head(&head).unwrap()
    }

    /// A serve_fn that reports matched pairs instead of relaying.
    fn capture_pairs(cfg: &mut ServerConfig) -> mpsc::UnboundedReceiver<(Meta, Meta)> {
        let (tx, rx) = mpsc::unbounded_channel();
        cfg.serve_fn = Some(Arc::new(move |_cancel, dc, ac| -> ServeFuture {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send((dc.meta().clone(), ac.meta().clone()));
            })
        }));
        rx
    }

    fn spawn_serve(server: &Server) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let handle = {
            let server = server.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { server.serve(cancel).await })
        };
        (cancel, handle)
    }

    #[tokio::test]
    async fn test_match_dispatches_ordered_pair() {
        let mut cfg = ServerConfig::default();
        let mut pairs = capture_pairs(&mut cfg);
        let server = Server::new(cfg);
        let (cancel, serve) = spawn_serve(&server);

        let _acceptor = connect(&server, &request("ACCEPT", "T1", 2001)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _dialer = connect(&server, &request("DIAL", "T1", 2002)).await;

        let (dc, ac) = pairs.recv().await.unwrap();
        assert!(dc.is_dialer);
        assert!(!ac.is_dialer);
        assert_eq!(dc.token, "T1");
        // each side's observed addr was recorded before the match
        assert_eq!(dc.observed_addr, Some("22.22.22.22:12345".parse().unwrap()));

        cancel.cancel();
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_role_collision_replaces_older_dialer() {
        let mut cfg = ServerConfig::default();
        let mut pairs = capture_pairs(&mut cfg);
        let server = Server::new(cfg);
        let (cancel, serve) = spawn_serve(&server);

        let mut first = connect(&server, &request("DIAL", "T2", 2001)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _second = connect(&server, &request("DIAL", "T2", 2002)).await;

        // the displaced dialer gets a 409; the newcomer stays parked
        let resp = response_of(&mut first).await;
        assert_eq!(resp.status, 409);

        let _acceptor = connect(&server, &request("ACCEPT", "T2", 3001)).await;
        let (dc, _ac) = pairs.recv().await.unwrap();
        assert_eq!(dc.self_addrs, vec!["192.168.1.16:2002".parse().unwrap()]);

        cancel.cancel();
        serve.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lobby_timeout() {
        let server = Server::new(ServerConfig {
            lobby_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        let (cancel, serve) = spawn_serve(&server);

        let mut client = connect(&server, &request("DIAL", "T3", 2001)).await;
        let resp = response_of(&mut client).await;
        assert_eq!(resp.status, 408);

        cancel.cancel();
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_data_before_response_is_rejected() {
        let server = Server::new(ServerConfig::default());
        let (cancel, serve) = spawn_serve(&server);

        // one byte rides along with the request head
        let eager = format!("{}x", request("DIAL", "T4", 2001));
        let mut client = connect(&server, &eager).await;
        let resp = response_of(&mut client).await;
        assert_eq!(resp.status, 400);

        // one byte arrives while parked in the lobby
        let mut client = connect(&server, &request("DIAL", "T4", 2001)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.write_all(b"x").await.unwrap();
        let resp = response_of(&mut client).await;
        assert_eq!(resp.status, 400);

        cancel.cancel();
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let server = Server::new(ServerConfig::default());
        let (cancel, serve) = spawn_serve(&server);

        let mut client = connect(&server, "DIAL / HTTP/1.1\r\nRdv-Token: a\r\n\r\n").await;
        assert_eq!(response_of(&mut client).await.status, 426);

        let mut client = connect(
            &server,
            "GET / HTTP/1.1\r\nConnection: upgrade\r\nUpgrade: rdv/1\r\nRdv-Token: a\r\n\r\n",
        )
        .await;
        assert_eq!(response_of(&mut client).await.status, 400);

        cancel.cancel();
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_observed_addr_override() {
        // a reverse-proxy deployment reads forwarding headers instead of the
        // transport address
        let mut cfg = ServerConfig {
            observed_addr_fn: Some(Arc::new(|req: &UpgradeRequest| {
                let ip = req.header("X-Forwarded-For").ok_or(AddrError::InvalidAddr)?;
                let port = req.header("X-Forwarded-Port").ok_or(AddrError::InvalidAddr)?;
                format!("{ip}:{port}")
                    .parse()
                    .map_err(|_| AddrError::InvalidAddr)
            })),
            ..Default::default()
        };
        let mut pairs = capture_pairs(&mut cfg);
        let server = Server::new(cfg);
        let (cancel, serve) = spawn_serve(&server);

        let forwarded = "ACCEPT / HTTP/1.1\r\nConnection: upgrade\r\nUpgrade: rdv/1\r\n\
             Rdv-Token: T6\r\nX-Forwarded-For: 44.44.44.44\r\nX-Forwarded-Port: 40000\r\n\r\n";
        let _acceptor = connect(&server, forwarded).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _dialer = connect(&server, &request("DIAL", "T6", 2001)).await;

        let (_dc, ac) = pairs.recv().await.unwrap();
        assert_eq!(ac.observed_addr, Some("44.44.44.44:40000".parse().unwrap()));

        cancel.cancel();
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_answers_parked_conns() {
        let server = Server::new(ServerConfig::default());
        let (cancel, serve) = spawn_serve(&server);

        let mut parked = connect(&server, &request("DIAL", "T5", 2001)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        let resp = response_of(&mut parked).await;
        assert_eq!(resp.status, 503);
        serve.await.unwrap();

        // the server refuses conns after shutdown
        let mut late = connect(&server, &request("DIAL", "T5", 2001)).await;
        let resp = response_of(&mut late).await;
        assert_eq!(resp.status, 503);
    }
}
