use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{sleep, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::{
    addr::{acceptable, good_self, space_of, AddrSpace},
    conn::{Conn, Meta},
    error::Error,
    http,
    ifaces,
    socket::Socket,
};

/// What a [`Chooser`] resolves to: the chosen conn, if any, and every conn it
/// passed over.
pub type ChooseFuture = Pin<Box<dyn Future<Output = (Option<Conn>, Vec<Conn>)> + Send>>;

/// Strategy for choosing among validated candidate conns. The chooser owns
/// the candidate channel: it must drain it until closed and return every conn
/// it doesn't choose, so the attempt can close them. Calling `cancel` stops
/// candidate production early.
pub type Chooser =
    Arc<dyn Fn(CancellationToken, mpsc::Receiver<Conn>) -> ChooseFuture + Send + Sync>;

/// Produces the candidate addresses the local peer advertises. Called once
/// per attempt with the attempt's socket, whose port all candidates should
/// carry.
pub type SelfAddrFn = Arc<dyn Fn(&Socket) -> Vec<SocketAddr> + Send + Sync>;

/// How long the dialer holds off on the relay by default.
const DEFAULT_RELAY_PENALTY: Duration = Duration::from_secs(1);

/// Placeholder arming delay for the penalty timer until the relay shows up.
const FAR_FUTURE: Duration = Duration::from_secs(3600);

/// Candidate channel capacity; dials, accepts and the relay all feed it.
const CHAN_SIZE: usize = 32;

pub struct ClientConfig {
    /// TLS config for `https` rendezvous servers.
    pub tls: Option<Arc<rustls::ClientConfig>>,

    /// Strategy for choosing the conn to use when dialing. Defaults to
    /// [`relay_penalty`] with a one second penalty. Acceptors always take the
    /// first validated candidate.
    pub dial_chooser: Option<Chooser>,

    /// Restricts which addresses are advertised, dialed, and accepted, e.g.
    /// [`AddrSpace::PUBLIC_SPACES`] for global peering only. Defaults to
    /// [`AddrSpace::DEFAULT_SPACES`].
    pub addr_spaces: AddrSpace,

    /// Candidate-address enumerator. Defaults to all interface addresses,
    /// which the attempt then filters by `addr_spaces`. Override if port
    /// mapping protocols are needed.
    pub self_addr_fn: Option<SelfAddrFn>,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            tls: None,
            dial_chooser: None,
            addr_spaces: AddrSpace::DEFAULT_SPACES,
            self_addr_fn: None,
        }
    }
}

/// An rdv client. One instance can run any number of concurrent attempts.
pub struct Client {
    cfg: ClientConfig,
}

impl Client {
    pub fn new(cfg: ClientConfig) -> Client {
        Client { cfg }
    }

    /// Runs a dial attempt: connects to the rendezvous server at `addr`,
    /// races every way of reaching the peer that shares `token`, and returns
    /// the winning bearer.
    pub async fn dial(
        &self,
        cancel: &CancellationToken,
        addr: &str,
        token: &str,
        headers: &[(&str, &str)],
    ) -> Result<Conn, Error> {
        self.attempt(cancel, Meta::new(true, addr, token), headers).await
    }

    /// Runs an accept attempt, the mirror image of [`Client::dial`].
    pub async fn accept(
        &self,
        cancel: &CancellationToken,
        addr: &str,
        token: &str,
        headers: &[(&str, &str)],
    ) -> Result<Conn, Error> {
        self.attempt(cancel, Meta::new(false, addr, token), headers).await
    }

    async fn attempt(
        &self,
        cancel: &CancellationToken,
        mut meta: Meta,
        headers: &[(&str, &str)],
    ) -> Result<Conn, Error> {
        // Everything the attempt starts lives under this scope; returning
        // from here cancels it, which closes the socket, the fan-out and the
        // handshake pipeline.
        let cancel = cancel.child_token();
        let _guard = cancel.clone().drop_guard();

        let socket = Arc::new(Socket::bind(0).await?);
        let spaces = self.cfg.addr_spaces;
        let self_addrs = match &self.cfg.self_addr_fn {
            Some(self_addr_fn) => self_addr_fn(&socket),
            None => ifaces::default_self_addrs(&socket),
        };
        meta.self_addrs = self_addrs
            .into_iter()
            .filter(|addr| spaces.includes(space_of(addr.ip())) && good_self(*addr).is_ok())
            .collect();

        let relay = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "rdv attempt canceled").into())
            }
            result = dial_rdv_server(&socket, &mut meta, headers, self.cfg.tls.clone()) => result?,
        };
        debug!(attempt = %meta.client_summary(), "connecting to peer");

        let (conn_tx, conn_rx) = mpsc::channel::<Conn>(CHAN_SIZE);
        let (cand_tx, cand_rx) = mpsc::channel::<Conn>(CHAN_SIZE);
        let shared_meta = relay.meta().clone();
        let is_dialer = shared_meta.is_dialer;
        conn_tx
            .send(relay)
            .await
            .expect("candidate channel closed early");

        tokio::spawn(dial_and_listen(
            Arc::clone(&socket),
            shared_meta,
            spaces,
            conn_tx,
            cancel.clone(),
        ));
        tokio::spawn(hand_pipeline(conn_rx, cand_tx, cancel.clone()));

        let chooser = match is_dialer {
            true => self
                .cfg
                .dial_chooser
                .clone()
                .unwrap_or_else(|| relay_penalty(DEFAULT_RELAY_PENALTY)),
            false => first_wins(),
        };
        let (chosen, unchosen) = chooser(cancel.clone(), cand_rx).await;
        for conn in unchosen {
            debug!(addr = ?conn.peer_addr(), "closing unchosen");
            drop(conn);
        }
        let mut chosen = chosen.ok_or(Error::NotChosen)?;

        // The winner confirms under a tight deadline; a stuck peer at this
        // point is as good as none.
        match timeout(http::VERY_SOON, chosen.client_shake()).await {
            Ok(Ok(())) => Ok(chosen),
            _ => Err(Error::NotChosen),
        }
    }
}

/// Dials the rendezvous server and runs the HTTP upgrade. On success the
/// returned conn is the relay bearer and `meta` has absorbed the peer and
/// observed addresses.
async fn dial_rdv_server(
    socket: &Socket,
    meta: &mut Meta,
    headers: &[(&str, &str)],
    tls: Option<Arc<rustls::ClientConfig>>,
) -> Result<Conn, Error> {
    let url = Url::parse(&meta.server_addr).map_err(|err| Error::Url(err.to_string()))?;
    let (mut io, local_addr, peer_addr) = socket.dial_url(&url, tls).await?;

    http::write_request(&mut io, meta, headers, &url).await?;
    let head = http::read_head(&mut io).await?;
    let mut resp = http::parse_response_head(&head)?;
    if let Err(reason) = http::apply_response(meta, &resp) {
        resp.body = http::slurp(&mut io, &head.leftover, &resp.headers).await;
        return Err(Error::Handshake {
            reason,
            response: Some(Box::new(resp)),
        });
    }

    Ok(Conn::relay(
        io,
        head.leftover,
        meta.clone(),
        None,
        Some(local_addr),
        Some(peer_addr),
    ))
}

/// Fans out dials to every eligible peer addr and accepts inbound conns on
/// the socket, feeding all of them to the handshake pipeline. Runs until the
/// attempt scope is cancelled; the channel closing signals the pipeline that
/// no more candidates are coming.
async fn dial_and_listen(
    socket: Arc<Socket>,
    meta: Meta,
    spaces: AddrSpace,
    conn_tx: mpsc::Sender<Conn>,
    cancel: CancellationToken,
) {
    let mut dials: JoinSet<()> = JoinSet::new();
    for addr in meta.peer_addrs.iter().copied() {
        let space = space_of(addr.ip());
        if let Err(err) = acceptable(addr) {
            debug!(%addr, %err, "skip outbound");
            continue;
        }
        if !spaces.includes(space) {
            debug!(%addr, %space, "skip outbound");
            continue;
        }
        let socket = Arc::clone(&socket);
        let meta = meta.clone();
        let conn_tx = conn_tx.clone();
        let cancel = cancel.clone();
        dials.spawn(async move {
            let dialed = tokio::select! {
                _ = cancel.cancelled() => return,
                result = socket.dial(addr) => result,
            };
            match dialed {
                Ok(stream) => {
                    let _ = conn_tx.send(Conn::direct(stream, meta)).await;
                }
                Err(err) => debug!(%addr, %err, "dial failed"),
            }
        });
    }

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.accept() => result,
        };
        let (stream, from) = match accepted {
            Ok(accepted) => accepted,
            Err(_) => break,
        };
        let space = space_of(from.ip());
        if !spaces.includes(space) {
            debug!(addr = %from, %space, "close inbound: disabled addr space");
            continue;
        }
        let _ = conn_tx.send(Conn::direct(stream, meta.clone())).await;
    }

    while dials.join_next().await.is_some() {}
    // conn_tx drops here, ending the pipeline's input
}

/// Runs the per-candidate application handshake on everything the fan-out
/// produces. Valid candidates go to the chooser; failures are closed and
/// absorbed. Candidates still shaking when the scope cancels are dropped.
async fn hand_pipeline(
    mut conn_rx: mpsc::Receiver<Conn>,
    cand_tx: mpsc::Sender<Conn>,
    cancel: CancellationToken,
) {
    let mut shakes: JoinSet<()> = JoinSet::new();
    while let Some(mut conn) = conn_rx.recv().await {
        let cand_tx = cand_tx.clone();
        let cancel = cancel.clone();
        shakes.spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = conn.client_hand() => result,
            };
            match result {
                Ok(()) => {
                    let _ = cand_tx.send(conn).await;
                }
                Err(err) => debug!(addr = ?conn.peer_addr(), %err, "shake failed"),
            }
        });
    }
    while shakes.join_next().await.is_some() {}
    // cand_tx drops here, releasing the chooser
}

/// A chooser giving the relay some penalty: how long the dialer waits for a
/// p2p connection before falling back on the relay. Zero uses the relay as
/// soon as it's available (p2p can still win the race to it); a larger value
/// raises the chances of p2p at the cost of delaying the connection.
pub fn relay_penalty(penalty: Duration) -> Chooser {
    Arc::new(move |cancel, cand_rx| -> ChooseFuture {
        Box::pin(with_relay_penalty(cancel, cand_rx, penalty))
    })
}

async fn with_relay_penalty(
    cancel: CancellationToken,
    mut cand_rx: mpsc::Receiver<Conn>,
    penalty: Duration,
) -> (Option<Conn>, Vec<Conn>) {
    let mut chosen: Option<Conn> = None;
    let mut unchosen = Vec::new();
    let timer = sleep(FAR_FUTURE);
    tokio::pin!(timer);
    let mut fired = false;

    loop {
        tokio::select! {
            _ = timer.as_mut(), if !fired => {
                fired = true;
                cancel.cancel();
            }
            maybe = cand_rx.recv() => {
                let conn = match maybe {
                    Some(conn) => conn,
                    None => break,
                };
                if !conn.is_relay() {
                    // direct always wins, stop producing candidates
                    cancel.cancel();
                } else {
                    timer.as_mut().reset(Instant::now() + penalty);
                }
                if chosen.is_none() {
                    chosen = Some(conn);
                } else if chosen.as_ref().is_some_and(|best| best.is_relay()) {
                    // unchoose the relay in favor of the direct conn
                    unchosen.push(chosen.replace(conn).unwrap());
                } else {
                    unchosen.push(conn);
                }
            }
        }
    }
    (chosen, unchosen)
}

/// The fixed acceptor policy: the first validated candidate wins.
pub(crate) fn first_wins() -> Chooser {
    Arc::new(|cancel, mut cand_rx| -> ChooseFuture {
        Box::pin(async move {
            let chosen = cand_rx.recv().await;
            cancel.cancel();
            let mut unchosen = Vec::new();
            while let Some(conn) = cand_rx.recv().await {
                unchosen.push(conn);
            }
            (chosen, unchosen)
        })
    })
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    fn candidate(is_relay: bool) -> Conn {
        let meta = Meta::new(true, "http://localhost:8080/", "t");
        let (near, _far) = duplex(1024);
        let mut conn = Conn::relay(Box::new(near), Vec::new(), meta, None, None, None);
        // direct conns only exist over TCP in production; a relay conn with
        // the flag cleared behaves identically here
        conn.set_is_relay(is_relay);
        conn
    }

    async fn run_chooser(
        chooser: Chooser,
        feed: Vec<(Duration, Conn)>,
    ) -> (Option<Conn>, Vec<Conn>, bool) {
        let cancel = CancellationToken::new();
        let (cand_tx, cand_rx) = mpsc::channel(CHAN_SIZE);
        let feeder = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for (delay, conn) in feed {
                    sleep(delay).await;
                    if cand_tx.send(conn).await.is_err() {
                        return;
                    }
                }
                // keep the channel open until cancelled, like the real
                // pipeline does while the socket still listens
                cancel.cancelled().await;
            })
        };
        let (chosen, unchosen) = chooser(cancel.clone(), cand_rx).await;
        feeder.await.unwrap();
        (chosen, unchosen, cancel.is_cancelled())
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_penalty_direct_preempts() {
        // relay arrives first, then a direct conn within the penalty
        let feed = vec![
            (Duration::from_millis(0), candidate(true)),
            (Duration::from_millis(100), candidate(false)),
        ];
        let (chosen, unchosen, cancelled) =
            run_chooser(relay_penalty(Duration::from_millis(500)), feed).await;
        assert!(!chosen.unwrap().is_relay());
        assert_eq!(unchosen.len(), 1);
        assert!(unchosen[0].is_relay());
        assert!(cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_penalty_relay_wins_quietly() {
        // no direct conn ever arrives; the relay wins once the penalty runs out
        let feed = vec![(Duration::from_millis(0), candidate(true))];
        let (chosen, unchosen, _) =
            run_chooser(relay_penalty(Duration::from_millis(500)), feed).await;
        assert!(chosen.unwrap().is_relay());
        assert!(unchosen.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_penalty_zero_takes_relay_immediately() {
        let feed = vec![(Duration::from_millis(0), candidate(true))];
        let start = Instant::now();
        let (chosen, _, _) = run_chooser(relay_penalty(Duration::ZERO), feed).await;
        assert!(chosen.unwrap().is_relay());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_penalty_direct_first() {
        // a direct conn before the relay ends the race on the spot
        let feed = vec![(Duration::from_millis(0), candidate(false))];
        let (chosen, unchosen, cancelled) =
            run_chooser(relay_penalty(Duration::from_millis(500)), feed).await;
        assert!(!chosen.unwrap().is_relay());
        assert!(unchosen.is_empty());
        assert!(cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_wins() {
        let feed = vec![
            (Duration::from_millis(0), candidate(true)),
            (Duration::from_millis(0), candidate(false)),
        ];
        let (chosen, unchosen, cancelled) = run_chooser(first_wins(), feed).await;
        assert!(chosen.unwrap().is_relay());
        assert_eq!(unchosen.len(), 1);
        assert!(cancelled);
    }
}
