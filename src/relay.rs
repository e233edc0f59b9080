use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    conn::{Conn, Meta},
    http,
};

/// A caller-supplied sink fed every relayed chunk of one direction, e.g. for
/// metrics or recording.
pub type Tap = Box<dyn AsyncWrite + Send + Unpin>;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Relays bytes between a matched pair of conns until either side closes, the
/// idle timeout fires, or the scope is cancelled.
pub struct Relayer {
    /// Tap observing bytes flowing from the dialer.
    pub dial_tap: Option<Tap>,

    /// Tap observing bytes flowing from the acceptor.
    pub accept_tap: Option<Tap>,

    /// At least this much inactivity is allowed on both peers before
    /// terminating the connection. Recommended at least 30s to account for
    /// network conditions and application level heartbeats. Zero means no
    /// timeout. As relays may serve a lot of traffic, activity is checked at
    /// an interval.
    pub idle_timeout: Duration,
}

impl Default for Relayer {
    fn default() -> Relayer {
        Relayer {
            dial_tap: None,
            accept_tap: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

type Outcome = Arc<Mutex<Option<io::Result<()>>>>;

impl Relayer {
    /// Refuses a matched pair: both peers get the terminal response instead
    /// of an upgrade.
    pub async fn reject(
        mut dc: Conn,
        mut ac: Conn,
        status: u16,
        reason: &str,
    ) -> io::Result<()> {
        let d = http::write_response_err(&mut dc, status, reason).await;
        let a = http::write_response_err(&mut ac, status, reason).await;
        d.and(a)
    }

    /// Runs the relay service. Completes the server-side half of the rdv
    /// handshake on both conns, then pumps bytes in both directions. Returns
    /// the bytes relayed from the dialer and from the acceptor, and the first
    /// non-EOF error. A peer closing in a normal manner, including before its
    /// rdv line ever arrived (p2p succeeded out-of-band), counts as clean.
    pub async fn run(
        self,
        cancel: CancellationToken,
        dc: Conn,
        ac: Conn,
    ) -> (u64, u64, Option<io::Error>) {
        let cancel = cancel.child_token();
        let outcome: Outcome = Arc::new(Mutex::new(None));

        let idle = IdleTimer::start(self.idle_timeout, {
            let cancel = cancel.clone();
            let outcome = outcome.clone();
            move || {
                set_first(
                    &outcome,
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "periodic idle timeout exceeded",
                    )),
                );
                cancel.cancel();
            }
        });

        let dc_meta = dc.meta().clone();
        let ac_meta = ac.meta().clone();
        // What each side will write on the wire: the dialer its confirm, the
        // acceptor its hello.
        let (dc_line, _) = dc_meta.wire_lines();
        let (ac_line, _) = ac_meta.wire_lines();
        let mut resp_for_ac = ac_meta.clone();
        resp_for_ac.set_peer_addrs_from(&dc_meta);
        let mut resp_for_dc = dc_meta.clone();
        resp_for_dc.set_peer_addrs_from(&ac_meta);

        let (dc_read, dc_write) = tokio::io::split(dc);
        let (ac_read, ac_write) = tokio::io::split(ac);

        let from_dialer = tokio::spawn(pump(
            ac_write,
            dc_read,
            resp_for_ac,
            dc_line,
            self.dial_tap,
            idle.activity(),
            cancel.clone(),
            outcome.clone(),
        ));
        let an = pump(
            dc_write,
            ac_read,
            resp_for_dc,
            ac_line,
            self.accept_tap,
            idle.activity(),
            cancel.clone(),
            outcome.clone(),
        )
        .await;
        let dn = from_dialer.await.unwrap_or(0);
        drop(idle);

        let err = outcome.lock().unwrap().take().and_then(|result| result.err());
        (dn, an, err)
    }
}

/// One relay direction. Sends the deferred response to `to` (carrying the
/// partner's addrs), reads the rdv line `from` owes given its role, forwards
/// it, then copies bytes until EOF, an error, or cancellation. Returns the
/// byte count of the copy phase.
async fn pump(
    mut to: WriteHalf<Conn>,
    mut from: ReadHalf<Conn>,
    resp_meta: Meta,
    expect: String,
    mut tap: Option<Tap>,
    activity: Activity,
    cancel: CancellationToken,
    outcome: Outcome,
) -> u64 {
    let initiate = async {
        http::write_response(&mut to, &resp_meta).await?;
        expect_from(&mut from, &expect).await?;
        to.write_all(expect.as_bytes()).await
    };
    let initiated = tokio::select! {
        _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "relay canceled")),
        result = initiate => result,
    };
    if let Err(err) = initiated {
        set_first(&outcome, normalize_eof(err));
        cancel.cancel();
        let _ = to.shutdown().await;
        return 0;
    }

    let mut n = 0u64;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let result = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break Err(io::Error::new(io::ErrorKind::Interrupted, "relay canceled")),
            result = from.read(&mut buf) => result,
        };
        match read {
            Ok(0) => break Ok(()),
            Ok(count) => {
                activity.extend();
                let write = async {
                    if let Some(tap) = tap.as_mut() {
                        tap.write_all(&buf[..count]).await?;
                    }
                    to.write_all(&buf[..count]).await
                };
                let written = tokio::select! {
                    _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "relay canceled")),
                    result = write => result,
                };
                if let Err(err) = written {
                    break Err(err);
                }
                n += count as u64;
            }
            Err(err) => break Err(err),
        }
    };
    set_first(&outcome, result);
    cancel.cancel();
    let _ = to.shutdown().await;
    n
}

async fn expect_from<R: AsyncRead + Unpin>(r: &mut R, line: &str) -> io::Result<()> {
    let mut actual = vec![0u8; line.len()];
    r.read_exact(&mut actual).await?;
    if actual != line.as_bytes() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "rdv protocol error: invalid peer handshake",
        ));
    }
    Ok(())
}

/// Only the first completed direction decides the relay's reported outcome.
/// `Ok(())` records a clean EOF.
fn set_first(outcome: &Outcome, result: io::Result<()>) {
    let mut slot = outcome.lock().unwrap();
    if slot.is_none() {
        *slot = Some(result);
    }
}

fn normalize_eof(err: io::Error) -> io::Result<()> {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => Ok(()),
        _ => Err(err),
    }
}

/// Tracks whether any bytes moved since the last check.
#[derive(Clone)]
pub(crate) struct Activity(Arc<AtomicBool>);

impl Activity {
    /// Registers activity and prolongs the deadline.
    pub(crate) fn extend(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// An activity-driven deadline. Every elapsed `timeout` without activity
/// fires the callback once; the lobby and the relay both hang their abort
/// paths off it.
pub(crate) struct IdleTimer {
    activity: Activity,
    task: Option<JoinHandle<()>>,
}

impl IdleTimer {
    pub(crate) fn start<F: FnOnce() + Send + 'static>(timeout: Duration, on_idle: F) -> IdleTimer {
        let activity = Activity(Arc::new(AtomicBool::new(false)));
        let task = match timeout.is_zero() {
            true => None,
            false => {
                let flag = Arc::clone(&activity.0);
                Some(tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(timeout).await;
                        if !flag.swap(false, Ordering::Relaxed) {
                            on_idle();
                            return;
                        }
                    }
                }))
            }
        };
        IdleTimer { activity, task }
    }

    pub(crate) fn activity(&self) -> Activity {
        self.activity.clone()
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
