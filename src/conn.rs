//! Per-socket connection context and the connection lifecycle manager that
//! sweeps idle connections on a master.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify};
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::utils::{now_secs, IdGenError, StatusFlag};

/// Connection ID type, unique within one tracker.
pub type ConnId = u64;

/// Floor of the idle threshold, in seconds.
pub const MIN_UNACTIVE_SECS: u64 = 10;

/// How long a closing connection may spend flushing what is left in its
/// write buffer.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// State shared by every task touching one socket. The read half is owned by
/// the task that reads frames; the write half lives here behind an async
/// lock so that several tasks (e.g., heartbeat and sync requester on a
/// standby, concurrent RPC replies on a master) can write whole messages
/// without interleaving.
#[derive(Debug)]
pub struct ConnContext {
    /// Connection ID.
    id: ConnId,

    /// Remote address.
    peer: SocketAddr,

    /// Unix seconds of the last successfully read frame or request.
    last_active: AtomicI64,

    /// Buffered write half of the socket.
    writer: AsyncMutex<BufWriter<OwnedWriteHalf>>,

    /// Set once the connection has been asked to close.
    closed: AtomicBool,

    /// Wakes whoever waits in `closed()`.
    close_notify: Notify,
}

impl ConnContext {
    /// Creates a new context around the write half of a just accepted or
    /// just dialed socket. The connection counts as active right now.
    pub fn new(
        id: ConnId,
        peer: SocketAddr,
        conn_write: OwnedWriteHalf,
    ) -> Arc<Self> {
        Arc::new(ConnContext {
            id,
            peer,
            last_active: AtomicI64::new(now_secs()),
            writer: AsyncMutex::new(BufWriter::new(conn_write)),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        })
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Records activity at the current time. Called by the owning handler
    /// each time it successfully reads something.
    pub fn touch(&self) {
        self.touch_at(now_secs());
    }

    pub fn touch_at(&self, ts: i64) {
        self.last_active.store(ts, Ordering::Release);
    }

    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::Acquire)
    }

    /// Locks the buffered writer. Writers must flush before releasing the
    /// guard if they want the peer to see their bytes promptly.
    pub async fn writer(&self) -> AsyncMutexGuard<'_, BufWriter<OwnedWriteHalf>> {
        self.writer.lock().await
    }

    /// Asks the connection to close. The owning handler observes this via
    /// `closed()`, stops reading, and drops the socket; writes running under
    /// `unless_closed()` are abandoned.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once `close()` has been called. Typically used as a branch
    /// of a `tokio::select!`.
    pub async fn closed(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Runs `fut` (typically a write through `writer()`) until it finishes
    /// or the connection is closed, whichever comes first. A peer that stops
    /// reading therefore cannot keep a writer blocked past `close()`.
    pub async fn unless_closed<T, F>(&self, fut: F) -> Result<T, IdGenError>
    where
        F: Future<Output = Result<T, IdGenError>>,
    {
        tokio::select! {
            biased;
            _ = self.closed() => Err(IdGenError::conn_shutdown()),
            res = fut => res,
        }
    }

    /// Flushes outstanding writes and shuts down the write direction, giving
    /// up after `SHUTDOWN_GRACE`. Errors are ignored: the peer may already be
    /// gone. The socket itself is released once the last holder of this
    /// context drops it.
    pub async fn shutdown_writer(&self) {
        let _ = time::timeout(SHUTDOWN_GRACE, async {
            let mut writer = self.writer.lock().await;
            let _ = writer.flush().await;
            let _ = writer.shutdown().await;
        })
        .await;
    }
}

/// Connection lifecycle manager: the set of live connections accepted by
/// one server, plus the idle sweep over them.
#[derive(Debug, Default)]
pub struct ConnTracker {
    /// Map from connection ID -> its context. Accept loop inserts, handlers
    /// remove on exit, sweeper removes idle ones.
    conns: Mutex<HashMap<ConnId, Arc<ConnContext>>>,

    /// Next connection ID to hand out.
    next_id: AtomicU64,
}

impl ConnTracker {
    pub fn new() -> Self {
        ConnTracker {
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocates a fresh connection ID.
    pub fn next_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn conns(&self) -> std::sync::MutexGuard<'_, HashMap<ConnId, Arc<ConnContext>>> {
        // a panic while holding this lock cannot leave the map half-updated
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, ctx: Arc<ConnContext>) {
        self.conns().insert(ctx.id(), ctx);
    }

    pub fn remove(&self, id: ConnId) -> Option<Arc<ConnContext>> {
        self.conns().remove(&id)
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.conns().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.conns().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes and removes every connection whose last activity is more than
    /// `max_unactive_secs` (floor-clamped to `MIN_UNACTIVE_SECS`) before
    /// `now`. Returns the IDs closed.
    pub fn sweep_idle(&self, now: i64, max_unactive_secs: u64) -> Vec<ConnId> {
        let max_unactive = max_unactive_secs.max(MIN_UNACTIVE_SECS) as i64;
        let idle: Vec<Arc<ConnContext>> = {
            let mut conns = self.conns();
            let ids: Vec<ConnId> = conns
                .values()
                .filter(|ctx| now - ctx.last_active() > max_unactive)
                .map(|ctx| ctx.id())
                .collect();
            ids.into_iter().filter_map(|id| conns.remove(&id)).collect()
        };

        idle.iter()
            .map(|ctx| {
                ctx.close();
                pf_info!(
                    "closed idle connection {} ({}), last active {}s ago",
                    ctx.id(),
                    ctx.peer(),
                    now - ctx.last_active()
                );
                ctx.id()
            })
            .collect()
    }

    /// Closes and removes every tracked connection. Returns how many.
    pub fn close_all(&self) -> usize {
        let all: Vec<Arc<ConnContext>> =
            self.conns().drain().map(|(_, ctx)| ctx).collect();
        for ctx in &all {
            ctx.close();
        }
        all.len()
    }

    /// Sweeper task function: every `interval`, closes idle connections;
    /// once `status` turns DEAD, closes everything and exits.
    pub async fn sweeper(
        self: Arc<Self>,
        status: StatusFlag,
        max_unactive_secs: u64,
        interval: Duration,
    ) {
        pf_debug!("connection sweeper spawned");
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_idle(now_secs(), max_unactive_secs);
                },
                _ = status.wait_dead() => {
                    let closed = self.close_all();
                    pf_info!("server dead, closed {} connections", closed);
                    break;
                }
            }
        }

        pf_debug!("connection sweeper exited");
    }
}
