//! Allocation client: hands out IDs from per-source buckets reserved from the
//! master, keeping its RPC connection alive and reconnecting when it breaks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::client::Bucket;
use crate::rpc::RpcClient;
use crate::server::{
    IncrCurrentIdArgs, IncrCurrentIdReply, LoadCurrentIdArgs, METHOD_INCR_CURRENT_ID,
    METHOD_KEEP_ALIVE, METHOD_LOAD_CURRENT_ID,
};
use crate::utils::{supervise, IdGenError, StatusFlag};

/// Configuration parameters struct of an allocation client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// IDs reserved per RPC round-trip.
    pub bucket_step: i64,

    /// Interval between keepalive calls.
    pub keepalive_interval_ms: u64,

    /// Delay before restarting a failed keepalive loop.
    pub restart_backoff_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            bucket_step: 100,
            keepalive_interval_ms: 5000,
            restart_backoff_ms: 2000,
        }
    }
}

/// Bucket slot of one source; `None` until the first reservation.
type BucketSlot = Arc<AsyncMutex<Option<Bucket>>>;

/// The allocation client.
pub struct AllocClient {
    master: SocketAddr,
    config: ClientConfig,

    /// Current RPC connection; swapped on reconnect.
    rpc: RwLock<Arc<RpcClient>>,

    /// Serializes reconnect attempts.
    reconnect_lock: AsyncMutex<()>,

    /// Map from source name -> its bucket slot.
    buckets: Mutex<HashMap<String, BucketSlot>>,
}

impl AllocClient {
    /// Connects to the master's RPC port at `master`.
    pub async fn new_and_setup(
        master: SocketAddr,
        config: ClientConfig,
    ) -> Result<Arc<Self>, IdGenError> {
        if config.bucket_step <= 0 {
            return logged_err!("invalid config.bucket_step {}", config.bucket_step);
        }
        if config.keepalive_interval_ms == 0 {
            return logged_err!("invalid config.keepalive_interval_ms 0");
        }

        let rpc = RpcClient::connect(master).await?;
        pf_info!("connected to master {}", master);
        Ok(Arc::new(AllocClient {
            master,
            config,
            rpc: RwLock::new(Arc::new(rpc)),
            reconnect_lock: AsyncMutex::new(()),
            buckets: Mutex::new(HashMap::new()),
        }))
    }

    pub fn master(&self) -> SocketAddr {
        self.master
    }

    pub fn bucket_step(&self) -> i64 {
        self.config.bucket_step
    }

    fn rpc(&self) -> Arc<RpcClient> {
        self.rpc.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn bucket_slot(&self, source: &str) -> BucketSlot {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    /// Returns the next ID of `source`, reserving a fresh bucket from the
    /// master if the cached one is exhausted.
    pub async fn next_id(&self, source: &str) -> Result<i64, IdGenError> {
        if source.is_empty() {
            return Err(IdGenError::msg("empty source name"));
        }

        let slot = self.bucket_slot(source);
        let mut bucket = slot.lock().await;
        if let Some(id) = bucket.as_mut().and_then(|b| b.next_id()) {
            return Ok(id);
        }

        // our view of the counter, sent along for diagnostics only
        let current_id = bucket.as_ref().map(|b| b.range().1).unwrap_or(0);
        let reply: IncrCurrentIdReply = self
            .call_with_retry(
                METHOD_INCR_CURRENT_ID,
                &IncrCurrentIdArgs {
                    source: source.to_string(),
                    current_id,
                    bucket_step: self.config.bucket_step,
                },
            )
            .await?;
        pf_debug!(
            "reserved [{}, {}) for '{}'",
            reply.result_current_id,
            reply.new_db_current_id,
            source
        );

        let mut fresh = Bucket::from_reply(&reply);
        let id = fresh
            .next_id()
            .ok_or_else(|| IdGenError::msg(format!("empty bucket reserved for '{}'", source)))?;
        *bucket = Some(fresh);
        Ok(id)
    }

    /// Returns the counter of `source` persisted on the master.
    pub async fn load_current_id(&self, source: &str) -> Result<i64, IdGenError> {
        self.call_with_retry(
            METHOD_LOAD_CURRENT_ID,
            &LoadCurrentIdArgs {
                source: source.to_string(),
                bucket_step: self.config.bucket_step,
            },
        )
        .await
    }

    /// Issues a call; if the connection turns out to be shut down, reconnects
    /// once and issues it again. Reservations are at-least-once: a bucket
    /// reserved by a lost first attempt is simply burned.
    async fn call_with_retry<A, R>(&self, method: &str, args: &A) -> Result<R, IdGenError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let rpc = self.rpc();
        match rpc.call(method, args).await {
            Err(e) if e.is_conn_shutdown() => {
                pf_warn!("connection to {} lost during {}, reconnecting", self.master, method);
                let rpc = self.reconnect(&rpc).await?;
                rpc.call(method, args).await
            }
            result => result,
        }
    }

    /// Replaces the `stale` connection with a freshly dialed one, trying
    /// exactly once. If another task already replaced it, returns that one.
    async fn reconnect(&self, stale: &Arc<RpcClient>) -> Result<Arc<RpcClient>, IdGenError> {
        let _guard = self.reconnect_lock.lock().await;
        let current = self.rpc();
        if !Arc::ptr_eq(&current, stale) && !current.is_shut_down() {
            return Ok(current);
        }

        current.close().await;
        let fresh = Arc::new(RpcClient::connect(self.master).await?);
        *self.rpc.write().unwrap_or_else(|e| e.into_inner()) = fresh.clone();
        pf_info!("reconnected to master {}", self.master);
        Ok(fresh)
    }

    /// Keepalive task function: probes the master every interval and
    /// reconnects once on a shut-down connection. Returns an error if the
    /// reconnect fails, leaving the restart to its supervisor.
    async fn keepalive_loop(self: Arc<Self>) -> Result<(), IdGenError> {
        let mut ticker = time::interval(Duration::from_millis(self.config.keepalive_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut n: i64 = 0;

        loop {
            ticker.tick().await;
            let rpc = self.rpc();
            match rpc.call::<_, i64>(METHOD_KEEP_ALIVE, &n).await {
                Ok(m) => {
                    if m != n + 1 {
                        pf_warn!("keepalive {} answered with {}", n, m);
                    }
                    pf_trace!("keepalive {} ok", n);
                    n = if m < i64::MAX { m } else { 0 };
                }
                Err(e) if e.is_conn_shutdown() => {
                    pf_warn!("keepalive found connection to {} shut down", self.master);
                    self.reconnect(&rpc).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs the keepalive loop under supervision until `status` turns DEAD.
    pub async fn run_keepalive(self: Arc<Self>, status: StatusFlag) -> Result<(), IdGenError> {
        let client = self.clone();
        supervise(
            "keepalive loop",
            Duration::from_millis(self.config.restart_backoff_ms),
            &status,
            move || client.clone().keepalive_loop(),
        )
        .await
    }

    /// Closes the current connection gracefully.
    pub async fn close(&self) {
        self.rpc().close().await;
    }
}
