//! Master node: owns the counter store and serves the allocation RPC port
//! and the replication backup port, each with its own connection tracker.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Duration;

use crate::conn::{ConnContext, ConnTracker};
use crate::replication::{
    serve_backup_conn, BackupParams, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_LEN,
};
use crate::rpc::{serve_rpc_conn, DEFAULT_MAX_MSG_LEN};
use crate::server::{AllocService, CounterStore};
use crate::utils::{supervise, tcp_bind_with_retry, IdGenError, StatusFlag};

/// Default log size beyond which the counter store compacts itself.
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1 << 20;

/// Configuration parameters struct of a master node.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    /// Path of the counter store file.
    pub store_path: String,

    /// Idle threshold of a connection; clamped up to 10 seconds.
    pub max_unactive_secs: u64,

    /// Interval of the idle connection sweep.
    pub sweep_interval_ms: u64,

    /// Delay before restarting a failed accept loop.
    pub accept_backoff_ms: u64,

    /// Chunk size of snapshot transfers to standbys.
    pub chunk_size: usize,

    /// Largest frame data length accepted from a standby.
    pub max_frame_len: usize,

    /// Largest encoded RPC request accepted from a client.
    pub max_msg_len: usize,

    /// Store log size that triggers compaction.
    pub compact_threshold: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            store_path: "/tmp/idgen.counter.db".into(),
            max_unactive_secs: 60,
            sweep_interval_ms: 1000,
            accept_backoff_ms: 1000,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_msg_len: DEFAULT_MAX_MSG_LEN,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        }
    }
}

/// Which port a connection came in on.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ServerKind {
    Rpc,
    Backup,
}

/// One listening port with its live connections.
struct Endpoint {
    kind: ServerKind,
    listener: TcpListener,
    tracker: Arc<ConnTracker>,
    sweeper_handle: JoinHandle<()>,
}

/// The master node.
pub struct MasterServer {
    config: MasterConfig,
    status: StatusFlag,
    store: Arc<CounterStore>,
    service: Arc<AllocService>,

    rpc: Endpoint,
    backup: Option<Endpoint>,

    /// Connection handler tasks of both ports.
    handlers: Mutex<JoinSet<()>>,
}

impl MasterServer {
    /// Opens the counter store, binds the RPC port and (if given) the backup
    /// port, and spawns their idle connection sweepers.
    pub async fn new_and_setup(
        rpc_addr: SocketAddr,
        backup_addr: Option<SocketAddr>,
        config: MasterConfig,
        status: StatusFlag,
    ) -> Result<Arc<Self>, IdGenError> {
        if config.store_path.is_empty() {
            return logged_err!("invalid config.store_path ''");
        }
        if config.sweep_interval_ms == 0 {
            return logged_err!("invalid config.sweep_interval_ms 0");
        }
        if config.max_msg_len == 0 {
            return logged_err!("invalid config.max_msg_len 0");
        }
        if config.chunk_size == 0 || config.chunk_size > config.max_frame_len {
            return logged_err!(
                "invalid config.chunk_size {} (max_frame_len {})",
                config.chunk_size,
                config.max_frame_len
            );
        }

        let store = Arc::new(
            CounterStore::open(Path::new(&config.store_path), config.compact_threshold)
                .await?,
        );
        let service = Arc::new(AllocService::new(store.clone()));

        let rpc = Self::bind_endpoint(ServerKind::Rpc, rpc_addr, &config, &status).await?;
        let backup = match backup_addr {
            Some(addr) => {
                Some(Self::bind_endpoint(ServerKind::Backup, addr, &config, &status).await?)
            }
            None => None,
        };

        Ok(Arc::new(MasterServer {
            config,
            status,
            store,
            service,
            rpc,
            backup,
            handlers: Mutex::new(JoinSet::new()),
        }))
    }

    async fn bind_endpoint(
        kind: ServerKind,
        addr: SocketAddr,
        config: &MasterConfig,
        status: &StatusFlag,
    ) -> Result<Endpoint, IdGenError> {
        let listener = tcp_bind_with_retry(addr, 10).await?;
        pf_info!("{:?} port listening on {}", kind, listener.local_addr()?);

        let tracker = Arc::new(ConnTracker::new());
        let sweeper_handle = tokio::spawn(tracker.clone().sweeper(
            status.clone(),
            config.max_unactive_secs,
            Duration::from_millis(config.sweep_interval_ms),
        ));
        Ok(Endpoint {
            kind,
            listener,
            tracker,
            sweeper_handle,
        })
    }

    fn endpoint(&self, kind: ServerKind) -> Result<&Endpoint, IdGenError> {
        match kind {
            ServerKind::Rpc => Ok(&self.rpc),
            ServerKind::Backup => self
                .backup
                .as_ref()
                .ok_or_else(|| IdGenError::msg("backup port not enabled")),
        }
    }

    /// Bound address of a port.
    pub fn local_addr(&self, kind: ServerKind) -> Result<SocketAddr, IdGenError> {
        Ok(self.endpoint(kind)?.listener.local_addr()?)
    }

    /// Live connections of a port.
    pub fn tracker(&self, kind: ServerKind) -> Result<Arc<ConnTracker>, IdGenError> {
        Ok(self.endpoint(kind)?.tracker.clone())
    }

    pub fn store(&self) -> Arc<CounterStore> {
        self.store.clone()
    }

    pub fn status(&self) -> &StatusFlag {
        &self.status
    }

    /// Serves both ports until the node is marked DEAD, then waits for every
    /// connection handler to wind down.
    pub async fn serve(self: Arc<Self>) -> Result<(), IdGenError> {
        let backoff = Duration::from_millis(self.config.accept_backoff_ms);
        let rpc_loop = {
            let master = self.clone();
            supervise("rpc accept loop", backoff, &self.status, move || {
                master.clone().accept_loop(ServerKind::Rpc)
            })
        };
        let backup_loop = async {
            if self.backup.is_some() {
                let master = self.clone();
                supervise("backup accept loop", backoff, &self.status, move || {
                    master.clone().accept_loop(ServerKind::Backup)
                })
                .await
            } else {
                Ok(())
            }
        };
        let (rpc_result, backup_result) = tokio::join!(rpc_loop, backup_loop);

        // both loops return only once the node is dead; closing whatever is
        // still tracked unblocks handlers stuck writing to silent peers
        for endpoint in std::iter::once(&self.rpc).chain(self.backup.as_ref()) {
            endpoint.tracker.close_all();
        }
        let mut handlers = {
            let mut guard = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        let mut num_handlers = 0;
        while handlers.join_next().await.is_some() {
            num_handlers += 1;
        }
        for endpoint in std::iter::once(&self.rpc).chain(self.backup.as_ref()) {
            endpoint.sweeper_handle.abort();
        }
        pf_info!("master stopped, {} handlers joined", num_handlers);

        rpc_result?;
        backup_result
    }

    /// Acceptor task function of a port.
    async fn accept_loop(self: Arc<Self>, kind: ServerKind) -> Result<(), IdGenError> {
        let endpoint = self.endpoint(kind)?;
        pf_debug!("{:?} acceptor spawned", endpoint.kind);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = endpoint.listener.accept() => accepted?,
                _ = self.status.wait_dead() => {
                    pf_debug!("{:?} acceptor exited", endpoint.kind);
                    return Ok(());
                }
            };
            self.spawn_handler(endpoint, stream, peer);
        }
    }

    /// Registers a freshly accepted connection and spawns its handler, which
    /// deregisters it on exit.
    fn spawn_handler(&self, endpoint: &Endpoint, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            pf_warn!("error setting nodelay for {}: {}", peer, e);
        }
        let (conn_read, conn_write) = stream.into_split();
        let ctx = ConnContext::new(endpoint.tracker.next_id(), peer, conn_write);
        endpoint.tracker.insert(ctx.clone());
        pf_info!("accepted {:?} connection {} from {}", endpoint.kind, ctx.id(), peer);

        let tracker = endpoint.tracker.clone();
        let status = self.status.clone();
        let kind = endpoint.kind;
        let service = self.service.clone();
        let store = self.store.clone();
        let max_msg_len = self.config.max_msg_len;
        let params = BackupParams {
            chunk_size: self.config.chunk_size,
            max_frame_len: self.config.max_frame_len,
        };

        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        // reap finished handlers
        while handlers.try_join_next().is_some() {}
        handlers.spawn(async move {
            let id = ctx.id();
            match kind {
                ServerKind::Rpc => {
                    serve_rpc_conn(service, ctx, conn_read, status, max_msg_len).await
                }
                ServerKind::Backup => {
                    serve_backup_conn(store, ctx, conn_read, status, params).await
                }
            }
            tracker.remove(id);
            pf_info!("{:?} connection {} ({}) closed", kind, id, peer);
        });
    }
}
