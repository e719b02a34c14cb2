//! Standby side of replication: keeps a local replica of the master's
//! counter store file up to date.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use serde::Deserialize;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::Notify;
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::conn::ConnContext;
use crate::replication::{
    read_frame, write_frame, Frame, FrameAction, SyncRequest, DEFAULT_MAX_FRAME_LEN,
};
use crate::utils::{
    file_md5, now_formatted, now_secs, supervise, tcp_connect_with_retry, IdGenError,
    StatusFlag,
};

/// Configuration parameters struct of a standby node.
#[derive(Debug, Clone, Deserialize)]
pub struct StandbyConfig {
    /// Path of the local replica file.
    pub replica_path: String,

    /// Interval between heartbeats sent to the master.
    pub heartbeat_interval_ms: u64,

    /// Pause between the end of one sync exchange and the next request.
    pub sync_interval_ms: u64,

    /// Delay before dialing the master again after a broken session.
    pub reconnect_backoff_ms: u64,

    /// Largest frame data length accepted from the master.
    pub max_frame_len: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for StandbyConfig {
    fn default() -> Self {
        StandbyConfig {
            replica_path: "/tmp/idgen.replica.db".into(),
            heartbeat_interval_ms: 5000,
            sync_interval_ms: 2000,
            reconnect_backoff_ms: 2000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Assembles incoming snapshot chunks into a staging file next to the
/// replica, then swaps it in atomically once the transfer ends. A reader of
/// the replica path never sees a half-written file.
#[derive(Debug)]
pub(crate) struct ReplicaApplier {
    replica_path: PathBuf,
    staging_path: PathBuf,

    /// Open staging file while a transfer is in progress.
    staging: Option<File>,

    /// Bytes received in the current transfer.
    total: u64,
}

impl ReplicaApplier {
    pub(crate) fn new(replica_path: &Path) -> Self {
        let mut staging_name = replica_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "replica".into());
        staging_name.push(".sync");
        ReplicaApplier {
            replica_path: replica_path.to_path_buf(),
            staging_path: replica_path.with_file_name(staging_name),
            staging: None,
            total: 0,
        }
    }

    pub(crate) fn in_transfer(&self) -> bool {
        self.staging.is_some()
    }

    /// Starts a new transfer, discarding any unfinished one.
    pub(crate) async fn begin(&mut self) -> Result<(), IdGenError> {
        if self.staging.is_some() {
            pf_warn!("discarding unfinished transfer of {} bytes", self.total);
        }
        self.staging = Some(File::create(&self.staging_path).await?);
        self.total = 0;
        Ok(())
    }

    /// Appends one chunk to the transfer in progress.
    pub(crate) async fn append(&mut self, data: &[u8]) -> Result<(), IdGenError> {
        match self.staging.as_mut() {
            Some(file) => {
                file.write_all(data).await?;
                self.total += data.len() as u64;
                Ok(())
            }
            None => logged_err!("snapshot chunk outside of a transfer"),
        }
    }

    /// Ends the current exchange. If a transfer was in progress, makes it
    /// durable and renames it over the replica, returning its size;
    /// otherwise the replica is left untouched and `None` is returned.
    pub(crate) async fn finish(&mut self) -> Result<Option<u64>, IdGenError> {
        let mut file = match self.staging.take() {
            Some(file) => file,
            None => return Ok(None),
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&self.staging_path, &self.replica_path).await?;
        Ok(Some(self.total))
    }

    /// Drops an unfinished transfer and its staging file.
    pub(crate) async fn abort(&mut self) {
        if self.staging.take().is_some() {
            if let Err(e) = fs::remove_file(&self.staging_path).await {
                pf_warn!("error removing '{}': {}", self.staging_path.display(), e);
            }
        }
    }
}

/// Standby node: dials the master's backup port, heartbeats it, and
/// periodically asks it for the store file whenever the local replica's
/// digest differs from the master's. Broken sessions are retried forever
/// until the node is marked DEAD.
pub struct StandbyNode {
    master: SocketAddr,
    config: StandbyConfig,
    status: StatusFlag,
}

impl StandbyNode {
    pub fn new(
        master: SocketAddr,
        config: StandbyConfig,
        status: StatusFlag,
    ) -> Result<Arc<Self>, IdGenError> {
        if config.replica_path.is_empty() {
            return logged_err!("invalid config.replica_path ''");
        }
        if config.heartbeat_interval_ms == 0 {
            return logged_err!("invalid config.heartbeat_interval_ms 0");
        }
        if config.sync_interval_ms == 0 {
            return logged_err!("invalid config.sync_interval_ms 0");
        }
        Ok(Arc::new(StandbyNode {
            master,
            config,
            status,
        }))
    }

    pub fn replica_path(&self) -> &Path {
        Path::new(&self.config.replica_path)
    }

    /// Runs backup sessions until the node is marked DEAD.
    pub async fn run(self: Arc<Self>) -> Result<(), IdGenError> {
        pf_info!("backing up master {} into '{}'", self.master, self.config.replica_path);
        let node = self.clone();
        supervise(
            "backup loop",
            Duration::from_millis(self.config.reconnect_backoff_ms),
            &self.status,
            move || node.clone().sync_session(),
        )
        .await?;
        pf_info!("backup loop of master {} stopped", self.master);
        Ok(())
    }

    /// One connection to the master. Only ever returns an error; the
    /// supervisor then reconnects.
    async fn sync_session(self: Arc<Self>) -> Result<(), IdGenError> {
        let stream = tcp_connect_with_retry(self.master, 0).await?;
        let peer = stream.peer_addr()?;
        let (conn_read, conn_write) = stream.into_split();
        let ctx = ConnContext::new(0, peer, conn_write);
        pf_info!("connected to master backup port {}", peer);

        let resync = Notify::new();
        let mut applier = ReplicaApplier::new(self.replica_path());

        let result = tokio::select! {
            r = self.heartbeat_loop(&ctx) => r,
            r = self.sync_requester(&ctx, &resync) => r,
            r = self.frame_reader(&ctx, conn_read, &mut applier, &resync) => r,
            _ = ctx.closed() => Err(IdGenError::conn_shutdown()),
        };

        applier.abort().await;
        ctx.close();
        ctx.shutdown_writer().await;
        result
    }

    /// Sends a heartbeat every interval. Replies are only logged; a silent
    /// master is noticed through socket errors, not missed heartbeats.
    async fn heartbeat_loop(&self, ctx: &ConnContext) -> Result<(), IdGenError> {
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let mut writer = ctx.writer().await;
            write_frame(&mut *writer, &Frame::ping(now_secs())).await?;
            writer.flush().await?;
            pf_trace!("heartbeat sent to {}", ctx.peer());
        }
    }

    /// Sends a sync request right away, then another one each time the
    /// previous exchange ended and the sync interval has passed.
    async fn sync_requester(
        &self,
        ctx: &ConnContext,
        resync: &Notify,
    ) -> Result<(), IdGenError> {
        let interval = Duration::from_millis(self.config.sync_interval_ms);
        loop {
            let req = SyncRequest {
                md5: file_md5(self.replica_path()).await?,
                ts: now_formatted(),
            };
            pf_debug!("requesting sync with replica md5 '{}'", req.md5);
            {
                let mut writer = ctx.writer().await;
                write_frame(&mut *writer, &Frame::new(FrameAction::SyncData, req.encode()?))
                    .await?;
                writer.flush().await?;
            }

            resync.notified().await;
            time::sleep(interval).await;
        }
    }

    /// Reads frames from the master and applies them.
    async fn frame_reader(
        &self,
        ctx: &ConnContext,
        mut conn_read: OwnedReadHalf,
        applier: &mut ReplicaApplier,
        resync: &Notify,
    ) -> Result<(), IdGenError> {
        let mut read_buf = BytesMut::with_capacity(self.config.max_frame_len.min(64 * 1024));
        loop {
            let frame =
                read_frame(&mut read_buf, &mut conn_read, self.config.max_frame_len)
                    .await?;
            ctx.touch();

            match frame.action {
                FrameAction::Ping => match frame.ping_ts() {
                    Some(ts) => pf_trace!("heartbeat reply from master at {}", ts),
                    None => pf_warn!("malformed heartbeat reply from master"),
                },

                FrameAction::SyncData => {
                    applier.begin().await?;
                    applier.append(&frame.data).await?;
                }

                FrameAction::ChunkData => {
                    if !applier.in_transfer() {
                        return logged_err!("CHUNK_DATA without preceding SYNC_DATA");
                    }
                    applier.append(&frame.data).await?;
                }

                FrameAction::ChunkEnd => {
                    match applier.finish().await? {
                        Some(total) => pf_info!(
                            "replica '{}' updated with {} bytes",
                            self.config.replica_path,
                            total
                        ),
                        None => pf_debug!("replica already up to date"),
                    }
                    resync.notify_one();
                }
            }
        }
    }
}

#[cfg(test)]
mod standby_tests {
    use super::*;
    use crate::conn::ConnTracker;
    use crate::replication::{serve_backup_conn, BackupParams, DEFAULT_CHUNK_SIZE};
    use crate::server::CounterStore;
    use tokio::net::TcpListener;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn applier_swaps_on_finish() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let replica = dir.path().join("replica.db");
        fs::write(&replica, b"old").await?;

        let mut applier = ReplicaApplier::new(&replica);
        assert_eq!(applier.finish().await?, None);
        assert!(applier.append(b"stray").await.is_err());
        assert_eq!(fs::read(&replica).await?, b"old");

        applier.begin().await?;
        applier.append(b"hello ").await?;
        // replica stays intact until the transfer ends
        assert_eq!(fs::read(&replica).await?, b"old");
        applier.append(b"world").await?;
        assert_eq!(applier.finish().await?, Some(11));
        assert_eq!(fs::read(&replica).await?, b"hello world");
        assert!(!dir.path().join("replica.db.sync").exists());

        applier.begin().await?;
        applier.append(b"partial").await?;
        applier.abort().await;
        assert!(!dir.path().join("replica.db.sync").exists());
        assert_eq!(fs::read(&replica).await?, b"hello world");
        Ok(())
    }

    /// Starts a backup port over `store`; returns its address.
    async fn start_backup_server(
        store: Arc<CounterStore>,
        status: StatusFlag,
    ) -> Result<SocketAddr, IdGenError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let tracker = Arc::new(ConnTracker::new());
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let (conn_read, conn_write) = stream.into_split();
                let ctx = ConnContext::new(tracker.next_id(), peer, conn_write);
                tracker.insert(ctx.clone());
                tokio::spawn(serve_backup_conn(
                    store.clone(),
                    ctx,
                    conn_read,
                    status.clone(),
                    BackupParams {
                        chunk_size: DEFAULT_CHUNK_SIZE,
                        max_frame_len: DEFAULT_MAX_FRAME_LEN,
                    },
                ));
            }
        });
        Ok(addr)
    }

    async fn wait_in_sync(
        store: &CounterStore,
        replica: &Path,
    ) -> Result<(), IdGenError> {
        for _ in 0..200 {
            if file_md5(replica).await? == store.digest().await? {
                return Ok(());
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        Err(IdGenError::msg("replica never caught up"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn replica_follows_master() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let store =
            Arc::new(CounterStore::open(&dir.path().join("master.db"), u64::MAX).await?);
        // enough records to span several chunks
        for i in 0..100 {
            store.reserve(&format!("source-{}", i % 7), 10).await?;
        }

        let status = StatusFlag::new();
        let addr = start_backup_server(store.clone(), status.clone()).await?;
        let replica = dir.path().join("replica.db");
        let config = StandbyConfig {
            replica_path: replica.to_string_lossy().into_owned(),
            heartbeat_interval_ms: 50,
            sync_interval_ms: 30,
            reconnect_backoff_ms: 50,
            ..Default::default()
        };
        let node = StandbyNode::new(addr, config, status.clone())?;
        let runner = tokio::spawn(node.clone().run());

        wait_in_sync(&store, &replica).await?;
        assert_eq!(fs::read(&replica).await?, fs::read(store.path()).await?);
        let view = CounterStore::open_read_only(&replica).await?;
        assert_eq!(view.load("source-0").await?, store.load("source-0").await?);

        store.reserve("order", 100).await?;
        wait_in_sync(&store, &replica).await?;
        let view = CounterStore::open_read_only(&replica).await?;
        assert_eq!(view.load("order").await?, 100);

        status.mark_dead();
        time::timeout(Duration::from_secs(2), runner)
            .await
            .map_err(|_| IdGenError::msg("standby did not stop"))???;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn standby_waits_for_master() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        // reserve an address with nothing listening on it
        let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;

        let status = StatusFlag::new();
        let config = StandbyConfig {
            replica_path: dir.path().join("replica.db").to_string_lossy().into_owned(),
            reconnect_backoff_ms: 20,
            ..Default::default()
        };
        let node = StandbyNode::new(addr, config, status.clone())?;
        let runner = tokio::spawn(node.clone().run());

        time::sleep(Duration::from_millis(100)).await;
        assert!(!runner.is_finished());
        assert!(!node.replica_path().exists());

        status.mark_dead();
        time::timeout(Duration::from_secs(2), runner)
            .await
            .map_err(|_| IdGenError::msg("standby did not stop"))???;
        Ok(())
    }

    #[test]
    fn config_rejects_zero_intervals() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let config = StandbyConfig {
            sync_interval_ms: 0,
            ..Default::default()
        };
        assert!(StandbyNode::new(addr, config, StatusFlag::new()).is_err());
    }
}
