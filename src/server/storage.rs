//! Durable counter store: an embedded single-file key-value store mapping
//! each allocation source to its current counter value.
//!
//! The backing file is an append-only record log. Each record is an 8-byte
//! big-endian length header followed by an rmp-serde encoded
//! `CounterRecord`; the last record of a source wins on replay. When the log
//! grows past the compaction threshold it is rewritten to one record per
//! source and atomically renamed over the live file.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::utils::{file_md5, IdGenError};

/// Length of a record's length header.
const REC_HEADER: usize = 8;

/// One persisted counter value.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
struct CounterRecord {
    source: String,
    current_id: i64,
}

/// Encodes a record together with its length header.
fn encode_record(record: &CounterRecord) -> Result<Vec<u8>, IdGenError> {
    let rec_bytes = encode_to_vec(record)?;
    let mut buf = Vec::with_capacity(REC_HEADER + rec_bytes.len());
    buf.extend_from_slice(&(rec_bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(&rec_bytes);
    Ok(buf)
}

/// Replays a record log. Returns the counters map and the end offset of the
/// last intact record; anything past that offset is a torn tail.
fn replay_records(
    data: &[u8],
) -> (HashMap<String, i64>, usize) {
    let mut counters = HashMap::new();
    let mut offset = 0;
    while offset + REC_HEADER <= data.len() {
        let mut len_bytes = [0u8; REC_HEADER];
        len_bytes.copy_from_slice(&data[offset..offset + REC_HEADER]);
        let rec_len = match usize::try_from(u64::from_be_bytes(len_bytes)) {
            Ok(len) => len,
            Err(_) => break,
        };
        let rec_end = match (offset + REC_HEADER).checked_add(rec_len) {
            Some(end) if end <= data.len() => end,
            _ => break,
        };
        match decode_from_slice::<CounterRecord>(&data[offset + REC_HEADER..rec_end])
        {
            Ok(record) => {
                counters.insert(record.source, record.current_id);
            }
            Err(_) => break,
        }
        offset = rec_end;
    }
    (counters, offset)
}

/// Mutable state of the store, all guarded by one lock.
#[derive(Debug)]
struct StoreInner {
    /// Open backing file positioned at EOF; `None` for read-only stores.
    backer: Option<File>,

    /// Map from source -> current counter value.
    counters: HashMap<String, i64>,

    /// Current length of the backing file.
    file_size: u64,

    /// Set once the backing file may hold bytes the store cannot account
    /// for; every later reservation is refused with this error.
    failure: Option<IdGenError>,
}

impl StoreInner {
    /// Stops all further writes. Counters already in memory stay readable.
    fn mark_failed(&mut self, reason: String) {
        pf_error!("counter store failed: {}", reason);
        self.backer = None;
        self.failure = Some(IdGenError::msg(format!(
            "counter store failed: {}",
            reason
        )));
    }
}

/// The counter store. All mutating operations run under a single store-wide
/// lock, which linearizes reservations per source; reservations are brief
/// (one appended record plus a data sync).
#[derive(Debug)]
pub struct CounterStore {
    /// Path of the backing file.
    path: PathBuf,

    /// Log size beyond which a reservation triggers compaction.
    compact_threshold: u64,

    inner: Mutex<StoreInner>,
}

impl CounterStore {
    /// Opens (creating if missing) the store backed by the file at `path`
    /// and replays it. A torn trailing record is truncated away.
    pub async fn open(
        path: &Path,
        compact_threshold: u64,
    ) -> Result<Self, IdGenError> {
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!("created counter store file '{}'", path.display());
        }

        let data = fs::read(path).await?;
        let (counters, valid_end) = replay_records(&data);
        let mut backer =
            OpenOptions::new().read(true).write(true).open(path).await?;
        if valid_end < data.len() {
            pf_warn!(
                "counter store '{}' has a torn tail of {} bytes, truncating",
                path.display(),
                data.len() - valid_end
            );
            backer.set_len(valid_end as u64).await?;
            backer.sync_all().await?;
        }
        backer.seek(SeekFrom::End(0)).await?; // seek to EOF

        pf_info!(
            "opened counter store '{}' with {} sources",
            path.display(),
            counters.len()
        );
        Ok(CounterStore {
            path: path.into(),
            compact_threshold,
            inner: Mutex::new(StoreInner {
                backer: Some(backer),
                counters,
                file_size: valid_end as u64,
                failure: None,
            }),
        })
    }

    /// Opens the store at `path` for reading only, e.g., to inspect a
    /// standby's replica file. The file is never written.
    pub async fn open_read_only(path: &Path) -> Result<Self, IdGenError> {
        let data = fs::read(path).await?;
        let (counters, valid_end) = replay_records(&data);
        Ok(CounterStore {
            path: path.into(),
            compact_threshold: u64::MAX,
            inner: Mutex::new(StoreInner {
                backer: None,
                counters,
                file_size: valid_end as u64,
                failure: None,
            }),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reserves `bucket_step` IDs for `source`. Returns `(start, new)` where
    /// `start` is the counter value before the reservation (0 for a source
    /// never seen) and `new == start + bucket_step` is the value persisted;
    /// the caller owns the half-open range `[start, new)`.
    pub async fn reserve(
        &self,
        source: &str,
        bucket_step: i64,
    ) -> Result<(i64, i64), IdGenError> {
        if source.is_empty() {
            return Err(IdGenError::msg("empty source name"));
        }
        if bucket_step <= 0 {
            return Err(IdGenError::msg(format!(
                "invalid bucket step {}",
                bucket_step
            )));
        }

        let mut inner = self.inner.lock().await;
        if let Some(failure) = &inner.failure {
            return Err(failure.clone());
        }
        let start = inner.counters.get(source).copied().unwrap_or(0);
        let new = start.checked_add(bucket_step).ok_or_else(|| {
            IdGenError::msg(format!(
                "counter of '{}' overflows at {} + {}",
                source, start, bucket_step
            ))
        })?;

        let rec_bytes = encode_record(&CounterRecord {
            source: source.into(),
            current_id: new,
        })?;
        let old_size = inner.file_size;
        let backer = inner
            .backer
            .as_mut()
            .ok_or_else(|| IdGenError::msg("counter store is read-only"))?;
        if let Err(e) = Self::append_synced(backer, &rec_bytes).await {
            pf_error!("error appending to counter store: {}", e);
            // drop the partially written record; if that is impossible,
            // appending after it would hide later records on replay
            let rolled_back = match backer.set_len(old_size).await {
                Ok(()) => backer.seek(SeekFrom::End(0)).await.map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = rolled_back {
                inner.mark_failed(format!(
                    "rollback to {} bytes after '{}' failed: {}",
                    old_size, e, err
                ));
            }
            return Err(e);
        }

        inner.file_size = old_size + rec_bytes.len() as u64;
        inner.counters.insert(source.into(), new);

        if inner.file_size > self.compact_threshold {
            if let Err(e) = self.compact(&mut inner).await {
                // live file is still intact; compaction retries next time
                pf_warn!("error compacting counter store: {}", e);
            }
        }
        Ok((start, new))
    }

    /// Reads the current counter value of `source` without changing it;
    /// 0 if the source has never been reserved.
    pub async fn load(&self, source: &str) -> Result<i64, IdGenError> {
        let inner = self.inner.lock().await;
        Ok(inner.counters.get(source).copied().unwrap_or(0))
    }

    /// Number of sources with a counter.
    pub async fn num_sources(&self) -> usize {
        self.inner.lock().await.counters.len()
    }

    /// Hex MD5 digest of the backing file, taken under the store lock so
    /// that no reservation is half-written into it.
    pub async fn digest(&self) -> Result<String, IdGenError> {
        let _inner = self.inner.lock().await;
        file_md5(&self.path).await
    }

    /// Copies the backing file to `dest` under the store lock. Returns the
    /// number of bytes copied.
    pub async fn snapshot_to(&self, dest: &Path) -> Result<u64, IdGenError> {
        let _inner = self.inner.lock().await;
        Ok(fs::copy(&self.path, dest).await?)
    }

    async fn append_synced(
        backer: &mut File,
        bytes: &[u8],
    ) -> Result<(), IdGenError> {
        backer.write_all(bytes).await?;
        backer.flush().await?;
        backer.sync_data().await?;
        Ok(())
    }

    /// Rewrites the log to one record per source in a sibling file, then
    /// renames it over the live file. The new file is opened for writing
    /// before the rename, so once the rename succeeds nothing can fail and
    /// the store never keeps appending to the unlinked old file.
    async fn compact(&self, inner: &mut StoreInner) -> Result<(), IdGenError> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".compact");
        let tmp_path = PathBuf::from(tmp_name);

        let mut compacted = Vec::new();
        for (source, &current_id) in inner.counters.iter() {
            compacted.extend(encode_record(&CounterRecord {
                source: source.clone(),
                current_id,
            })?);
        }

        let prepared = async {
            let mut backer = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            backer.write_all(&compacted).await?;
            backer.flush().await?;
            backer.sync_all().await?;
            backer.seek(SeekFrom::End(0)).await?;
            fs::rename(&tmp_path, &self.path).await?;
            Ok::<File, IdGenError>(backer)
        }
        .await;
        let backer = match prepared {
            Ok(backer) => backer,
            Err(e) => {
                // live file untouched
                let _ = fs::remove_file(&tmp_path).await;
                return Err(e);
            }
        };
        pf_info!(
            "compacted counter store from {} to {} bytes",
            inner.file_size,
            compacted.len()
        );
        inner.backer = Some(backer);
        inner.file_size = compacted.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn reserve_and_load() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let store = CounterStore::open(&dir.path().join("c.db"), u64::MAX).await?;
        assert_eq!(store.load("order").await?, 0);
        assert_eq!(store.reserve("order", 100).await?, (0, 100));
        assert_eq!(store.reserve("order", 50).await?, (100, 150));
        assert_eq!(store.reserve("user", 10).await?, (0, 10));
        assert_eq!(store.load("order").await?, 150);
        assert_eq!(store.load("user").await?, 10);
        assert_eq!(store.num_sources().await, 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn reserve_invalid_args() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let store = CounterStore::open(&dir.path().join("c.db"), u64::MAX).await?;
        assert!(store.reserve("", 10).await.is_err());
        assert!(store.reserve("order", 0).await.is_err());
        assert!(store.reserve("order", -5).await.is_err());
        store.reserve("order", i64::MAX - 1).await?;
        assert!(store.reserve("order", 2).await.is_err());
        assert_eq!(store.load("order").await?, i64::MAX - 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn survives_reopen() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("c.db");
        {
            let store = CounterStore::open(&path, u64::MAX).await?;
            store.reserve("order", 100).await?;
            store.reserve("order", 100).await?;
            store.reserve("user", 7).await?;
        }
        let store = CounterStore::open(&path, u64::MAX).await?;
        assert_eq!(store.load("order").await?, 200);
        assert_eq!(store.load("user").await?, 7);
        assert_eq!(store.reserve("order", 1).await?, (200, 201));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn torn_tail_truncated() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("c.db");
        {
            let store = CounterStore::open(&path, u64::MAX).await?;
            store.reserve("order", 100).await?;
        }
        let intact_len = fs::metadata(&path).await?.len();
        // half a record: a length header promising more bytes than exist
        let mut file = OpenOptions::new().append(true).open(&path).await?;
        file.write_all(&64u64.to_be_bytes()).await?;
        file.write_all(b"garbage").await?;
        file.sync_all().await?;
        drop(file);

        let store = CounterStore::open(&path, u64::MAX).await?;
        assert_eq!(fs::metadata(&path).await?.len(), intact_len);
        assert_eq!(store.load("order").await?, 100);
        assert_eq!(store.reserve("order", 1).await?, (100, 101));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn compaction_keeps_counters() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("c.db");
        let store = CounterStore::open(&path, 256).await?;
        for _ in 0..100 {
            store.reserve("order", 3).await?;
            store.reserve("user", 1).await?;
        }
        assert!(fs::metadata(&path).await?.len() <= 256 + 64);
        assert_eq!(store.load("order").await?, 300);
        drop(store);
        let store = CounterStore::open(&path, 256).await?;
        assert_eq!(store.load("order").await?, 300);
        assert_eq!(store.load("user").await?, 100);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn reserves_after_compaction_persist() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("c.db");
        let store = CounterStore::open(&path, 256).await?;

        let mut last_len = 0;
        let mut compacted = false;
        for _ in 0..1000 {
            store.reserve("order", 1).await?;
            let len = fs::metadata(&path).await?.len();
            if len < last_len {
                compacted = true;
                break;
            }
            last_len = len;
        }
        assert!(compacted);

        // the next record must land in the renamed file, not the old inode
        let compacted_len = fs::metadata(&path).await?.len();
        store.reserve("order", 1).await?;
        assert!(fs::metadata(&path).await?.len() > compacted_len);
        let view = CounterStore::open_read_only(&path).await?;
        assert_eq!(view.load("order").await?, store.load("order").await?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn failed_compaction_keeps_live_file() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("c.db");
        // a directory squatting on the compaction file makes it fail
        let squatter = dir.path().join("c.db.compact");
        fs::create_dir(&squatter).await?;

        let store = CounterStore::open(&path, 64).await?;
        for _ in 0..20 {
            store.reserve("order", 1).await?;
        }
        assert!(fs::metadata(&path).await?.len() > 64);
        assert!(fs::metadata(&squatter).await?.is_dir());
        assert_eq!(store.load("order").await?, 20);
        drop(store);

        let store = CounterStore::open(&path, u64::MAX).await?;
        assert_eq!(store.load("order").await?, 20);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn failed_rollback_stops_reserves() -> Result<(), IdGenError> {
        // writes to /dev/full fail with ENOSPC, and it cannot be truncated
        let backer = OpenOptions::new().write(true).open("/dev/full").await?;
        let mut counters = HashMap::new();
        counters.insert("order".to_string(), 100);
        let store = CounterStore {
            path: "/dev/full".into(),
            compact_threshold: u64::MAX,
            inner: Mutex::new(StoreInner {
                backer: Some(backer),
                counters,
                file_size: 0,
                failure: None,
            }),
        };

        let err = store.reserve("order", 10).await.unwrap_err();
        assert!(!err.to_string().contains("counter store failed"));
        // no append after unaccounted bytes, for any source
        let err = store.reserve("user", 1).await.unwrap_err();
        assert!(err.to_string().contains("counter store failed"));
        let err = store.reserve("order", 1).await.unwrap_err();
        assert!(err.to_string().contains("counter store failed"));
        assert_eq!(store.load("order").await?, 100);
        assert_eq!(store.load("user").await?, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reserves_disjoint() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let store =
            Arc::new(CounterStore::open(&dir.path().join("c.db"), 4096).await?);

        let mut handles = Vec::new();
        for t in 0..8i64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut ranges = Vec::new();
                for i in 0..25i64 {
                    let step = 1 + (t * 7 + i) % 13;
                    let (start, end) = store.reserve("order", step).await?;
                    assert_eq!(end - start, step);
                    ranges.push((start, end));
                }
                Ok::<_, IdGenError>(ranges)
            }));
        }
        let mut ranges = Vec::new();
        for handle in handles {
            ranges.extend(handle.await??);
        }

        // pairwise disjoint and covering a contiguous prefix [0, N)
        ranges.sort();
        let mut expect_start = 0;
        for (start, end) in &ranges {
            assert_eq!(*start, expect_start);
            expect_start = *end;
        }
        assert_eq!(store.load("order").await?, expect_start);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn two_clients_scenario() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let store =
            Arc::new(CounterStore::open(&dir.path().join("c.db"), u64::MAX).await?);
        let (store_a, store_b) = (store.clone(), store.clone());
        let a = tokio::spawn(async move { store_a.reserve("order", 100).await });
        let b = tokio::spawn(async move { store_b.reserve("order", 50).await });
        let (ra, rb) = (a.await??, b.await??);
        assert_eq!(ra.1 - ra.0, 100);
        assert_eq!(rb.1 - rb.0, 50);
        assert!(ra.1 <= rb.0 || rb.1 <= ra.0);
        assert_eq!(store.load("order").await?, 150);
        assert_eq!(store.load("order").await?, ra.1.max(rb.1));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn digest_snapshot_read_only() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let store = CounterStore::open(&dir.path().join("c.db"), u64::MAX).await?;
        store.reserve("order", 42).await?;
        let digest = store.digest().await?;
        assert_eq!(digest.len(), 32);

        let snap = dir.path().join("snap.db");
        let copied = store.snapshot_to(&snap).await?;
        assert_eq!(copied, fs::metadata(store.path()).await?.len());
        assert_eq!(file_md5(&snap).await?, digest);

        let replica = CounterStore::open_read_only(&snap).await?;
        assert_eq!(replica.load("order").await?, 42);
        assert!(replica.reserve("order", 1).await.is_err());
        assert_eq!(file_md5(&snap).await?, digest);
        Ok(())
    }
}
