//! Master side of replication: answers a standby's heartbeats and sync
//! requests on one backup connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;

use crate::conn::{ConnContext, ConnId};
use crate::replication::{read_frame, write_frame, Frame, FrameAction, SyncRequest};
use crate::server::CounterStore;
use crate::utils::{now_secs, IdGenError, StatusFlag};

/// Default chunk size of a snapshot transfer.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Transfer parameters of a backup connection.
#[derive(Debug, Clone, Copy)]
pub struct BackupParams {
    /// Maximum file bytes carried by one data frame.
    pub chunk_size: usize,

    /// Largest frame data length accepted from the standby.
    pub max_frame_len: usize,
}

/// Serves one standby connection until it breaks, is closed through `ctx`,
/// or `status` turns DEAD. Any transport or protocol fault ends the
/// connection; the standby is expected to reconnect.
pub async fn serve_backup_conn(
    store: Arc<CounterStore>,
    ctx: Arc<ConnContext>,
    mut conn_read: OwnedReadHalf,
    status: StatusFlag,
    params: BackupParams,
) {
    pf_debug!("backup servant for {} ({}) spawned", ctx.id(), ctx.peer());
    let mut read_buf = BytesMut::with_capacity(1024);

    loop {
        tokio::select! {
            biased;

            _ = ctx.closed() => break,

            _ = status.wait_dead() => break,

            frame = read_frame(&mut read_buf, &mut conn_read, params.max_frame_len) => {
                match frame {
                    Ok(frame) => {
                        ctx.touch();
                        if let Err(e) = handle_frame(&store, &ctx, frame, params).await {
                            pf_warn!("backup connection {} aborted: {}", ctx.id(), e);
                            break;
                        }
                    }
                    Err(e) => {
                        pf_debug!("stop reading frames from {}: {}", ctx.id(), e);
                        break;
                    }
                }
            },
        }
    }

    ctx.close();
    ctx.shutdown_writer().await;
    pf_debug!("backup servant for {} ({}) exited", ctx.id(), ctx.peer());
}

/// Handles one frame received from the standby.
async fn handle_frame(
    store: &CounterStore,
    ctx: &ConnContext,
    frame: Frame,
    params: BackupParams,
) -> Result<(), IdGenError> {
    match frame.action {
        FrameAction::Ping => {
            ctx.unless_closed(async {
                let mut writer = ctx.writer().await;
                write_frame(&mut *writer, &Frame::ping(now_secs())).await?;
                writer.flush().await?;
                Ok::<(), IdGenError>(())
            })
            .await?;
        }

        FrameAction::SyncData => {
            let req = SyncRequest::decode(&frame.data)?;
            let master_md5 = store.digest().await?;
            if req.md5 == master_md5 {
                pf_debug!("replica of {} up to date (asked at {})", ctx.id(), req.ts);
            } else {
                pf_info!(
                    "replica of {} stale ({} vs {}), sending snapshot",
                    ctx.id(),
                    req.md5,
                    master_md5
                );
                let total = send_snapshot(store, ctx, params.chunk_size).await?;
                pf_info!("sent snapshot of {} bytes to {}", total, ctx.id());
            }

            ctx.unless_closed(async {
                let mut writer = ctx.writer().await;
                write_frame(&mut *writer, &Frame::empty(FrameAction::ChunkEnd)).await?;
                writer.flush().await?;
                Ok::<(), IdGenError>(())
            })
            .await?;
        }

        FrameAction::ChunkData | FrameAction::ChunkEnd => {
            return Err(IdGenError::msg(format!(
                "unexpected {:?} frame from standby",
                frame.action
            )));
        }
    }
    Ok(())
}

/// Sibling temp file path for a snapshot sent over connection `conn_id`.
fn snapshot_temp_path(store_path: &Path, conn_id: ConnId) -> PathBuf {
    let mut name = store_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "store".into());
    name.push(format!(
        ".{}.{}.{:08x}.snap",
        std::process::id(),
        conn_id,
        rand::random::<u32>()
    ));
    store_path.with_file_name(name)
}

/// Copies the live store file to a temp file, streams the copy to the
/// standby, and removes the copy whether or not streaming succeeded. Closing
/// the connection abandons the transfer even if the standby stopped reading.
async fn send_snapshot(
    store: &CounterStore,
    ctx: &ConnContext,
    chunk_size: usize,
) -> Result<u64, IdGenError> {
    let tmp_path = snapshot_temp_path(store.path(), ctx.id());
    let streamed = match store.snapshot_to(&tmp_path).await {
        Ok(_) => {
            ctx.unless_closed(async {
                let mut writer = ctx.writer().await;
                let total = stream_file(&tmp_path, &mut *writer, chunk_size).await?;
                writer.flush().await?;
                Ok::<u64, IdGenError>(total)
            })
            .await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = fs::remove_file(&tmp_path).await {
        pf_warn!("error removing snapshot '{}': {}", tmp_path.display(), e);
    }
    streamed
}

/// Fills `buf` from `file` as far as possible; returns bytes read, fewer
/// than `buf.len()` only at EOF.
async fn read_chunk(file: &mut File, buf: &mut [u8]) -> Result<usize, IdGenError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Streams the file at `path` as data frames of up to `chunk_size` bytes:
/// the first framed as SYNC_DATA (even if the file is empty), the rest as
/// CHUNK_DATA. Does not send the closing CHUNK_END. Returns bytes sent.
pub(crate) async fn stream_file<W>(
    path: &Path,
    conn_write: &mut W,
    chunk_size: usize,
) -> Result<u64, IdGenError>
where
    W: AsyncWrite + Unpin,
{
    if chunk_size == 0 {
        return Err(IdGenError::msg("invalid chunk size 0"));
    }

    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; chunk_size];
    let mut total: u64 = 0;
    let mut first = true;

    loop {
        let n = read_chunk(&mut file, &mut buf).await?;
        if n == 0 && !first {
            break;
        }
        let action = if first {
            FrameAction::SyncData
        } else {
            FrameAction::ChunkData
        };
        write_frame(conn_write, &Frame::new(action, buf[..n].to_vec())).await?;
        pf_trace!("sent {:?} chunk of {} bytes", action, n);
        total += n as u64;
        first = false;
        if n < chunk_size {
            break;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod backup_tests {
    use super::*;
    use crate::replication::DEFAULT_MAX_FRAME_LEN;

    async fn frames_of(wire: &[u8]) -> Result<Vec<Frame>, IdGenError> {
        let mut reader = wire;
        let mut read_buf = BytesMut::new();
        let mut frames = Vec::new();
        while !reader.is_empty() || !read_buf.is_empty() {
            frames.push(
                read_frame(&mut read_buf, &mut reader, DEFAULT_MAX_FRAME_LEN).await?,
            );
        }
        Ok(frames)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn stream_2500_bytes() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("live.db");
        let content: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &content).await?;

        let mut wire: Vec<u8> = Vec::new();
        let total = stream_file(&path, &mut wire, 1024).await?;
        assert_eq!(total, 2500);

        let frames = frames_of(&wire).await?;
        let actions: Vec<FrameAction> = frames.iter().map(|f| f.action).collect();
        let sizes: Vec<usize> = frames.iter().map(|f| f.data.len()).collect();
        assert_eq!(
            actions,
            vec![
                FrameAction::SyncData,
                FrameAction::ChunkData,
                FrameAction::ChunkData
            ]
        );
        assert_eq!(sizes, vec![1024, 1024, 452]);
        let rebuilt: Vec<u8> = frames.iter().flat_map(|f| f.data.to_vec()).collect();
        assert_eq!(rebuilt, content);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn stream_exact_multiple_and_empty() -> Result<(), IdGenError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("live.db");

        fs::write(&path, vec![1u8; 2048]).await?;
        let mut wire: Vec<u8> = Vec::new();
        assert_eq!(stream_file(&path, &mut wire, 1024).await?, 2048);
        let sizes: Vec<usize> =
            frames_of(&wire).await?.iter().map(|f| f.data.len()).collect();
        assert_eq!(sizes, vec![1024, 1024]);

        fs::write(&path, b"").await?;
        let mut wire: Vec<u8> = Vec::new();
        assert_eq!(stream_file(&path, &mut wire, 1024).await?, 0);
        let frames = frames_of(&wire).await?;
        assert_eq!(frames, vec![Frame::empty(FrameAction::SyncData)]);
        Ok(())
    }

    #[test]
    fn temp_path_is_sibling() {
        let store_path = Path::new("/var/lib/idgen/counter.db");
        let a = snapshot_temp_path(store_path, 7);
        assert_eq!(a.parent(), store_path.parent());
        let name = a.file_name().and_then(|n| n.to_str()).unwrap_or("");
        assert!(name.starts_with("counter.db."));
        assert!(name.ends_with(".snap"));
        assert!(name.contains(&format!(".{}.7.", std::process::id())));
    }
}
