//! Client side of the RPC wire codec with pipelined calls.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::conn::ConnContext;
use crate::rpc::{
    decode_payload, encode_payload, CallSeq, RpcRequest, RpcResponse,
    DEFAULT_MAX_MSG_LEN,
};
use crate::utils::{safe_tcp_read, tcp_connect_with_retry, tcp_write_obj, IdGenError};

/// Outcome delivered to a waiting caller.
type CallResult = Result<Bytes, IdGenError>;

/// Calls awaiting a response, keyed by sequence number. `None` once the
/// connection has shut down: no new call may register after that.
type PendingCalls = Arc<Mutex<Option<HashMap<CallSeq, oneshot::Sender<CallResult>>>>>;

fn lock_pending(
    pending: &PendingCalls,
) -> std::sync::MutexGuard<'_, Option<HashMap<CallSeq, oneshot::Sender<CallResult>>>>
{
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fails every pending call with the connection-shut-down error and refuses
/// further calls.
fn shut_down_pending(pending: &PendingCalls) {
    if let Some(calls) = lock_pending(pending).take() {
        for (_, tx_result) in calls {
            let _ = tx_result.send(Err(IdGenError::conn_shutdown()));
        }
    }
}

/// RPC client over one TCP connection. Any number of calls may be in flight
/// at once; responses are matched back to callers by sequence number. Once
/// the stream fails or is closed, every pending and future call fails with
/// `IdGenError::conn_shutdown()`.
pub struct RpcClient {
    /// Context of the underlying connection; owns the write half.
    ctx: Arc<ConnContext>,

    /// Next call sequence number.
    next_seq: AtomicU64,

    /// Calls awaiting a response.
    pending: PendingCalls,

    /// Join handle of the response reader task.
    reader_handle: JoinHandle<()>,
}

impl RpcClient {
    /// Dials `addr` once and builds a client on the new connection.
    pub async fn connect(addr: SocketAddr) -> Result<Self, IdGenError> {
        let stream = tcp_connect_with_retry(addr, 0).await?;
        pf_debug!("rpc connection to {} established", addr);
        Self::new(stream)
    }

    /// Builds a client on an already connected stream.
    pub fn new(stream: TcpStream) -> Result<Self, IdGenError> {
        let peer = stream.peer_addr()?;
        let (conn_read, conn_write) = stream.into_split();
        let ctx = ConnContext::new(0, peer, conn_write);
        let pending: PendingCalls = Arc::new(Mutex::new(Some(HashMap::new())));

        let reader_handle = tokio::spawn(Self::reader_thread(
            ctx.clone(),
            conn_read,
            pending.clone(),
        ));

        Ok(RpcClient {
            ctx,
            next_seq: AtomicU64::new(0),
            pending,
            reader_handle,
        })
    }

    /// Remote address of the connection.
    pub fn peer(&self) -> SocketAddr {
        self.ctx.peer()
    }

    /// True once the connection can no longer carry calls.
    pub fn is_shut_down(&self) -> bool {
        lock_pending(&self.pending).is_none()
    }

    /// Calls `method` with `args` and waits for its decoded result.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, IdGenError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let req = RpcRequest {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            method: method.into(),
            args: encode_payload(args)?,
        };

        let (tx_result, rx_result) = oneshot::channel();
        match lock_pending(&self.pending).as_mut() {
            Some(calls) => {
                calls.insert(req.seq, tx_result);
            }
            None => return Err(IdGenError::conn_shutdown()),
        }

        let written = self
            .ctx
            .unless_closed(async {
                let mut writer = self.ctx.writer().await;
                tcp_write_obj(&mut *writer, &req).await?;
                writer.flush().await?;
                Ok::<(), IdGenError>(())
            })
            .await;
        if let Err(e) = written {
            pf_warn!("error sending call {} #{}: {}", method, req.seq, e);
            self.ctx.close();
            shut_down_pending(&self.pending);
            return Err(IdGenError::conn_shutdown());
        }

        // sender dropped without a value only if the reader went away
        let result = rx_result
            .await
            .map_err(|_| IdGenError::conn_shutdown())??;
        decode_payload(&result)
    }

    /// Closes the connection gracefully: flushes outstanding writes, releases
    /// the stream, and fails whatever calls are still pending.
    pub async fn close(&self) {
        self.ctx.close();
        self.ctx.shutdown_writer().await;
        shut_down_pending(&self.pending);
        self.reader_handle.abort();
    }

    /// Response reader task function.
    async fn reader_thread(
        ctx: Arc<ConnContext>,
        mut conn_read: OwnedReadHalf,
        pending: PendingCalls,
    ) {
        pf_debug!("rpc reader for {} spawned", ctx.peer());
        let mut read_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            let resp = tokio::select! {
                resp = safe_tcp_read::<RpcResponse, _>(
                    &mut read_buf, &mut conn_read, DEFAULT_MAX_MSG_LEN
                ) => resp,
                _ = ctx.closed() => break,
            };
            match resp {
                Ok(resp) => {
                    ctx.touch();
                    let tx_result = lock_pending(&pending)
                        .as_mut()
                        .and_then(|calls| calls.remove(&resp.seq));
                    match tx_result {
                        Some(tx_result) => {
                            let result = match resp.error {
                                Some(error) => Err(IdGenError::msg(error)),
                                None => Ok(resp.result),
                            };
                            let _ = tx_result.send(result);
                        }
                        None => {
                            pf_warn!("response for unknown call #{}", resp.seq);
                        }
                    }
                }
                Err(e) => {
                    pf_warn!("rpc connection to {} broken: {}", ctx.peer(), e);
                    break;
                }
            }
        }

        ctx.close();
        shut_down_pending(&pending);
        pf_debug!("rpc reader for {} exited", ctx.peer());
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.ctx.close();
        self.reader_handle.abort();
    }
}
