//! Server side of the RPC wire codec: per-connection request loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;

use crate::conn::ConnContext;
use crate::rpc::{RpcRequest, RpcResponse};
use crate::utils::{safe_tcp_read, tcp_write_obj, IdGenError, StatusFlag};

/// A service reachable over the RPC codec.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Handles one call of `method` with encoded `args`, returning the
    /// encoded result. Errors are reported back to the caller as text.
    async fn dispatch(
        &self,
        method: &str,
        args: &[u8],
    ) -> Result<Bytes, IdGenError>;
}

/// Serves RPC requests arriving on `conn_read` until the peer goes away, the
/// connection is closed through `ctx`, or `status` turns DEAD. A request
/// envelope longer than `max_msg_len` ends the connection. Each request
/// is handled in its own task so that pipelined calls do not wait on each
/// other; replies go out through the context's writer in completion order.
pub async fn serve_rpc_conn<S: RpcService>(
    service: Arc<S>,
    ctx: Arc<ConnContext>,
    mut conn_read: OwnedReadHalf,
    status: StatusFlag,
    max_msg_len: usize,
) {
    pf_debug!("rpc servant for {} ({}) spawned", ctx.id(), ctx.peer());
    let mut read_buf = BytesMut::with_capacity(8 + 1024);

    loop {
        tokio::select! {
            biased;

            _ = ctx.closed() => break,

            _ = status.wait_dead() => break,

            req = safe_tcp_read::<RpcRequest, _>(
                &mut read_buf, &mut conn_read, max_msg_len
            ) => {
                match req {
                    Ok(req) => {
                        ctx.touch();
                        tokio::spawn(handle_call(service.clone(), ctx.clone(), req));
                    }
                    Err(e) => {
                        pf_debug!("stop reading requests from {}: {}", ctx.id(), e);
                        break;
                    }
                }
            },
        }
    }

    ctx.close();
    ctx.shutdown_writer().await;
    pf_debug!("rpc servant for {} ({}) exited", ctx.id(), ctx.peer());
}

/// Runs one call and writes its response. A panicking service method is
/// turned into an error response; the connection keeps serving.
async fn handle_call<S: RpcService>(
    service: Arc<S>,
    ctx: Arc<ConnContext>,
    req: RpcRequest,
) {
    let outcome = AssertUnwindSafe(service.dispatch(&req.method, &req.args))
        .catch_unwind()
        .await;
    let resp = match outcome {
        Ok(Ok(result)) => RpcResponse::ok(req.seq, result),
        Ok(Err(e)) => {
            pf_debug!("call {} #{} failed: {}", req.method, req.seq, e);
            RpcResponse::err(req.seq, e)
        }
        Err(panic) => {
            let what = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            pf_error!("call {} #{} panicked: {}", req.method, req.seq, what);
            RpcResponse::err(req.seq, format!("internal error: {}", what))
        }
    };

    let written = ctx
        .unless_closed(async {
            let mut writer = ctx.writer().await;
            tcp_write_obj(&mut *writer, &resp).await?;
            writer.flush().await?;
            Ok::<(), IdGenError>(())
        })
        .await;
    if let Err(e) = written {
        pf_warn!("error replying to {}: {}", ctx.id(), e);
        ctx.close();
    }
}
