//! Wire codec for the allocation RPC: length-prefixed request/response
//! envelopes over one long-lived TCP connection, with pipelined calls
//! matched by sequence number.

mod client;
mod codec;
mod server;

pub use client::RpcClient;
pub use codec::{CallSeq, RpcRequest, RpcResponse, DEFAULT_MAX_MSG_LEN};
pub use server::{serve_rpc_conn, RpcService};

pub(crate) use codec::{decode_payload, encode_payload};
