//! RPC request/response envelopes.

use bytes::Bytes;
use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::utils::IdGenError;

/// Default upper bound of an encoded request or response envelope.
pub const DEFAULT_MAX_MSG_LEN: usize = 1 << 20;

/// Call sequence number type, unique per connection.
pub type CallSeq = u64;

/// Call envelope sent by a client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Sequence number the response will carry back.
    pub seq: CallSeq,

    /// Full method name, e.g. `"AllocService.KeepAlive"`.
    pub method: String,

    /// Encoded arguments.
    pub args: Bytes,
}

/// Response envelope sent back by a server.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Sequence number of the request being answered.
    pub seq: CallSeq,

    /// Error text if the call failed; `result` is then empty.
    pub error: Option<String>,

    /// Encoded result value.
    pub result: Bytes,
}

impl RpcResponse {
    pub fn ok(seq: CallSeq, result: Bytes) -> Self {
        RpcResponse {
            seq,
            error: None,
            result,
        }
    }

    pub fn err(seq: CallSeq, error: impl ToString) -> Self {
        RpcResponse {
            seq,
            error: Some(error.to_string()),
            result: Bytes::new(),
        }
    }
}

/// Encodes an argument or result value.
pub(crate) fn encode_payload<T: Serialize>(
    value: &T,
) -> Result<Bytes, IdGenError> {
    Ok(Bytes::from(encode_to_vec(value)?))
}

/// Decodes an argument or result value.
pub(crate) fn decode_payload<T: DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, IdGenError> {
    Ok(decode_from_slice(bytes)?)
}
