//! Allocation service exposed over RPC, wrapping the counter store.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::rpc::{decode_payload, encode_payload, RpcService};
use crate::server::CounterStore;
use crate::utils::IdGenError;

/// Method name of the read-only counter lookup.
pub const METHOD_LOAD_CURRENT_ID: &str = "AllocService.LoadCurrentIdFromDb";

/// Method name of the bucket reservation.
pub const METHOD_INCR_CURRENT_ID: &str = "AllocService.IncrSourceCurrentId";

/// Method name of the liveness probe.
pub const METHOD_KEEP_ALIVE: &str = "AllocService.KeepAlive";

/// Arguments of `LoadCurrentIdFromDb`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LoadCurrentIdArgs {
    pub source: String,
    pub bucket_step: i64,
}

/// Arguments of `IncrSourceCurrentId`. `current_id` is the caller's view of
/// the counter and purely advisory; the store's value is authoritative.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct IncrCurrentIdArgs {
    pub source: String,
    pub current_id: i64,
    pub bucket_step: i64,
}

/// Result of `IncrSourceCurrentId`: the caller may hand out
/// `[result_current_id, new_db_current_id)`.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct IncrCurrentIdReply {
    pub result_current_id: i64,
    pub new_db_current_id: i64,
}

/// The allocation service.
#[derive(Debug)]
pub struct AllocService {
    store: Arc<CounterStore>,
}

impl AllocService {
    pub fn new(store: Arc<CounterStore>) -> Self {
        AllocService { store }
    }

    /// Returns the persisted counter of a source without changing it.
    pub async fn load_current_id_from_db(
        &self,
        args: LoadCurrentIdArgs,
    ) -> Result<i64, IdGenError> {
        if args.source.is_empty() {
            return Err(IdGenError::msg("empty source name"));
        }
        self.store.load(&args.source).await
    }

    /// Reserves a bucket of `bucket_step` IDs for a source.
    pub async fn incr_source_current_id(
        &self,
        args: IncrCurrentIdArgs,
    ) -> Result<IncrCurrentIdReply, IdGenError> {
        let (result_current_id, new_db_current_id) =
            self.store.reserve(&args.source, args.bucket_step).await?;
        if args.current_id != result_current_id {
            pf_debug!(
                "source '{}' caller thinks {} while store has {}",
                args.source,
                args.current_id,
                result_current_id
            );
        }
        Ok(IncrCurrentIdReply {
            result_current_id,
            new_db_current_id,
        })
    }

    /// Liveness probe; no side effect.
    pub fn keep_alive(&self, n: i64) -> Result<i64, IdGenError> {
        n.checked_add(1)
            .ok_or_else(|| IdGenError::msg("keepalive counter overflow"))
    }
}

#[async_trait]
impl RpcService for AllocService {
    async fn dispatch(
        &self,
        method: &str,
        args: &[u8],
    ) -> Result<Bytes, IdGenError> {
        match method {
            METHOD_LOAD_CURRENT_ID => {
                let args: LoadCurrentIdArgs = decode_payload(args)?;
                encode_payload(&self.load_current_id_from_db(args).await?)
            }
            METHOD_INCR_CURRENT_ID => {
                let args: IncrCurrentIdArgs = decode_payload(args)?;
                encode_payload(&self.incr_source_current_id(args).await?)
            }
            METHOD_KEEP_ALIVE => {
                let n: i64 = decode_payload(args)?;
                encode_payload(&self.keep_alive(n)?)
            }
            _ => Err(IdGenError::msg(format!("unknown method '{}'", method))),
        }
    }
}
