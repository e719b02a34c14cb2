//! Master-side modules: the durable counter store, the allocation service
//! on top of it, and the master node serving both ports.

mod master;
mod service;
mod storage;

pub use master::{MasterConfig, MasterServer, ServerKind, DEFAULT_COMPACT_THRESHOLD};
pub use service::{
    AllocService, IncrCurrentIdArgs, IncrCurrentIdReply, LoadCurrentIdArgs,
    METHOD_INCR_CURRENT_ID, METHOD_KEEP_ALIVE, METHOD_LOAD_CURRENT_ID,
};
pub use storage::CounterStore;
