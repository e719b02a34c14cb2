//! Centrally coordinated auto-increment ID allocation: a master owning a
//! durable per-source counter store and serving bucket reservations over a
//! pipelined RPC codec, clients caching reserved buckets, and a standby kept
//! in sync by snapshot replication of the store file.

#[macro_use]
mod utils;

mod client;
mod conn;
mod replication;
mod rpc;
mod server;

// Helper utilities
pub use utils::{
    file_md5, logger_init, now_formatted, now_secs, supervise, IdGenError,
    ServerStatus, StatusFlag, ME, TIME_FORMAT,
};

// Connection lifecycle
pub use conn::{ConnContext, ConnId, ConnTracker, MIN_UNACTIVE_SECS};

// Wire codec
pub use rpc::{
    serve_rpc_conn, CallSeq, RpcClient, RpcRequest, RpcResponse, RpcService,
    DEFAULT_MAX_MSG_LEN,
};

// Master side
pub use server::{
    AllocService, CounterStore, IncrCurrentIdArgs, IncrCurrentIdReply,
    LoadCurrentIdArgs, MasterConfig, MasterServer, ServerKind,
    DEFAULT_COMPACT_THRESHOLD, METHOD_INCR_CURRENT_ID, METHOD_KEEP_ALIVE,
    METHOD_LOAD_CURRENT_ID,
};

// Replication
pub use replication::{
    read_frame, serve_backup_conn, write_frame, BackupParams, Frame, FrameAction,
    StandbyConfig, StandbyNode, SyncRequest, DEFAULT_CHUNK_SIZE,
    DEFAULT_MAX_FRAME_LEN, FRAME_HEADER_LEN,
};

// Client side
pub use client::{AllocClient, Bucket, ClientConfig};
