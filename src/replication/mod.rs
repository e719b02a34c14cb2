//! Master to standby replication of the counter store file over a small
//! framed protocol on the master's backup port.

mod backup;
mod frame;
mod standby;

pub use backup::{serve_backup_conn, BackupParams, DEFAULT_CHUNK_SIZE};
pub use frame::{
    read_frame, write_frame, Frame, FrameAction, SyncRequest, DEFAULT_MAX_FRAME_LEN,
    FRAME_HEADER_LEN,
};
pub use standby::{StandbyConfig, StandbyNode};
