//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod clock;
mod digest;
mod error;
mod safetcp;
mod status;
mod supervise;

pub use clock::{now_formatted, now_secs, TIME_FORMAT};
pub use digest::file_md5;
pub use error::IdGenError;
pub use print::{logger_init, ME};
pub use status::{ServerStatus, StatusFlag};
pub use supervise::supervise;

pub(crate) use safetcp::{
    safe_tcp_read, tcp_bind_with_retry, tcp_connect_with_retry, tcp_write_obj,
};
