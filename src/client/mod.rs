//! Client-side modules: bucket caching on top of the allocation RPC.

mod alloc;
mod bucket;

pub use alloc::{AllocClient, ClientConfig};
pub use bucket::Bucket;
