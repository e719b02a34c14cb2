//! Safe TCP bind/connect/read/write helper functions.

use std::marker::Unpin;
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::IdGenError;

/// Length of the big-endian object length header.
const LEN_HEADER: usize = 8;

/// Receives an object of type `T` from TCP readable connection `conn_read`,
/// using `read_buf` as buffer storage for partial reads. Objects encoded
/// longer than `max_obj_len` bytes are rejected before any buffer space is
/// reserved for them. Returns:
///   - `Ok(obj)` if successful; upon returning, bytes of the object have been
///     consumed from the read buffer
///   - `Err(err)` if any unexpected error occurs, including peer EOF and an
///     oversized length header
///
/// CANCELLATION SAFETY: we cannot use `read_u64()` and `read_exact()` here
/// because this function is intended to be used as a `tokio::select!` branch
/// and those two methods are not cancellation-safe. Instead, in the case
/// of being cancelled midway before receiving the entire object, bytes
/// already read are kept in the read buffer and will continue to be appended
/// by future invocations until successful returning.
pub(crate) async fn safe_tcp_read<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
    max_obj_len: usize,
) -> Result<T, IdGenError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    while read_buf.len() < LEN_HEADER {
        // obj_len not wholesomely read from socket before last cancellation
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(IdGenError::msg("connection closed by peer"));
        }
    }
    let mut len_bytes = [0u8; LEN_HEADER];
    len_bytes.copy_from_slice(&read_buf[..LEN_HEADER]);
    let obj_len = u64::from_be_bytes(len_bytes);
    let obj_end = match usize::try_from(obj_len)
        .ok()
        .filter(|&len| len <= max_obj_len)
        .and_then(|len| len.checked_add(LEN_HEADER))
    {
        Some(end) => end,
        None => {
            return Err(IdGenError::msg(format!(
                "object length {} exceeds limit {}",
                obj_len, max_obj_len
            )))
        }
    };

    // then read the obj itself
    if read_buf.capacity() < obj_end {
        // capacity not big enough, reserve more space
        read_buf.reserve(obj_end - read_buf.len());
    }
    while read_buf.len() < obj_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(IdGenError::msg("connection closed by peer"));
        }
    }
    let obj = decode_from_slice(&read_buf[LEN_HEADER..obj_end])?;

    // if reached this point, no further cancellation to this call is
    // possible (because there are no more awaits ahead); discard bytes
    // used in this call
    read_buf.advance(obj_end);
    Ok(obj)
}

/// Sends an object of type `T` to writable connection `conn_write`, prefixed
/// by its encoded length. Does not flush; callers holding a buffered writer
/// flush once they are done with a batch of objects.
pub(crate) async fn tcp_write_obj<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), IdGenError>
where
    T: Serialize,
    Conn: AsyncWrite + Unpin,
{
    let obj_bytes = encode_to_vec(obj)?;
    conn_write.write_u64(obj_bytes.len() as u64).await?; // send length first
    conn_write.write_all(&obj_bytes[..]).await?;
    Ok(())
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, IdGenError> {
    loop {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        let attempt = socket.bind(bind_addr).and_then(|_| socket.listen(1024));
        match attempt {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return logged_err!("binding {} failed: {}", bind_addr, err);
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, IdGenError> {
    loop {
        let socket = if conn_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_nodelay(true)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
