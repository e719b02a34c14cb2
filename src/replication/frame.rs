//! Replication wire frame: `[action: u8][data_len: i32 LE][data]`.

use std::marker::Unpin;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::utils::IdGenError;

/// Length of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 5;

/// Default upper bound of a frame's data length.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 20;

/// Frame action tags.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum FrameAction {
    /// Heartbeat; data is the sender's unix time as 8 LE bytes.
    Ping = 0x01,

    /// From standby: sync request carrying an encoded `SyncRequest`.
    /// From master: first chunk of a snapshot transfer.
    SyncData = 0x02,

    /// Subsequent chunk of a snapshot transfer.
    ChunkData = 0x03,

    /// End of a sync exchange, whether or not anything was transferred.
    /// Always carries empty data.
    ChunkEnd = 0x04,
}

impl TryFrom<u8> for FrameAction {
    type Error = IdGenError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x01 => Ok(FrameAction::Ping),
            0x02 => Ok(FrameAction::SyncData),
            0x03 => Ok(FrameAction::ChunkData),
            0x04 => Ok(FrameAction::ChunkEnd),
            _ => Err(IdGenError::msg(format!(
                "unrecognized frame action {:#04x}",
                byte
            ))),
        }
    }
}

/// One replication frame.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Frame {
    pub action: FrameAction,
    pub data: Bytes,
}

impl Frame {
    pub fn new(action: FrameAction, data: impl Into<Bytes>) -> Self {
        Frame {
            action,
            data: data.into(),
        }
    }

    /// A frame with no data.
    pub fn empty(action: FrameAction) -> Self {
        Frame {
            action,
            data: Bytes::new(),
        }
    }

    /// Heartbeat frame stamped with `ts`.
    pub fn ping(ts: i64) -> Self {
        Frame::new(FrameAction::Ping, ts.to_le_bytes().to_vec())
    }

    /// Timestamp carried by a heartbeat frame, if well-formed.
    pub fn ping_ts(&self) -> Option<i64> {
        let bytes: [u8; 8] = self.data[..].try_into().ok()?;
        Some(i64::from_le_bytes(bytes))
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), IdGenError> {
        let data_len = i32::try_from(self.data.len()).map_err(|_| {
            IdGenError::msg(format!("frame data too long: {}", self.data.len()))
        })?;
        buf.reserve(FRAME_HEADER_LEN + self.data.len());
        buf.put_u8(self.action as u8);
        buf.put_i32_le(data_len);
        buf.extend_from_slice(&self.data);
        Ok(())
    }

    /// Tries to decode one frame from the front of `buf`. Returns
    /// `Ok(None)` if more bytes are needed, or the frame and the number of
    /// bytes it occupied. Unknown actions and negative or oversized lengths
    /// are protocol faults.
    pub fn decode(
        buf: &[u8],
        max_len: usize,
    ) -> Result<Option<(Frame, usize)>, IdGenError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let action = FrameAction::try_from(buf[0])?;
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[1..FRAME_HEADER_LEN]);
        let data_len = i32::from_le_bytes(len_bytes);
        if data_len < 0 {
            return Err(IdGenError::msg(format!(
                "negative frame data length {}",
                data_len
            )));
        }
        let data_len = data_len as usize;
        if data_len > max_len {
            return Err(IdGenError::msg(format!(
                "frame data length {} exceeds limit {}",
                data_len, max_len
            )));
        }

        let frame_end = FRAME_HEADER_LEN + data_len;
        if buf.len() < frame_end {
            return Ok(None);
        }
        let data = Bytes::copy_from_slice(&buf[FRAME_HEADER_LEN..frame_end]);
        Ok(Some((Frame { action, data }, frame_end)))
    }
}

/// Payload of a standby's sync request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Hex MD5 of the standby's replica file; empty if it has none.
    pub md5: String,

    /// Standby local time, `YYYY-MM-DD HH:MM:SS`.
    pub ts: String,
}

impl SyncRequest {
    pub fn encode(&self) -> Result<Bytes, IdGenError> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }

    pub fn decode(data: &[u8]) -> Result<Self, IdGenError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Reads one frame from `conn_read`, buffering partial reads in
/// `read_buf`. Cancellation-safe in the same way as `safe_tcp_read()`:
/// bytes read before a cancellation stay in the buffer.
pub async fn read_frame<Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
    max_len: usize,
) -> Result<Frame, IdGenError>
where
    Conn: AsyncReadExt + Unpin,
{
    loop {
        if let Some((frame, used)) = Frame::decode(&read_buf[..], max_len)? {
            read_buf.advance(used);
            return Ok(frame);
        }
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(IdGenError::msg("connection closed by peer"));
        }
    }
}

/// Writes one frame to `conn_write`. Does not flush.
pub async fn write_frame<Conn>(
    conn_write: &mut Conn,
    frame: &Frame,
) -> Result<(), IdGenError>
where
    Conn: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    frame.encode_into(&mut buf)?;
    conn_write.write_all(&buf).await?;
    Ok(())
}
