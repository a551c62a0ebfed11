//! Heartbeat wire format exchanged between simulated nodes.
//!
//! Frame layout (big endian):
//! ```text
//! Size | Field
//! -----|------------------------------------------
//!   4  | Body length
//!   1  | Kind (1 = heartbeat, 2 = leave)
//!   2  | Sender name length
//!   n  | Sender name
//!   ?  | Announced cluster address (AddressField)
//!   1  | Database status
//!   8  | Committed write sequence seen by the sender
//! ```
//! The announced address uses the [`AddressField`] shape so the partition
//! proxy can rewrite it in flight.

use bytes::{Buf, BufMut, BytesMut};
use faultline_cluster::AddressField;
use faultline_core::{DatabaseStatus, Error, NodeId, Result};

/// Upper bound of a frame body.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Periodic liveness announcement
    Heartbeat,
    /// Announced departure
    Leave,
}

impl FrameKind {
    const fn code(self) -> u8 {
        match self {
            Self::Heartbeat => 1,
            Self::Leave => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Heartbeat),
            2 => Ok(Self::Leave),
            other => Err(Error::Serialization { message: format!("unknown frame kind {other}") }),
        }
    }
}

/// One heartbeat or leave frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Sender
    pub node: NodeId,
    /// Host the sender announces
    pub host: String,
    /// Cluster port the sender announces
    pub port: u32,
    /// Sender's status of its database
    pub status: DatabaseStatus,
    /// Write sequence of the sender's replica
    pub seq: u64,
}

fn status_code(status: DatabaseStatus) -> u8 {
    match status {
        DatabaseStatus::Online => 0,
        DatabaseStatus::Synchronizing => 1,
        DatabaseStatus::NotAvailable => 2,
        DatabaseStatus::Offline => 3,
    }
}

fn status_from_code(code: u8) -> Result<DatabaseStatus> {
    match code {
        0 => Ok(DatabaseStatus::Online),
        1 => Ok(DatabaseStatus::Synchronizing),
        2 => Ok(DatabaseStatus::NotAvailable),
        3 => Ok(DatabaseStatus::Offline),
        other => Err(Error::Serialization { message: format!("unknown status {other}") }),
    }
}

impl Frame {
    /// Append the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::with_capacity(32 + self.node.as_str().len() + self.host.len());
        body.put_u8(self.kind.code());
        body.put_u16(self.node.as_str().len() as u16);
        body.put_slice(self.node.as_str().as_bytes());
        AddressField::encode(&self.host, self.port, &mut body);
        body.put_u8(status_code(self.status));
        body.put_u64(self.seq);

        buf.reserve(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
    }

    fn decode_body(mut body: &[u8]) -> Result<Self> {
        let truncated = || Error::Serialization { message: "truncated frame".to_string() };
        if body.remaining() < 3 {
            return Err(truncated());
        }
        let kind = FrameKind::from_code(body.get_u8())?;
        let name_len = body.get_u16() as usize;
        if body.remaining() < name_len {
            return Err(truncated());
        }
        let node = std::str::from_utf8(&body[..name_len])
            .map_err(|e| Error::Serialization { message: e.to_string() })?
            .to_string();
        body.advance(name_len);
        let (host, port) = AddressField::decode(&mut body).ok_or_else(truncated)?;
        if body.remaining() < 9 {
            return Err(truncated());
        }
        let status = status_from_code(body.get_u8())?;
        let seq = body.get_u64();
        Ok(Self { kind, node: NodeId::new(node), host, port, status, seq })
    }
}

/// Accumulates stream bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Buffer to read stream data into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
            as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::Serialization { message: format!("frame of {len} bytes too large") });
        }
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }
        self.buffer.advance(4);
        let body = self.buffer.split_to(len);
        Frame::decode_body(&body).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn heartbeat() -> Frame {
        Frame {
            kind: FrameKind::Heartbeat,
            node: NodeId::from_ordinal(1),
            host: "127.0.0.1".to_string(),
            port: 41_002,
            status: DatabaseStatus::Online,
            seq: 17,
        }
    }

    #[test]
    fn test_decoder_waits_for_complete_frames() {
        let mut encoded = BytesMut::new();
        heartbeat().encode(&mut encoded);
        let leave = Frame { kind: FrameKind::Leave, ..heartbeat() };
        leave.encode(&mut encoded);

        let mut decoder = FrameDecoder::default();
        let split = 7;
        decoder.buffer_mut().extend_from_slice(&encoded[..split]);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.buffer_mut().extend_from_slice(&encoded[split..]);
        assert_eq!(decoder.next_frame().unwrap(), Some(heartbeat()));
        assert_eq!(decoder.next_frame().unwrap(), Some(leave));
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn test_announced_address_is_rewritable() {
        use faultline_cluster::{AddressRewrite, RewriteRule};

        let mut encoded = BytesMut::new();
        heartbeat().encode(&mut encoded);
        let before = encoded.len();
        assert_eq!(AddressRewrite::new("127.0.0.1", 41_002, 50_000).apply(&mut encoded), 1);
        assert_eq!(encoded.len(), before);

        let mut decoder = FrameDecoder::default();
        decoder.buffer_mut().extend_from_slice(&encoded);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.port, 50_000);
        assert_eq!(frame.node, NodeId::from_ordinal(1));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::default();
        decoder.buffer_mut().put_u32(u32::MAX);
        assert!(decoder.next_frame().is_err());
    }

    proptest! {
        #[test]
        fn prop_frames_survive_any_read_boundaries(
            names in proptest::collection::vec("[a-z][a-z0-9-]{0,15}", 1..6),
            seq in any::<u64>(),
            chunk in 1usize..32,
        ) {
            let frames: Vec<Frame> = names
                .iter()
                .enumerate()
                .map(|(i, name)| Frame {
                    kind: if i % 2 == 0 { FrameKind::Heartbeat } else { FrameKind::Leave },
                    node: NodeId::new(name.as_str()),
                    seq: seq.wrapping_add(i as u64),
                    ..heartbeat()
                })
                .collect();
            let mut encoded = BytesMut::new();
            for frame in &frames {
                frame.encode(&mut encoded);
            }

            let mut decoder = FrameDecoder::default();
            let mut decoded = Vec::new();
            for piece in encoded.chunks(chunk) {
                decoder.buffer_mut().extend_from_slice(piece);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    decoded.push(frame);
                }
            }
            prop_assert_eq!(decoded, frames);
        }
    }
}
