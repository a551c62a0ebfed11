//! Byte-level rewrite rules applied to relayed streams.
//!
//! Rules see raw chunks with no knowledge of the relayed protocol's framing.
//! A rule rewrites complete matches in place and tells the relay how many
//! trailing bytes could still become a match once more data arrives; the
//! relay holds those back.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

/// Pluggable rewrite applied to one relay direction.
pub trait RewriteRule: Send + Sync + fmt::Debug {
    /// Rewrite every complete match in `buf` and return how many were rewritten.
    fn apply(&self, buf: &mut BytesMut) -> usize;

    /// Length of the longest suffix of `buf` that is a proper prefix of a match.
    fn pending_prefix(&self, buf: &[u8]) -> usize;
}

/// Wire shape of an announced address: `[u16 BE host_len][host][u32 BE port]`.
pub struct AddressField;

impl AddressField {
    /// Append an encoded address to `buf`.
    pub fn encode(host: &str, port: u32, buf: &mut BytesMut) {
        let host = host.as_bytes();
        buf.reserve(2 + host.len() + 4);
        buf.put_u16(host.len() as u16);
        buf.put_slice(host);
        buf.put_u32(port);
    }

    /// Encoded address as bytes.
    pub fn to_bytes(host: &str, port: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Self::encode(host, port, &mut buf);
        buf.to_vec()
    }

    /// Decode an address from the front of `buf`, advancing past it.
    ///
    /// Returns `None` without consuming when the field is truncated or the
    /// host is not UTF-8.
    pub fn decode<B: Buf>(buf: &mut B) -> Option<(String, u32)> {
        let chunk = buf.chunk();
        if chunk.len() < 2 {
            return None;
        }
        let host_len = u16::from_be_bytes([chunk[0], chunk[1]]) as usize;
        if chunk.len() < 2 + host_len + 4 {
            return None;
        }
        let host = std::str::from_utf8(&chunk[2..2 + host_len]).ok()?.to_string();
        buf.advance(2 + host_len);
        let port = buf.get_u32();
        Some((host, port))
    }
}

/// Rewrites the port of one announced address.
///
/// A match requires the complete field: the length prefix equal to the host
/// length, the exact host bytes and the exact original port. Only the four
/// port bytes change, so stream length and every byte outside matched fields
/// are preserved.
#[derive(Clone, PartialEq, Eq)]
pub struct AddressRewrite {
    needle: Vec<u8>,
    replacement: [u8; 4],
}

impl AddressRewrite {
    /// Rewrite `host:from_port` announcements to `host:to_port`.
    pub fn new(host: &str, from_port: u32, to_port: u32) -> Self {
        Self { needle: AddressField::to_bytes(host, from_port), replacement: to_port.to_be_bytes() }
    }

    fn port_offset(&self) -> usize {
        self.needle.len() - 4
    }
}

impl fmt::Debug for AddressRewrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = String::from_utf8_lossy(&self.needle[2..self.port_offset()]);
        let from = u32::from_be_bytes([
            self.needle[self.port_offset()],
            self.needle[self.port_offset() + 1],
            self.needle[self.port_offset() + 2],
            self.needle[self.port_offset() + 3],
        ]);
        write!(f, "AddressRewrite({host}:{from} -> {})", u32::from_be_bytes(self.replacement))
    }
}

impl RewriteRule for AddressRewrite {
    fn apply(&self, buf: &mut BytesMut) -> usize {
        let needle = self.needle.as_slice();
        let offset = self.port_offset();
        let mut rewrites = 0;
        let mut start = 0;

        while start + needle.len() <= buf.len() {
            match buf[start..].windows(needle.len()).position(|window| window == needle) {
                Some(found) => {
                    let at = start + found + offset;
                    buf[at..at + 4].copy_from_slice(&self.replacement);
                    rewrites += 1;
                    start += found + needle.len();
                },
                None => break,
            }
        }
        rewrites
    }

    fn pending_prefix(&self, buf: &[u8]) -> usize {
        let longest = buf.len().min(self.needle.len() - 1);
        (1..=longest)
            .rev()
            .find(|&len| buf[buf.len() - len..] == self.needle[..len])
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn field(host: &str, port: u32) -> Vec<u8> {
        AddressField::to_bytes(host, port)
    }

    #[test]
    fn test_rewrites_only_the_port() {
        let rule = AddressRewrite::new("127.0.0.1", 7001, 9001);
        let mut buf = BytesMut::new();
        buf.put_slice(b"HB");
        buf.put_slice(&field("127.0.0.1", 7001));
        buf.put_slice(b"tail");

        assert_eq!(rule.apply(&mut buf), 1);

        let mut expected = b"HB".to_vec();
        expected.extend(field("127.0.0.1", 9001));
        expected.extend(b"tail");
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn test_requires_structural_match() {
        let rule = AddressRewrite::new("127.0.0.1", 7001, 9001);

        // Same host and port bytes with a wrong length prefix.
        let mut wrong_len = field("127.0.0.1", 7001);
        wrong_len[1] += 1;
        let mut buf = BytesMut::from(&wrong_len[..]);
        assert_eq!(rule.apply(&mut buf), 0);
        assert_eq!(&buf[..], &wrong_len[..]);

        // Different port.
        let mut buf = BytesMut::from(&field("127.0.0.1", 7002)[..]);
        assert_eq!(rule.apply(&mut buf), 0);

        // Longer host sharing a prefix.
        let mut buf = BytesMut::from(&field("127.0.0.10", 7001)[..]);
        assert_eq!(rule.apply(&mut buf), 0);
    }

    #[test]
    fn test_multiple_matches() {
        let rule = AddressRewrite::new("10.0.0.1", 1, 2);
        let mut buf = BytesMut::new();
        for _ in 0..3 {
            buf.put_slice(&field("10.0.0.1", 1));
        }
        assert_eq!(rule.apply(&mut buf), 3);
        assert_eq!(rule.apply(&mut buf), 0);
    }

    #[test]
    fn test_pending_prefix() {
        let rule = AddressRewrite::new("127.0.0.1", 7001, 9001);
        let needle = field("127.0.0.1", 7001);

        let mut buf = b"xyz".to_vec();
        buf.extend_from_slice(&needle[..5]);
        assert_eq!(rule.pending_prefix(&buf), 5);

        assert_eq!(rule.pending_prefix(b"unrelated"), 0);
        assert_eq!(rule.pending_prefix(&needle), 0);
        assert_eq!(rule.pending_prefix(&needle[..needle.len() - 1]), needle.len() - 1);
    }

    #[test]
    fn test_address_field_decode() {
        let mut buf = BytesMut::new();
        AddressField::encode("localhost", 4242, &mut buf);
        buf.put_u8(0xff);

        let mut frozen = buf.freeze();
        assert_eq!(AddressField::decode(&mut frozen), Some(("localhost".to_string(), 4242)));
        assert_eq!(frozen.remaining(), 1);

        let mut truncated = &field("localhost", 4242)[..6];
        assert_eq!(AddressField::decode(&mut truncated), None);
    }

    proptest! {
        #[test]
        fn prop_bytes_outside_match_unchanged(
            prefix in proptest::collection::vec(any::<u8>(), 0..64),
            suffix in proptest::collection::vec(any::<u8>(), 0..64),
            from in 1u32..65535,
            to in 1u32..65535,
        ) {
            let rule = AddressRewrite::new("192.168.1.7", from, to);
            let original_field = field("192.168.1.7", from);
            let mut input = prefix.clone();
            input.extend(&original_field);
            input.extend(&suffix);

            let mut buf = BytesMut::from(&input[..]);
            let rewrites = rule.apply(&mut buf);

            prop_assert_eq!(buf.len(), input.len());
            prop_assert!(rewrites >= 1);
            let at = prefix.len() + original_field.len() - 4;
            let mut reader = &buf[prefix.len()..];
            prop_assert_eq!(AddressField::decode(&mut reader), Some(("192.168.1.7".to_string(), to)));
            for (i, (after, before)) in buf.iter().zip(input.iter()).enumerate() {
                if after != before {
                    // Differences may only come from rewritten port fields.
                    let in_known_port = (at..at + 4).contains(&i);
                    prop_assert!(in_known_port || rewrites > 1);
                }
            }
        }

        #[test]
        fn prop_split_delivery_matches_whole_delivery(
            noise in proptest::collection::vec(any::<u8>(), 0..48),
            split in 0usize..80,
        ) {
            let rule = AddressRewrite::new("127.0.0.1", 7001, 9001);
            let mut input = noise.clone();
            input.extend(field("127.0.0.1", 7001));
            input.extend(&noise);

            let mut whole = BytesMut::from(&input[..]);
            rule.apply(&mut whole);

            // Feed in two chunks, holding back pending bytes like the relay does.
            let split = split.min(input.len());
            let mut out = Vec::new();
            let mut pending = BytesMut::from(&input[..split]);
            rule.apply(&mut pending);
            let ready = pending.len() - rule.pending_prefix(&pending);
            out.extend(pending.split_to(ready));
            pending.extend_from_slice(&input[split..]);
            rule.apply(&mut pending);
            out.extend(&pending[..]);

            prop_assert_eq!(out, whole.to_vec());
        }
    }
}
