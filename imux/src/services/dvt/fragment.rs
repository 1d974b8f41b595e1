//! Reassembly of fragmented DTX messages
//!
//! Fragments of one message share `(identifier, channel)`. The first fragment of a split
//! message carries no body, the rest arrive in order and the message is complete on the
//! fragment whose id is `count - 1`.

use std::collections::HashMap;

use tracing::warn;

use crate::ImuxError;

use super::message::MessageHeader;

/// Largest payload a single message may grow to
pub const MAX_MESSAGE_LEN: usize = 128 * 1024 * 1024;
/// Messages that may be half-received at the same time
pub const MAX_PENDING: usize = 64;

#[derive(Debug)]
struct Pending {
    header: MessageHeader,
    next_fragment: u16,
    expected_len: usize,
    buf: Vec<u8>,
}

#[derive(Debug)]
pub struct FragmentAssembler {
    pending: HashMap<(u32, u32), Pending>,
    max_pending: usize,
    max_message_len: usize,
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new(MAX_PENDING, MAX_MESSAGE_LEN)
    }
}

impl FragmentAssembler {
    pub fn new(max_pending: usize, max_message_len: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_pending,
            max_message_len,
        }
    }

    /// Feeds one fragment, returning the payload once the message is complete
    ///
    /// # Errors
    /// `ProtocolViolation` for fragments out of order, a second start of the same message or
    /// a message over the limits
    pub fn push(
        &mut self,
        header: MessageHeader,
        chunk: Vec<u8>,
    ) -> Result<Option<(MessageHeader, Vec<u8>)>, ImuxError> {
        if header.fragment_count <= 1 {
            return Ok(Some((header, chunk)));
        }
        let key = (header.identifier, header.channel);

        if header.fragment_id == 0 {
            if self.pending.contains_key(&key) {
                return Err(ImuxError::ProtocolViolation(format!(
                    "message {} on channel {} started twice",
                    header.identifier, header.channel
                )));
            }
            if self.pending.len() >= self.max_pending {
                return Err(ImuxError::ProtocolViolation(format!(
                    "more than {} fragmented messages in flight",
                    self.max_pending
                )));
            }
            let expected_len = header.length as usize;
            if expected_len > self.max_message_len {
                return Err(ImuxError::ProtocolViolation(format!(
                    "fragmented message of {expected_len} bytes is too large"
                )));
            }
            self.pending.insert(
                key,
                Pending {
                    header,
                    next_fragment: 1,
                    expected_len,
                    buf: Vec::with_capacity(expected_len),
                },
            );
            return Ok(None);
        }

        let pending = match self.pending.get_mut(&key) {
            Some(p) => p,
            None => {
                return Err(ImuxError::ProtocolViolation(format!(
                    "fragment {}/{} of message {} without a start",
                    header.fragment_id, header.fragment_count, header.identifier
                )));
            }
        };
        if header.fragment_id != pending.next_fragment
            || header.fragment_count != pending.header.fragment_count
        {
            let expected = pending.next_fragment;
            self.pending.remove(&key);
            return Err(ImuxError::ProtocolViolation(format!(
                "fragment {} of message {} arrived, expected {expected}",
                header.fragment_id, header.identifier
            )));
        }
        if pending.buf.len() + chunk.len() > self.max_message_len {
            self.pending.remove(&key);
            return Err(ImuxError::ProtocolViolation(format!(
                "fragmented message {} is too large",
                header.identifier
            )));
        }
        pending.buf.extend_from_slice(&chunk);
        pending.next_fragment += 1;

        if !header.is_last_fragment() {
            return Ok(None);
        }
        let Some(pending) = self.pending.remove(&key) else {
            return Ok(None);
        };
        if pending.buf.len() != pending.expected_len {
            warn!(
                "Fragmented message {} announced {} bytes but carried {}",
                header.identifier,
                pending.expected_len,
                pending.buf.len()
            );
        }
        let mut header = header;
        header.fragment_id = 0;
        header.fragment_count = 1;
        header.length = pending.buf.len() as u32;
        Ok(Some((header, pending.buf)))
    }

    /// Forgets every partial message
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use plist::Value;

    use super::*;
    use crate::services::dvt::message::{
        Aux, AuxValue, MESSAGE_HEADER_LEN, Message, PayloadHeader,
    };

    fn sample() -> Message {
        Message::new(
            MessageHeader::new(0, 1, 9, 0, 2, true),
            PayloadHeader::method_invocation(),
            Some(Aux::from_values(vec![AuxValue::Array(vec![0xab; 300])])),
            Some(Value::String("someSelector:".into())),
        )
    }

    fn split(frag: &[u8]) -> (MessageHeader, Vec<u8>) {
        let mut buf = [0u8; MESSAGE_HEADER_LEN];
        buf.copy_from_slice(&frag[..MESSAGE_HEADER_LEN]);
        (
            MessageHeader::from_bytes(&buf).unwrap(),
            frag[MESSAGE_HEADER_LEN..].to_vec(),
        )
    }

    #[test]
    fn test_reassembles_any_fragment_count() {
        let msg = sample();
        for count in [1u16, 2, 5] {
            let frags = msg.encode_fragments(count).unwrap();
            assert_eq!(frags.len(), count as usize);
            if count > 1 {
                assert_eq!(frags[0].len(), MESSAGE_HEADER_LEN);
            }

            let mut assembler = FragmentAssembler::default();
            let mut done = None;
            for (i, frag) in frags.iter().enumerate() {
                let (header, body) = split(frag);
                let res = assembler.push(header, body).unwrap();
                if i + 1 < frags.len() {
                    assert!(res.is_none());
                } else {
                    done = res;
                }
            }
            let (header, payload) = done.unwrap();
            let parsed = Message::from_payload(header, &payload).unwrap();
            assert_eq!(parsed.selector(), Some("someSelector:"));
            assert_eq!(parsed.aux, msg.aux);
            assert_eq!(assembler.pending(), 0);
        }
    }

    #[test]
    fn test_out_of_order_fragment() {
        let frags = sample().encode_fragments(4).unwrap();
        let mut assembler = FragmentAssembler::default();
        let (h, b) = split(&frags[0]);
        assembler.push(h, b).unwrap();
        let (h, b) = split(&frags[2]);
        assert!(matches!(
            assembler.push(h, b),
            Err(ImuxError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_duplicate_start() {
        let frags = sample().encode_fragments(3).unwrap();
        let mut assembler = FragmentAssembler::default();
        let (h, b) = split(&frags[0]);
        assembler.push(h.clone(), b.clone()).unwrap();
        assert!(matches!(
            assembler.push(h, b),
            Err(ImuxError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_interleaved_messages_on_other_channels() {
        let a = sample().encode_fragments(3).unwrap();
        let mut other = sample();
        other.message_header.channel = 5;
        let b = other.encode_fragments(3).unwrap();

        let mut assembler = FragmentAssembler::default();
        let mut complete = 0;
        for frag in [&a[0], &b[0], &a[1], &b[1], &a[2], &b[2]] {
            let (h, body) = split(frag);
            if assembler.push(h, body).unwrap().is_some() {
                complete += 1;
            }
        }
        assert_eq!(complete, 2);
    }

    #[test]
    fn test_pending_cap() {
        let mut assembler = FragmentAssembler::new(1, MAX_MESSAGE_LEN);
        let mut first = MessageHeader::new(0, 2, 1, 0, 0, false);
        first.length = 10;
        assembler.push(first.clone(), Vec::new()).unwrap();
        first.identifier = 2;
        assert!(assembler.push(first, Vec::new()).is_err());
        assembler.clear();
        assert_eq!(assembler.pending(), 0);
    }
}
