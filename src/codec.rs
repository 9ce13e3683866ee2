use std::fmt;

use derive_more::Display;

pub type ProcessId = u32;

/// The Commander always has id 0; every chain starts with it.
pub const COMMANDER: ProcessId = 0;

/// Frame tags. Every process in a deployment must agree on these.
pub const BYZANTINE: u32 = 1;
pub const ACK: u32 = 2;

const HEADER_LEN: usize = 16;
const ACK_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Order {
    #[display(fmt = "ATTACK")]
    Attack,
    #[display(fmt = "RETREAT")]
    Retreat,
}

impl Order {
    fn to_wire(self) -> u32 {
        match self {
            Self::Attack => 0,
            Self::Retreat => 1,
        }
    }

    fn from_wire(word: u32) -> Option<Self> {
        match word {
            0 => Some(Self::Attack),
            1 => Some(Self::Retreat),
            _ => None,
        }
    }
}

/// An order together with the chain of processes that relayed it. Two
/// messages are the same message exactly when round, order and the full id
/// sequence agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message {
    pub round: u32,
    pub order: Order,
    pub ids: Vec<ProcessId>,
}

impl Message {
    /// Wire layout, all fields big-endian u32: tag, total size, round,
    /// order, then the id chain.
    pub fn encode(&self) -> Vec<u8> {
        let size = HEADER_LEN + 4 * self.ids.len();
        let mut buf = Vec::with_capacity(size);
        for word in [BYZANTINE, size as u32, self.round, self.order.to_wire()] {
            buf.extend_from_slice(&word.to_be_bytes());
        }
        for id in &self.ids {
            buf.extend_from_slice(&id.to_be_bytes());
        }
        buf
    }

    /// Returns `None` on a malformed buffer. The tag is not checked here
    /// (the receive path does that before dispatch) and neither is the size
    /// field; the id count comes from the actual buffer length, trailing
    /// bytes that do not fill a whole id are dropped.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let round = read_u32(buf, 8);
        let order = Order::from_wire(read_u32(buf, 12))?;
        let ids = (0..(buf.len() - HEADER_LEN) / 4)
            .map(|index| read_u32(buf, HEADER_LEN + 4 * index))
            .collect();
        Some(Self { round, order, ids })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (round {}, chain {:?})",
            self.order, self.round, self.ids
        )
    }
}

/// Acknowledgment for a received [`Message`], tagged with the receiver's
/// current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub round: u32,
}

impl Ack {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ACK_LEN);
        for word in [ACK, ACK_LEN as u32, self.round] {
            buf.extend_from_slice(&word.to_be_bytes());
        }
        buf
    }

    /// An ack is exactly 12 bytes; anything else is malformed.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != ACK_LEN {
            return None;
        }
        Some(Self {
            round: read_u32(buf, 8),
        })
    }
}

/// Frame tag of a raw datagram, if it is long enough to carry one.
pub fn frame_tag(buf: &[u8]) -> Option<u32> {
    (buf.len() >= 4).then(|| read_u32(buf, 0))
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(buf[offset..offset + 4].try_into().expect("4-byte slice"))
}

/// Number of distinct chains a loyal Lieutenant expects to receive in
/// `round`: each chain from the previous round is extended by one of the
/// processes not already in it and not the receiver.
pub fn expected_chains(num_process: usize, round: u32) -> usize {
    if round == 0 {
        return 1;
    }
    (num_process - 1 - round as usize) * expected_chains(num_process, round - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let message = Message {
            round: 2,
            order: Order::Attack,
            ids: vec![0, 3, 1],
        };
        assert_eq!(Message::decode(&message.encode()), Some(message));
    }

    #[test]
    fn message_frame_layout() {
        let buf = Message {
            round: 1,
            order: Order::Retreat,
            ids: vec![0, 2],
        }
        .encode();
        assert_eq!(buf.len(), 24);
        assert_eq!(frame_tag(&buf), Some(BYZANTINE));
        assert_eq!(&buf[4..8], &24u32.to_be_bytes());
        assert_eq!(&buf[8..12], &1u32.to_be_bytes());
        assert_eq!(&buf[12..16], &1u32.to_be_bytes());
    }

    #[test]
    fn short_buffer_is_malformed() {
        assert_eq!(Message::decode(&[]), None);
        assert_eq!(Message::decode(&[0; 15]), None);
        assert!(Message::decode(&[0; 16]).is_some());
    }

    #[test]
    fn junk_order_is_malformed() {
        let mut buf = Message {
            round: 0,
            order: Order::Attack,
            ids: vec![0],
        }
        .encode();
        buf[12..16].copy_from_slice(&7u32.to_be_bytes());
        assert_eq!(Message::decode(&buf), None);
    }

    #[test]
    fn trailing_bytes_truncate_to_whole_ids() {
        let mut buf = Message {
            round: 1,
            order: Order::Attack,
            ids: vec![0, 2],
        }
        .encode();
        buf.extend_from_slice(&[0xff; 3]);
        let message = Message::decode(&buf).unwrap();
        assert_eq!(message.ids, vec![0, 2]);
    }

    #[test]
    fn ack_round_trip_and_length() {
        let ack = Ack { round: 3 };
        let buf = ack.encode();
        assert_eq!(buf.len(), 12);
        assert_eq!(Ack::decode(&buf), Some(ack));
        assert_eq!(Ack::decode(&buf[..11]), None);
        assert_eq!(Ack::decode(&[0; 13]), None);
    }

    #[test]
    fn expected_chain_counts() {
        assert_eq!(expected_chains(4, 0), 1);
        assert_eq!(expected_chains(4, 1), 2);
        assert_eq!(expected_chains(5, 1), 3);
        assert_eq!(expected_chains(7, 2), 20);
    }
}
