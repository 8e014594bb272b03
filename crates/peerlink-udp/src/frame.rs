//! Session frames carried inside laminar packets
//!
//! laminar has no connection handshake or goodbye of its own, so every datagram
//! starts with a one-byte tag:
//!
//! - `HELLO channels` opens a session and announces the channel count
//! - `DATA channel payload..` carries application bytes
//! - `GOODBYE data(u32, big endian)` ends a session gracefully

const HELLO: u8 = 0x01;
const DATA: u8 = 0x02;
const GOODBYE: u8 = 0x03;

/// Bytes a data frame adds in front of the payload
pub const DATA_OVERHEAD: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    Hello { channels: u8 },
    Data { channel: u8, payload: &'a [u8] },
    Goodbye { data: u32 },
}

impl<'a> Frame<'a> {
    /// Parse a datagram; `None` for anything this crate did not write
    pub fn decode(bytes: &'a [u8]) -> Option<Self> {
        match bytes {
            [HELLO, channels] => Some(Frame::Hello { channels: *channels }),
            [DATA, channel, payload @ ..] => Some(Frame::Data {
                channel: *channel,
                payload,
            }),
            [GOODBYE, a, b, c, d] => Some(Frame::Goodbye {
                data: u32::from_be_bytes([*a, *b, *c, *d]),
            }),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Hello { channels } => vec![HELLO, *channels],
            Frame::Data { channel, payload } => {
                let mut bytes = Vec::with_capacity(DATA_OVERHEAD + payload.len());
                bytes.push(DATA);
                bytes.push(*channel);
                bytes.extend_from_slice(payload);
                bytes
            }
            Frame::Goodbye { data } => {
                let mut bytes = vec![GOODBYE];
                bytes.extend_from_slice(&data.to_be_bytes());
                bytes
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goodbye_data_is_big_endian() {
        let bytes = Frame::Goodbye { data: 0x0102_0304 }.encode();
        assert_eq!(bytes, vec![GOODBYE, 1, 2, 3, 4]);
        assert_eq!(Frame::decode(&bytes), Some(Frame::Goodbye { data: 0x0102_0304 }));
    }

    #[test]
    fn empty_payloads_still_carry_their_channel() {
        let bytes = Frame::Data { channel: 3, payload: &[] }.encode();
        assert_eq!(bytes.len(), DATA_OVERHEAD);
        assert_eq!(
            Frame::decode(&bytes),
            Some(Frame::Data { channel: 3, payload: &[] })
        );
    }

    #[test]
    fn foreign_datagrams_are_rejected() {
        assert_eq!(Frame::decode(&[]), None);
        assert_eq!(Frame::decode(&[DATA]), None);
        assert_eq!(Frame::decode(&[HELLO]), None);
        assert_eq!(Frame::decode(&[HELLO, 1, 2]), None);
        assert_eq!(Frame::decode(&[GOODBYE, 0, 0, 0]), None);
        assert_eq!(Frame::decode(&[0x7f, 0, 0]), None);
    }
}
