//! Encodes and decodes the BitTorrent wire protocol: the initial handshake
//! and, after that, the regular peer messages.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The fixed protocol string sent in every handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The BitTorrent handshake message.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Length, in bytes, of a handshake message (1 + 19 + 8 + 20 + 20).
const HANDSHAKE_LEN: usize = 68;

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        let pstrlen = buf[0] as usize;
        if pstrlen != 19 {
            return Err(Error::InvalidProtocolString);
        }

        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }

        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidProtocolString);
        }

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id byte that precedes a message's payload on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
}

impl std::convert::TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Ok(match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Block,
            8 => Self::Cancel,
            9 => Self::Port,
            _ => return Err(Error::InvalidMessageId(id)),
        })
    }
}

/// A peer protocol message, as defined in BEP 3.
#[derive(Debug)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block { piece_index: PieceIndex, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Self::KeepAlive => return None,
            Self::Choke => MessageId::Choke,
            Self::Unchoke => MessageId::Unchoke,
            Self::Interested => MessageId::Interested,
            Self::NotInterested => MessageId::NotInterested,
            Self::Have { .. } => MessageId::Have,
            Self::Bitfield(_) => MessageId::Bitfield,
            Self::Request(_) => MessageId::Request,
            Self::Block { .. } => MessageId::Block,
            Self::Cancel(_) => MessageId::Cancel,
        })
    }
}

/// The length, in bytes, of the `piece_index`, `offset` and `length` fields
/// of a request/cancel message.
const BLOCK_INFO_LEN: u32 = 3 * 4;

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.reserve(4);
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.reserve(5);
                buf.put_u32(1);
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have { piece_index } => {
                buf.reserve(4 + 1 + 4);
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.reserve(4 + 1 + bytes.len());
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(&bytes);
            }
            Message::Request(block) => {
                buf.reserve(4 + 1 + BLOCK_INFO_LEN as usize);
                buf.put_u32(1 + BLOCK_INFO_LEN);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Cancel(block) => {
                buf.reserve(4 + 1 + BLOCK_INFO_LEN as usize);
                buf.put_u32(1 + BLOCK_INFO_LEN);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                buf.reserve(4 + 1 + 8 + data.len());
                buf.put_u32(1 + 8 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut len_buf = [0; 4];
        len_buf.copy_from_slice(&buf[0..4]);
        let msg_len = u32::from_be_bytes(len_buf) as usize;

        if msg_len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if buf.len() < 4 + msg_len {
            buf.reserve(4 + msg_len - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let id = buf[0];
        let id = std::convert::TryFrom::try_from(id)?;
        buf.advance(1);
        let payload_len = msg_len - 1;

        let msg = match id {
            MessageId::Choke => {
                expect_payload_len(payload_len, 0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect_payload_len(payload_len, 0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect_payload_len(payload_len, 0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect_payload_len(payload_len, 0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect_payload_len(payload_len, 4)?;
                let piece_index = buf.get_u32() as PieceIndex;
                Message::Have { piece_index }
            }
            MessageId::Bitfield => {
                let bytes = buf[..payload_len].to_vec();
                buf.advance(payload_len);
                Message::Bitfield(Bitfield::from_vec(bytes))
            }
            MessageId::Request => {
                expect_payload_len(payload_len, BLOCK_INFO_LEN as usize)?;
                Message::Request(read_block_info(buf))
            }
            MessageId::Cancel => {
                expect_payload_len(payload_len, BLOCK_INFO_LEN as usize)?;
                Message::Cancel(read_block_info(buf))
            }
            MessageId::Block => {
                if payload_len < 8 {
                    return Err(Error::InvalidMessageLength);
                }
                let piece_index = buf.get_u32() as PieceIndex;
                let offset = buf.get_u32();
                let data = buf[..payload_len - 8].to_vec();
                buf.advance(payload_len - 8);
                Message::Block {
                    piece_index,
                    offset,
                    data,
                }
            }
            MessageId::Port => {
                // DHT isn't implemented, so we still need to consume the
                // payload to stay in sync with the stream, but the listen
                // port itself is discarded
                expect_payload_len(payload_len, 2)?;
                buf.advance(2);
                return self.decode(buf);
            }
        };

        Ok(Some(msg))
    }
}

fn expect_payload_len(actual: usize, expected: usize) -> Result<(), Error> {
    if actual != expected {
        Err(Error::InvalidMessageLength)
    } else {
        Ok(())
    }
}

fn read_block_info(buf: &mut BytesMut) -> BlockInfo {
    let piece_index = buf.get_u32() as PieceIndex;
    let offset = buf.get_u32();
    let len = buf.get_u32();
    BlockInfo {
        piece_index,
        offset,
        len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_handshake_round_trip() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        let mut codec = HandshakeCodec;
        codec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.info_hash, [1; 20]);
        assert_eq!(decoded.peer_id, [2; 20]);
    }

    #[test]
    fn test_keep_alive_round_trip() {
        let mut buf = BytesMut::new();
        let mut codec = PeerCodec;
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, Message::KeepAlive));
    }

    #[test]
    fn test_request_round_trip() {
        let mut buf = BytesMut::new();
        let mut codec = PeerCodec;
        let block = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        codec.encode(Message::Request(block), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        match decoded {
            Message::Request(b) => assert_eq!(b, block),
            _ => panic!("expected Request"),
        }
    }

    #[test]
    fn test_partial_message_returns_none() {
        let mut buf = BytesMut::new();
        let mut codec = PeerCodec;
        codec.encode(Message::Interested, &mut buf).unwrap();
        // drop the last byte to simulate a partial read
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
