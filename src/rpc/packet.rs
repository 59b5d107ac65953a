use crate::error::{MuxRpcError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// `kind(1) | length(4, LE)`
pub const PACKET_HEADER_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// First packet of every RPC; payload is the RPC name.
    Invoke,
    Message,
    /// The sender will send no more messages.
    CloseSend,
    /// The RPC failed; payload is a UTF-8 description.
    Error,
    /// The RPC is over.
    Close,
}

impl PacketKind {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(PacketKind::Invoke),
            1 => Ok(PacketKind::Message),
            2 => Ok(PacketKind::CloseSend),
            3 => Ok(PacketKind::Error),
            4 => Ok(PacketKind::Close),
            other => Err(MuxRpcError::ProtocolViolation(format!(
                "unknown packet kind {other}"
            ))),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            PacketKind::Invoke => 0,
            PacketKind::Message => 1,
            PacketKind::CloseSend => 2,
            PacketKind::Error => 3,
            PacketKind::Close => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub data: Bytes,
}

impl Packet {
    pub fn invoke(rpc: &str) -> Self {
        Self {
            kind: PacketKind::Invoke,
            data: Bytes::copy_from_slice(rpc.as_bytes()),
        }
    }

    pub fn message(data: Bytes) -> Self {
        Self {
            kind: PacketKind::Message,
            data,
        }
    }

    pub fn error(description: &str) -> Self {
        Self {
            kind: PacketKind::Error,
            data: Bytes::copy_from_slice(description.as_bytes()),
        }
    }

    pub fn close_send() -> Self {
        Self {
            kind: PacketKind::CloseSend,
            data: Bytes::new(),
        }
    }

    pub fn close() -> Self {
        Self {
            kind: PacketKind::Close,
            data: Bytes::new(),
        }
    }
}

/// Length-prefixed packet codec for one RPC sub-stream.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_message_size: usize,
}

impl PacketCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = MuxRpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if length > self.max_message_size {
            return Err(MuxRpcError::MessageTooLarge {
                size: length,
                max: self.max_message_size,
            });
        }

        let total = PACKET_HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let kind = PacketKind::from_byte(src.get_u8())?;
        src.advance(4);
        let data = src.split_to(length).freeze();

        Ok(Some(Packet { kind, data }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = MuxRpcError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        if packet.data.len() > self.max_message_size {
            return Err(MuxRpcError::MessageTooLarge {
                size: packet.data.len(),
                max: self.max_message_size,
            });
        }

        dst.reserve(PACKET_HEADER_SIZE + packet.data.len());
        dst.put_u8(packet.kind.to_byte());
        dst.put_u32_le(packet.data.len() as u32);
        dst.put_slice(&packet.data);
        Ok(())
    }
}
