use crate::{
    config::Config,
    error::{MuxRpcError, Result},
    frame::{Command, Frame, HEADER_SIZE},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Session frame codec for `tokio_util::codec::Framed`.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    config: Config,
}

impl FrameCodec {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn encode_upd(consumed: u32, window: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32_le(consumed);
        buf.put_u32_le(window);
        buf.freeze()
    }

    fn decode_upd(mut data: Bytes) -> Result<Command> {
        if data.len() != 8 {
            return Err(MuxRpcError::ProtocolViolation(
                "UPD frame must have exactly 8 bytes of data".to_string(),
            ));
        }
        Ok(Command::Upd {
            consumed: data.get_u32_le(),
            window: data.get_u32_le(),
        })
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxRpcError;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Frame>, MuxRpcError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u16::from_le_bytes([src[2], src[3]]) as usize;
        let total = HEADER_SIZE + length;
        if total > self.config.max_frame_size {
            return Err(MuxRpcError::FrameTooLarge {
                size: total,
                max: self.config.max_frame_size,
            });
        }

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let version = src.get_u8();
        let cmd = Command::from_byte(src.get_u8())?;
        let _length = src.get_u16_le();
        let stream_id = src.get_u32_le();
        let payload = src.split_to(length).freeze();

        let frame = match cmd {
            Command::Upd { .. } => {
                Frame::new(version, Self::decode_upd(payload)?, stream_id, Bytes::new())
            }
            _ => Frame::new(version, cmd, stream_id, payload),
        };

        frame.validate(&self.config)?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxRpcError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> std::result::Result<(), MuxRpcError> {
        frame.validate(&self.config)?;

        let payload = match frame.cmd {
            Command::Upd { consumed, window } => Self::encode_upd(consumed, window),
            _ => frame.data,
        };

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u8(frame.version);
        dst.put_u8(frame.cmd.to_byte());
        dst.put_u16_le(payload.len() as u16);
        dst.put_u32_le(frame.stream_id);
        dst.put_slice(&payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::new(Config::default())
    }

    #[test]
    fn test_codec_round_trip_psh() {
        let mut codec = codec();
        let frame = Frame::psh(1, 123, Bytes::from("hello world"));

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, decoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_frames() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::psh(1, 123, Bytes::from("hello world")), &mut buf)
            .unwrap();

        let mut partial_header = BytesMut::from(&buf[..4]);
        assert!(codec.decode(&mut partial_header).unwrap().is_none());

        let mut partial_data = BytesMut::from(&buf[..HEADER_SIZE + 5]);
        assert!(codec.decode(&mut partial_data).unwrap().is_none());
        // Nothing consumed while incomplete
        assert_eq!(partial_data.len(), HEADER_SIZE + 5);
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut codec = codec();
        let frame1 = Frame::syn(1, 123);
        let frame2 = Frame::fin(1, 456);

        let mut buf = BytesMut::new();
        codec.encode(frame1.clone(), &mut buf).unwrap();
        codec.encode(frame2.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let mut codec = FrameCodec::new(Config {
            max_frame_size: 100,
            ..Default::default()
        });

        let mut buf = BytesMut::new();
        let frame = Frame::psh(1, 123, Bytes::from(vec![0u8; 200]));
        assert!(codec.encode(frame, &mut buf).is_err());

        // A peer announcing an oversized frame fails before its payload arrives
        buf.put_u8(1);
        buf.put_u8(Command::PSH);
        buf.put_u16_le(500);
        buf.put_u32_le(123);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(MuxRpcError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_invalid_header() {
        let mut codec = codec();

        let mut buf = BytesMut::new();
        buf.put_u8(0); // version
        buf.put_u8(Command::SYN);
        buf.put_u16_le(0);
        buf.put_u32_le(123);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.put_u8(1);
        buf.put_u8(255); // command
        buf.put_u16_le(0);
        buf.put_u32_le(123);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_upd_frame_wire_format() {
        let mut codec = codec();
        let upd = Command::Upd {
            consumed: 100,
            window: 200,
        };
        let frame = Frame::new(2, upd, 123, Bytes::new());

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        assert_eq!(buf.len(), HEADER_SIZE + 8);
        assert_eq!(buf[0], 2);
        assert_eq!(buf[1], Command::UPD);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 8);
        assert_eq!(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]), 123);
        assert_eq!(u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]), 100);
        assert_eq!(u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]), 200);

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_invalid_upd_data_length() {
        let mut codec = codec();

        let mut buf = BytesMut::new();
        buf.put_u8(2);
        buf.put_u8(Command::UPD);
        buf.put_u16_le(4);
        buf.put_u32_le(123);
        buf.put_u32_le(100);

        assert!(codec.decode(&mut buf).is_err());
    }
}
