use crate::{
    config::Config,
    error::{MuxRpcError, Result},
};
use bytes::Bytes;

/// `version(1) | cmd(1) | length(2, LE) | stream_id(4, LE)`
pub const HEADER_SIZE: usize = 8;

/// Frame command carried in the second header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Open a stream.
    Syn,
    /// Half-close a stream.
    Fin,
    /// Stream payload.
    Psh,
    /// Keep-alive.
    Nop,
    /// Window update, protocol version 2 only.
    Upd { consumed: u32, window: u32 },
}

impl Command {
    pub const SYN: u8 = 0;
    pub const FIN: u8 = 1;
    pub const PSH: u8 = 2;
    pub const NOP: u8 = 3;
    pub const UPD: u8 = 4;

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            Self::SYN => Ok(Command::Syn),
            Self::FIN => Ok(Command::Fin),
            Self::PSH => Ok(Command::Psh),
            Self::NOP => Ok(Command::Nop),
            Self::UPD => Ok(Command::Upd {
                consumed: 0,
                window: 0,
            }),
            _ => Err(MuxRpcError::InvalidFrame),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Command::Syn => Self::SYN,
            Command::Fin => Self::FIN,
            Command::Psh => Self::PSH,
            Command::Nop => Self::NOP,
            Command::Upd { .. } => Self::UPD,
        }
    }

    pub fn is_control(self) -> bool {
        !matches!(self, Command::Psh)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub cmd: Command,
    pub stream_id: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn new(version: u8, cmd: Command, stream_id: u32, data: Bytes) -> Self {
        Self {
            version,
            cmd,
            stream_id,
            data,
        }
    }

    pub fn syn(version: u8, stream_id: u32) -> Self {
        Self::new(version, Command::Syn, stream_id, Bytes::new())
    }

    pub fn fin(version: u8, stream_id: u32) -> Self {
        Self::new(version, Command::Fin, stream_id, Bytes::new())
    }

    pub fn psh(version: u8, stream_id: u32, data: Bytes) -> Self {
        Self::new(version, Command::Psh, stream_id, data)
    }

    pub fn nop(version: u8) -> Self {
        Self::new(version, Command::Nop, 0, Bytes::new())
    }

    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    pub fn validate(&self, config: &Config) -> Result<()> {
        if self.version == 0 {
            return Err(MuxRpcError::InvalidProtocol(self.version));
        }

        if matches!(self.cmd, Command::Upd { .. }) && self.version < 2 {
            return Err(MuxRpcError::ProtocolViolation(
                "UPD command requires protocol version 2".to_string(),
            ));
        }

        if self.total_size() > config.max_frame_size {
            return Err(MuxRpcError::FrameTooLarge {
                size: self.total_size(),
                max: config.max_frame_size,
            });
        }

        if self.cmd.is_control() && !self.data.is_empty() {
            return Err(MuxRpcError::ProtocolViolation(
                "Control frames cannot carry data".to_string(),
            ));
        }

        // NOP is session-scoped and uses id 0; everything else names a stream.
        let id_ok = match self.cmd {
            Command::Nop => self.stream_id == 0,
            _ => self.stream_id != 0,
        };
        if !id_ok {
            return Err(MuxRpcError::InvalidStreamId(self.stream_id));
        }

        Ok(())
    }
}
