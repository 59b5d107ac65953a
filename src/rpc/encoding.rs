use crate::error::{MuxRpcError, Result};
use bytes::Bytes;

/// Converts RPC messages of type `M` to and from their wire bytes.
pub trait Encoding<M>: Send + Sync {
    fn marshal(&self, msg: &M) -> Result<Bytes>;
    fn unmarshal(&self, buf: Bytes) -> Result<M>;
}

/// Passes bytes through unchanged; strings must be UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawEncoding;

impl Encoding<Bytes> for RawEncoding {
    fn marshal(&self, msg: &Bytes) -> Result<Bytes> {
        Ok(msg.clone())
    }

    fn unmarshal(&self, buf: Bytes) -> Result<Bytes> {
        Ok(buf)
    }
}

impl Encoding<Vec<u8>> for RawEncoding {
    fn marshal(&self, msg: &Vec<u8>) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(msg))
    }

    fn unmarshal(&self, buf: Bytes) -> Result<Vec<u8>> {
        Ok(buf.to_vec())
    }
}

impl Encoding<String> for RawEncoding {
    fn marshal(&self, msg: &String) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(msg.as_bytes()))
    }

    fn unmarshal(&self, buf: Bytes) -> Result<String> {
        String::from_utf8(buf.to_vec()).map_err(|e| MuxRpcError::Encoding(e.to_string()))
    }
}
