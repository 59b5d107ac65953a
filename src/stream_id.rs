use crate::error::{MuxRpcError, Result};
use std::sync::atomic::{AtomicU32, Ordering};

/// Allocates stream ids for one side of a session.
///
/// Clients open odd ids starting at 1, servers even ids starting at 2, so the
/// two sides never collide.
#[derive(Debug)]
pub struct StreamIdGenerator {
    next_id: AtomicU32,
    is_client: bool,
}

impl StreamIdGenerator {
    pub fn new(is_client: bool) -> Self {
        let initial_id = if is_client { 1 } else { 2 };
        Self {
            next_id: AtomicU32::new(initial_id),
            is_client,
        }
    }

    pub fn next(&self) -> Result<u32> {
        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        if id > u32::MAX - 2 {
            return Err(MuxRpcError::ProtocolViolation(
                "Stream ID overflow - session should be restarted".to_string(),
            ));
        }
        Ok(id)
    }

    /// Checks an id carried by a peer-sent SYN.
    pub fn validate_peer_stream_id(&self, stream_id: u32) -> Result<()> {
        let expected_parity = if self.is_client { 0 } else { 1 };
        if stream_id == 0 || stream_id % 2 != expected_parity {
            return Err(MuxRpcError::InvalidStreamId(stream_id));
        }
        Ok(())
    }
}
