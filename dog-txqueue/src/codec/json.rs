use crate::{codec::MessageCodec, QueueResult};

/// JSON bodies pass through unchanged
#[derive(Debug, Clone)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode_bytes(&self, bytes: &[u8]) -> QueueResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn decode_bytes(&self, bytes: &[u8]) -> QueueResult<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn codec_id(&self) -> &'static str {
        "json"
    }
}
