pub mod json;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    types::{headers::standard, Headers, ReceivedMessage},
    QueueError, QueueResult,
};

/// Trait for message body codecs
pub trait MessageCodec: Send + Sync {
    /// Encode a serialized value into body bytes
    fn encode_bytes(&self, bytes: &[u8]) -> QueueResult<Vec<u8>>;

    /// Decode body bytes back into serialized form
    fn decode_bytes(&self, bytes: &[u8]) -> QueueResult<Vec<u8>>;

    /// Get codec identifier
    fn codec_id(&self) -> &'static str;
}

/// Registry for managing different codecs
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn MessageCodec>>,
    default_codec: String,
}

impl CodecRegistry {
    /// Create a new codec registry with JSON as default
    pub fn new() -> Self {
        let mut registry = Self {
            codecs: HashMap::new(),
            default_codec: "json".to_string(),
        };

        registry.register(Arc::new(json::JsonCodec));
        registry
    }

    /// Register a new codec
    pub fn register(&mut self, codec: Arc<dyn MessageCodec>) {
        let codec_id = codec.codec_id().to_string();
        self.codecs.insert(codec_id, codec);
    }

    /// Get a codec by ID
    pub fn get_codec(&self, codec_id: &str) -> QueueResult<Arc<dyn MessageCodec>> {
        self.codecs
            .get(codec_id)
            .cloned()
            .ok_or_else(|| QueueError::CodecNotFound(codec_id.to_string()))
    }

    /// Get the default codec
    pub fn default_codec(&self) -> QueueResult<Arc<dyn MessageCodec>> {
        self.get_codec(&self.default_codec)
    }

    /// Set the default codec
    pub fn set_default_codec(&mut self, codec_id: &str) -> QueueResult<()> {
        if self.codecs.contains_key(codec_id) {
            self.default_codec = codec_id.to_string();
            Ok(())
        } else {
            Err(QueueError::CodecNotFound(codec_id.to_string()))
        }
    }

    /// List available codecs
    pub fn available_codecs(&self) -> Vec<String> {
        self.codecs.keys().cloned().collect()
    }

    /// Serialize a value with the default codec and tag the headers with its id
    pub fn encode<T: Serialize>(&self, value: &T, headers: &mut Headers) -> QueueResult<Bytes> {
        let codec = self.default_codec()?;
        let serialized = serde_json::to_vec(value)?;
        let body = codec.encode_bytes(&serialized)?;
        headers.set(&standard::CODEC, codec.codec_id().to_string());
        Ok(Bytes::from(body))
    }

    /// Decode a received body with the codec named in its headers
    pub fn decode<T: DeserializeOwned>(&self, message: &ReceivedMessage) -> QueueResult<T> {
        let codec = match message.headers.get(&standard::CODEC) {
            Some(codec_id) => self.get_codec(&codec_id)?,
            None => self.default_codec()?,
        };
        let serialized = codec.decode_bytes(&message.body)?;
        Ok(serde_json::from_slice(&serialized)?)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CorrelationId, LeaseToken, MessageId, Priority, QueueId};
    use chrono::Utc;

    struct ReversingCodec;

    impl MessageCodec for ReversingCodec {
        fn encode_bytes(&self, bytes: &[u8]) -> QueueResult<Vec<u8>> {
            Ok(bytes.iter().rev().copied().collect())
        }

        fn decode_bytes(&self, bytes: &[u8]) -> QueueResult<Vec<u8>> {
            Ok(bytes.iter().rev().copied().collect())
        }

        fn codec_id(&self) -> &'static str {
            "reverse"
        }
    }

    fn received(body: Bytes, headers: Headers) -> ReceivedMessage {
        ReceivedMessage {
            queue_id: QueueId(1),
            message_id: MessageId::new(),
            correlation_id: CorrelationId::new(),
            body,
            headers,
            priority: Priority::default(),
            queue_process_time: None,
            expiration_time: None,
            heartbeat: None,
            lease_token: LeaseToken::new(),
            route: None,
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn test_decode_uses_codec_from_headers() {
        let mut registry = CodecRegistry::new();
        registry.register(Arc::new(ReversingCodec));
        registry.set_default_codec("reverse").unwrap();

        let mut headers = Headers::new();
        let body = registry.encode(&vec![1, 2, 3], &mut headers).unwrap();
        assert_eq!(headers.get(&standard::CODEC).as_deref(), Some("reverse"));

        // A registry defaulting to JSON still follows the header
        let mut reader = CodecRegistry::new();
        reader.register(Arc::new(ReversingCodec));
        let decoded: Vec<i32> = reader.decode(&received(body, headers)).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn test_unknown_codec() {
        let registry = CodecRegistry::new();
        assert!(matches!(
            registry.get_codec("msgpack"),
            Err(QueueError::CodecNotFound(_))
        ));
        let headers = Headers::new().with(&standard::CODEC, "msgpack".to_string());
        let result: QueueResult<i32> = registry.decode(&received(Bytes::from_static(b"1"), headers));
        assert!(matches!(result, Err(QueueError::CodecNotFound(_))));
    }
}
