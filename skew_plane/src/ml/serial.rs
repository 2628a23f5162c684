use std::{collections::HashMap, sync::OnceLock};

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::ml::{block::AnyBlock, lstm::Lstm, skew::SkewLayer};

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("serialization is unsupported for block type: {block_type}")]
    Unsupported { block_type: &'static str },
    #[error("type is not a block: {found}")]
    NotABlock { found: String },
    #[error("unknown type tag: {0}")]
    UnknownType(String),
    #[error("unexpected type: expected={expected}, found={found}")]
    UnexpectedType {
        expected: &'static str,
        found: String,
    },
    #[error("invalid {block_type} block: {reason}")]
    InvalidBlock {
        block_type: &'static str,
        reason: String,
    },
}

/// Byte encoding capability of a block.
pub trait SerializableBlock {
    fn type_tag(&self) -> &'static str;
    fn encode(&self) -> Result<Value>;
}

/// A block persisted through serde under a fixed type tag.
pub trait TypedBlock: AnyBlock + Serialize + DeserializeOwned + 'static {
    const TYPE_TAG: &'static str;

    /// Checked after decoding. An `Err` carries the reason the decoded block is unusable.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl<T: TypedBlock> SerializableBlock for T {
    fn type_tag(&self) -> &'static str {
        T::TYPE_TAG
    }

    fn encode(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    type_tag: String,
    data: Value,
}

#[derive(Debug)]
pub enum Decoded {
    Block(Box<dyn AnyBlock>),
    Layer(SkewLayer),
}

impl Decoded {
    pub fn type_name(&self) -> &'static str {
        match self {
            Decoded::Block(block) => block.block_type(),
            Decoded::Layer(_) => SkewLayer::TYPE_TAG,
        }
    }
}

pub type Decoder = fn(&Registry, Value) -> Result<Decoded>;

/// Maps type tags to decoders.
#[derive(Default)]
pub struct Registry {
    decoders: HashMap<&'static str, Decoder>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that knows every type shipped with this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_block::<Lstm>();
        registry.register(SkewLayer::TYPE_TAG, SkewLayer::decode);
        registry
    }

    pub fn global() -> &'static Registry {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();
        REGISTRY.get_or_init(Registry::with_defaults)
    }

    pub fn register(&mut self, type_tag: &'static str, decoder: Decoder) {
        if self.decoders.insert(type_tag, decoder).is_some() {
            debug!("Replaced decoder for type tag '{}'", type_tag);
        }
    }

    pub fn register_block<T: TypedBlock>(&mut self) {
        self.register(T::TYPE_TAG, decode_typed::<T>);
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Decoded> {
        let value = serde_json::from_slice(bytes)?;
        self.decode_value(value)
    }

    pub fn decode_value(&self, value: Value) -> Result<Decoded> {
        let envelope: Envelope = serde_json::from_value(value)?;
        let decoder = self
            .decoders
            .get(envelope.type_tag.as_str())
            .ok_or_else(|| SerializeError::UnknownType(envelope.type_tag.clone()))?;

        decoder(self, envelope.data)
    }

    pub fn decode_block(&self, value: Value) -> Result<Box<dyn AnyBlock>> {
        match self.decode_value(value)? {
            Decoded::Block(block) => Ok(block),
            other => Err(SerializeError::NotABlock {
                found: other.type_name().to_string(),
            }
            .into()),
        }
    }
}

fn decode_typed<T: TypedBlock>(_: &Registry, data: Value) -> Result<Decoded> {
    let block: T = serde_json::from_value(data)?;
    block
        .validate()
        .map_err(|reason| SerializeError::InvalidBlock {
            block_type: T::TYPE_TAG,
            reason,
        })?;

    Ok(Decoded::Block(Box::new(block)))
}

pub(crate) fn envelope(type_tag: &str, data: Value) -> Result<Value> {
    let envelope = Envelope {
        type_tag: type_tag.to_string(),
        data,
    };
    Ok(serde_json::to_value(envelope)?)
}

/// Encodes a block with its type tag, or fails if it has no serialization capability.
pub fn encode_block(block: &dyn AnyBlock) -> Result<Value> {
    let serializable = block
        .as_serializable()
        .ok_or_else(|| SerializeError::Unsupported {
            block_type: block.block_type(),
        })?;

    envelope(serializable.type_tag(), serializable.encode()?)
}

#[cfg(test)]
mod tests {
    use crate::ml::{block::Parameterized, RngStrategy};

    use super::*;

    #[test]
    fn encoded_block_carries_type_tag() {
        let lstm = Lstm::new(1, 2, &RngStrategy::testable(1));
        let value = encode_block(&lstm).unwrap();

        assert_eq!(Some(Lstm::TYPE_TAG), value["type"].as_str());
        assert!(value["data"].is_object());
    }

    #[test]
    fn registry_decodes_registered_blocks() {
        let lstm = Lstm::new(2, 3, &RngStrategy::testable(2));
        let value = encode_block(&lstm).unwrap();

        let block = Registry::global().decode_block(value).unwrap();
        assert_eq!(Lstm::TYPE_TAG, block.block_type());

        let params = block.as_parameterized().unwrap().parameters();
        assert_eq!(lstm.parameters(), params);
    }

    #[test]
    fn registry_rejects_unknown_type_tags() {
        let lstm = Lstm::new(1, 1, &RngStrategy::testable(3));
        let value = encode_block(&lstm).unwrap();

        let err = Registry::new().decode_value(value).unwrap_err();
        match err.downcast_ref::<SerializeError>() {
            Some(SerializeError::UnknownType(tag)) => assert_eq!(Lstm::TYPE_TAG, tag.as_str()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn registry_rejects_malformed_envelopes() {
        assert!(Registry::global().decode(b"{\"data\": 1}").is_err());
        assert!(Registry::global().decode(b"not json").is_err());
    }
}
