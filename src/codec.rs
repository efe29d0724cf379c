// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Codecs
//!
//! Serializers selected by the content type configured for a publish target
//! or a subscription. Encoding works on `serde_json::Value` so that codecs
//! stay object safe. Decoding goes through a [`DecodeTarget`] provided by the
//! typed handler: text formats that lose the value types (XML carries every
//! leaf as text) deserialize straight into the event type.
//!
//! `Json` and `Xml` are registered by default.

use crate::errors::MessagingError;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

pub const JSON_CONTENT_TYPE: &str = "Json";
pub const JSON_MIME_TYPE: &str = "application/json";
pub const XML_CONTENT_TYPE: &str = "Xml";
pub const XML_MIME_TYPE: &str = "application/xml";

/// Root element of XML bodies. Readers ignore its name.
pub const XML_ROOT_ELEMENT: &str = "Message";

/// Typed destination of a decoded body.
pub trait DecodeTarget {
    /// Takes a body decoded into a JSON value.
    fn from_value(&mut self, value: Value) -> Result<(), MessagingError>;

    /// Takes an XML body, deserialized into the target type.
    fn from_xml(&mut self, body: &[u8]) -> Result<(), MessagingError>;
}

/// Encodes and decodes message bodies of one content type.
pub trait MessageCodec: Send + Sync {
    /// Content type key used in configuration, matched case-insensitively.
    fn content_type(&self) -> &str;

    /// MIME type written to the outgoing message properties.
    fn mime_type(&self) -> &str;

    fn encode(&self, value: &Value) -> Result<Vec<u8>, MessagingError>;

    /// Decodes the body into `target`. Custom codecs usually build a
    /// [`Value`] and hand it to [`DecodeTarget::from_value`].
    fn decode(&self, body: &[u8], target: &mut dyn DecodeTarget) -> Result<(), MessagingError>;
}

/// JSON codec backed by serde_json.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn mime_type(&self) -> &str {
        JSON_MIME_TYPE
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(value).map_err(|e| MessagingError::Serialization(e.to_string()))
    }

    fn decode(&self, body: &[u8], target: &mut dyn DecodeTarget) -> Result<(), MessagingError> {
        let value = serde_json::from_slice(body)
            .map_err(|e| MessagingError::Deserialization(e.to_string()))?;
        target.from_value(value)
    }
}

/// XML codec backed by quick-xml. Fields become child elements of a
/// [`XML_ROOT_ELEMENT`] root; sequences repeat their element.
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlCodec;

impl MessageCodec for XmlCodec {
    fn content_type(&self) -> &str {
        XML_CONTENT_TYPE
    }

    fn mime_type(&self) -> &str {
        XML_MIME_TYPE
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, MessagingError> {
        quick_xml::se::to_string_with_root(XML_ROOT_ELEMENT, value)
            .map(String::into_bytes)
            .map_err(|e| MessagingError::Serialization(e.to_string()))
    }

    fn decode(&self, body: &[u8], target: &mut dyn DecodeTarget) -> Result<(), MessagingError> {
        target.from_xml(body)
    }
}

/// Codecs by content type.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn MessageCodec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self {
            codecs: HashMap::default(),
        };
        registry.register(Arc::new(JsonCodec));
        registry.register(Arc::new(XmlCodec));
        registry
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a codec, replacing the one with the same content type.
    pub fn register(&mut self, codec: Arc<dyn MessageCodec>) -> &mut Self {
        self.codecs
            .insert(codec.content_type().trim().to_lowercase(), codec);
        self
    }

    pub fn get(&self, content_type: &str) -> Result<Arc<dyn MessageCodec>, MessagingError> {
        self.codecs
            .get(&content_type.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| MessagingError::CodecNotFound(content_type.to_owned()))
    }

    /// Decodes `body` into `E` with the codec of the content type.
    pub fn decode<E: DeserializeOwned>(
        &self,
        content_type: &str,
        body: &[u8],
    ) -> Result<E, MessagingError> {
        let codec = self.get(content_type)?;
        let mut target = Decoded::<E>(None);
        codec.decode(body, &mut target)?;

        target.0.ok_or_else(|| {
            MessagingError::Deserialization(format!(
                "codec `{}` produced no value",
                codec.content_type()
            ))
        })
    }
}

struct Decoded<E>(Option<E>);

impl<E: DeserializeOwned> DecodeTarget for Decoded<E> {
    fn from_value(&mut self, value: Value) -> Result<(), MessagingError> {
        self.0 = Some(from_value(value)?);
        Ok(())
    }

    fn from_xml(&mut self, body: &[u8]) -> Result<(), MessagingError> {
        let event = quick_xml::de::from_reader(body)
            .map_err(|e| MessagingError::Deserialization(e.to_string()))?;
        self.0 = Some(event);
        Ok(())
    }
}

pub(crate) fn to_value<E: Serialize>(event: &E) -> Result<Value, MessagingError> {
    serde_json::to_value(event).map_err(|e| MessagingError::Serialization(e.to_string()))
}

pub(crate) fn from_value<E: DeserializeOwned>(value: Value) -> Result<E, MessagingError> {
    serde_json::from_value(value).map_err(|e| MessagingError::Deserialization(e.to_string()))
}
