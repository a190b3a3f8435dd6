//! Conversion between [`CachedResponse`] and what a storage backend accepts.
//!
//! A [`SerializerPipeline`] is an ordered list of [`Stage`]s. The first stage
//! always turns a response into a plain document; later stages turn that into
//! text or bytes. `dumps` runs the stages forward, `loads` in reverse.

pub mod pipeline;
pub mod preconf;
pub mod stages;

use crate::Error;
use crate::models::CachedResponse;

pub use pipeline::{SerializerPipeline, Stage};
pub use preconf::{SERIALIZER_NAMES, init_serializer, safe_json_serializer};

/// A value at some point in the pipeline.
#[derive(Debug, Clone)]
pub enum Payload {
    Response(Box<CachedResponse>),
    Document(serde_json::Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Response(_) => "response",
            Payload::Document(_) => "document",
            Payload::Text(_) => "text",
            Payload::Bytes(_) => "bytes",
        }
    }

    /// Raw bytes for byte- or text-oriented stores.
    pub fn into_bytes(self) -> Result<Vec<u8>, Error> {
        match self {
            Payload::Bytes(bytes) => Ok(bytes),
            Payload::Text(text) => Ok(text.into_bytes()),
            other => Err(Error::Serialization(format!("expected bytes, got {}", other.kind()))),
        }
    }

    /// Document value for document-oriented stores.
    pub fn into_document(self) -> Result<serde_json::Value, Error> {
        match self {
            Payload::Document(value) => Ok(value),
            other => Err(Error::Serialization(format!("expected a document, got {}", other.kind()))),
        }
    }

    /// Approximate stored size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Payload::Response(response) => response.size(),
            Payload::Document(value) => value.to_string().len(),
            Payload::Text(text) => text.len(),
            Payload::Bytes(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<CachedResponse> for Payload {
    fn from(response: CachedResponse) -> Self {
        Payload::Response(Box::new(response))
    }
}
