//! Individual pipeline stages.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use super::{Payload, Stage};
use crate::Error;
use crate::cache::key::is_json_type;
use crate::models::{CachedResponse, headers};

const CONTENT_FIELD: &str = "_content";
const DECODED_FIELD: &str = "_decoded_content";

fn unexpected(stage: &str, got: &Payload) -> Error {
    Error::Deserialization(format!("{stage} stage cannot handle {}", got.kind()))
}

/// Converts a response to a document of primitive values and back.
///
/// With `decode_content`, JSON and `text/*` bodies are stored in readable
/// form under `_decoded_content` instead of base64 under `_content`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructureStage {
    pub decode_content: bool,
}

impl StructureStage {
    pub fn new(decode_content: bool) -> Self {
        Self { decode_content }
    }
}

impl Stage for StructureStage {
    fn dumps(&self, value: Payload) -> Result<Payload, Error> {
        let Payload::Response(response) = value else {
            return Err(Error::Serialization(format!("structure stage expects a response, got {}", value.kind())));
        };
        let mut document = serde_json::to_value(&*response).map_err(|e| Error::Serialization(e.to_string()))?;
        if self.decode_content {
            if let (Some(decoded), Value::Object(map)) = (decode_body(&response), &mut document) {
                map.remove(CONTENT_FIELD);
                map.insert(DECODED_FIELD.to_string(), decoded);
            }
        }
        Ok(Payload::Document(document))
    }

    fn loads(&self, value: Payload) -> Result<Payload, Error> {
        let Payload::Document(mut document) = value else {
            return Err(unexpected("structure", &value));
        };
        let decoded = match &mut document {
            Value::Object(map) => map.remove(DECODED_FIELD),
            _ => return Err(Error::Deserialization("stored document is not an object".into())),
        };
        let mut response: CachedResponse = serde_json::from_value(document)?;
        if let Some(decoded) = decoded {
            let json_body = response.content_type().is_some_and(|ct| is_json_type(&ct));
            let body = match decoded {
                Value::String(text) if !json_body => text.into_bytes(),
                other => serde_json::to_vec(&other)?,
            };
            headers::insert_str(&mut response.headers, "content-length", &body.len().to_string());
            response.content = Bytes::from(body);
            response.encoding = Some("utf-8".to_string());
        }
        Ok(Payload::Response(Box::new(response)))
    }
}

/// Readable form of a body, if its content type allows one.
fn decode_body(response: &CachedResponse) -> Option<Value> {
    if response.content.is_empty() {
        return None;
    }
    let content_type = response.content_type()?;
    if is_json_type(&content_type) {
        serde_json::from_slice(&response.content).ok()
    } else if content_type.starts_with("text/") {
        std::str::from_utf8(&response.content).ok().map(|text| Value::String(text.to_string()))
    } else {
        None
    }
}

/// Document to JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStage {
    pub pretty: bool,
}

impl Stage for JsonStage {
    fn dumps(&self, value: Payload) -> Result<Payload, Error> {
        let document = value.into_document()?;
        let text = if self.pretty { serde_json::to_string_pretty(&document) } else { serde_json::to_string(&document) }
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Payload::Text(text))
    }

    fn loads(&self, value: Payload) -> Result<Payload, Error> {
        let document: Value = match &value {
            Payload::Text(text) => serde_json::from_str(text)?,
            Payload::Bytes(bytes) => serde_json::from_slice(bytes)?,
            _ => return Err(unexpected("json", &value)),
        };
        Ok(Payload::Document(document))
    }
}

/// Document to YAML text.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlStage;

impl Stage for YamlStage {
    fn dumps(&self, value: Payload) -> Result<Payload, Error> {
        let document = value.into_document()?;
        let text = serde_yaml::to_string(&document).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Payload::Text(text))
    }

    fn loads(&self, value: Payload) -> Result<Payload, Error> {
        let document: Value = match &value {
            Payload::Text(text) => serde_yaml::from_str(text),
            Payload::Bytes(bytes) => serde_yaml::from_slice(bytes),
            _ => return Err(unexpected("yaml", &value)),
        }
        .map_err(|e| Error::Deserialization(e.to_string()))?;
        Ok(Payload::Document(document))
    }
}

/// Document to BSON bytes.
#[cfg(feature = "mongodb")]
#[derive(Debug, Clone, Copy, Default)]
pub struct BsonStage;

#[cfg(feature = "mongodb")]
impl Stage for BsonStage {
    fn dumps(&self, value: Payload) -> Result<Payload, Error> {
        let document = value.into_document()?;
        let bytes = mongodb::bson::to_vec(&document).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Payload::Bytes(bytes))
    }

    fn loads(&self, value: Payload) -> Result<Payload, Error> {
        let Payload::Bytes(bytes) = &value else {
            return Err(unexpected("bson", &value));
        };
        let document: Value =
            mongodb::bson::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))?;
        Ok(Payload::Document(document))
    }
}

/// Text to UTF-8 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Stage;

impl Stage for Utf8Stage {
    fn dumps(&self, value: Payload) -> Result<Payload, Error> {
        match value {
            Payload::Text(text) => Ok(Payload::Bytes(text.into_bytes())),
            Payload::Bytes(bytes) => Ok(Payload::Bytes(bytes)),
            other => Err(Error::Serialization(format!("utf-8 stage expects text, got {}", other.kind()))),
        }
    }

    fn loads(&self, value: Payload) -> Result<Payload, Error> {
        match value {
            Payload::Bytes(bytes) => String::from_utf8(bytes)
                .map(Payload::Text)
                .map_err(|e| Error::Deserialization(e.to_string())),
            Payload::Text(text) => Ok(Payload::Text(text)),
            other => Err(unexpected("utf-8", &other)),
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_LEN: usize = 32;

/// Prefixes bytes with an HMAC-SHA256 tag and rejects tampered payloads on load.
#[derive(Clone)]
pub struct SigningStage {
    secret_key: Vec<u8>,
}

impl std::fmt::Debug for SigningStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningStage").finish_non_exhaustive()
    }
}

impl SigningStage {
    pub fn new(secret_key: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let secret_key = secret_key.into();
        if secret_key.is_empty() {
            return Err(Error::Config("signing secret key must not be empty".into()));
        }
        Ok(Self { secret_key })
    }

    fn mac(&self) -> Result<HmacSha256, Error> {
        HmacSha256::new_from_slice(&self.secret_key).map_err(|e| Error::Config(e.to_string()))
    }
}

impl Stage for SigningStage {
    fn dumps(&self, value: Payload) -> Result<Payload, Error> {
        let body = value.into_bytes()?;
        let mut mac = self.mac()?;
        mac.update(&body);
        let mut signed = mac.finalize().into_bytes().to_vec();
        signed.extend_from_slice(&body);
        Ok(Payload::Bytes(signed))
    }

    fn loads(&self, value: Payload) -> Result<Payload, Error> {
        let Payload::Bytes(signed) = value else {
            return Err(unexpected("signing", &value));
        };
        if signed.len() < SIGNATURE_LEN {
            return Err(Error::Deserialization("signed payload too short".into()));
        }
        let (signature, body) = signed.split_at(SIGNATURE_LEN);
        let mut mac = self.mac()?;
        mac.update(body);
        mac.verify_slice(signature)
            .map_err(|_| Error::Deserialization("signature mismatch".into()))?;
        Ok(Payload::Bytes(body.to_vec()))
    }
}
