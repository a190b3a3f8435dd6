//! Named serializer presets.

use std::sync::Arc;

use super::SerializerPipeline;
use super::stages::{JsonStage, SigningStage, StructureStage, Utf8Stage, YamlStage};
use crate::Error;

/// Names accepted by [`init_serializer`].
pub const SERIALIZER_NAMES: &[&str] = &["json", "yaml", "bson", "document", "none", "safe_json"];

/// Build a serializer by name.
///
/// `safe_json` needs `secret_key`; it is ignored by the other presets.
pub fn init_serializer(name: &str, decode_content: bool, secret_key: Option<&str>) -> Result<SerializerPipeline, Error> {
    let structure = Arc::new(StructureStage::new(decode_content));
    let pipeline = match name.trim().to_ascii_lowercase().as_str() {
        "json" => SerializerPipeline::new(
            "json",
            vec![structure, Arc::new(JsonStage { pretty: decode_content }), Arc::new(Utf8Stage)],
            true,
        )
        .with_extension("json"),
        "yaml" => SerializerPipeline::new("yaml", vec![structure, Arc::new(YamlStage), Arc::new(Utf8Stage)], true)
            .with_extension("yaml"),
        "bson" => bson_serializer(decode_content)?,
        "document" => SerializerPipeline::new("document", vec![structure], false),
        "none" => SerializerPipeline::new("none", Vec::new(), false),
        "safe_json" => {
            let key = secret_key
                .filter(|k| !k.is_empty())
                .ok_or_else(|| Error::Config("serializer `safe_json` requires a secret_key".into()))?;
            safe_json_serializer(key.as_bytes(), decode_content)?
        }
        other => {
            return Err(Error::UnknownSerializer { name: other.to_string(), expected: SERIALIZER_NAMES.join(", ") });
        }
    };
    tracing::debug!(serializer = pipeline.name(), decode_content, "initialized serializer");
    Ok(pipeline)
}

/// JSON serializer whose output is signed with HMAC-SHA256.
pub fn safe_json_serializer(secret_key: &[u8], decode_content: bool) -> Result<SerializerPipeline, Error> {
    Ok(SerializerPipeline::new(
        "safe_json",
        vec![
            Arc::new(StructureStage::new(decode_content)),
            Arc::new(JsonStage::default()),
            Arc::new(Utf8Stage),
            Arc::new(SigningStage::new(secret_key)?),
        ],
        true,
    )
    .with_extension("json"))
}

#[cfg(feature = "mongodb")]
fn bson_serializer(decode_content: bool) -> Result<SerializerPipeline, Error> {
    use super::stages::BsonStage;
    Ok(SerializerPipeline::new(
        "bson",
        vec![Arc::new(StructureStage::new(decode_content)), Arc::new(BsonStage)],
        true,
    )
    .with_extension("bson"))
}

#[cfg(not(feature = "mongodb"))]
fn bson_serializer(_decode_content: bool) -> Result<SerializerPipeline, Error> {
    Err(Error::MissingDependency { backend: "bson serializer", feature: "mongodb" })
}
