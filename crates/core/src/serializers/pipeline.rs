use std::fmt;
use std::sync::Arc;

use super::Payload;
use crate::Error;
use crate::models::CachedResponse;

/// One reversible transformation step.
pub trait Stage: Send + Sync + fmt::Debug {
    fn dumps(&self, value: Payload) -> Result<Payload, Error>;
    fn loads(&self, value: Payload) -> Result<Payload, Error>;
}

/// An ordered composition of stages.
#[derive(Debug, Clone)]
pub struct SerializerPipeline {
    name: String,
    stages: Vec<Arc<dyn Stage>>,
    is_binary: bool,
    extension: Option<&'static str>,
}

impl SerializerPipeline {
    pub fn new(name: impl Into<String>, stages: Vec<Arc<dyn Stage>>, is_binary: bool) -> Self {
        Self { name: name.into(), stages, is_binary, extension: None }
    }

    /// File extension used by the filesystem backend.
    pub fn with_extension(mut self, extension: &'static str) -> Self {
        self.extension = Some(extension);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_binary(&self) -> bool {
        self.is_binary
    }

    pub fn extension(&self) -> &str {
        self.extension.unwrap_or(if self.is_binary { "bin" } else { "txt" })
    }

    pub fn stages(&self) -> usize {
        self.stages.len()
    }

    pub fn dumps(&self, response: &CachedResponse) -> Result<Payload, Error> {
        let mut value = Payload::from(response.clone());
        for stage in &self.stages {
            value = stage.dumps(value)?;
        }
        Ok(value)
    }

    /// Run the stages in reverse. Every failure is reported as [`Error::Deserialization`].
    pub fn loads(&self, payload: Payload) -> Result<CachedResponse, Error> {
        let mut value = payload;
        for stage in self.stages.iter().rev() {
            value = stage.loads(value).map_err(|e| match e {
                Error::Deserialization(_) => e,
                other => Error::Deserialization(other.to_string()),
            })?;
        }
        match value {
            Payload::Response(response) => Ok(*response),
            other => Err(Error::Deserialization(format!("pipeline produced {}, not a response", other.kind()))),
        }
    }
}
