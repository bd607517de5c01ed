//! Built-in processors declared in `[[pipeline.processors]]`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use stitchwork_shared::{BuiltinProcessorConfig, RawEntity};

use crate::pipeline::{Processor, ProcessorError, ProcessorOutput, RunContext};

/// Copies named top-level fields of an object payload into metadata.
///
/// Missing fields are skipped. A payload that is not a JSON object is a fatal
/// error: no later attempt can succeed on the same input.
#[derive(Debug, Clone)]
pub struct CopyFields {
    id: String,
    stage: String,
    fields: Vec<String>,
    prefix: Option<String>,
}

impl CopyFields {
    pub fn new(
        id: impl Into<String>,
        stage: impl Into<String>,
        fields: Vec<String>,
        prefix: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            stage: stage.into(),
            fields,
            prefix,
        }
    }

    fn key(&self, field: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}{field}"),
            None => field.to_string(),
        }
    }
}

#[async_trait]
impl Processor for CopyFields {
    fn id(&self) -> &str {
        &self.id
    }

    fn stage(&self) -> &str {
        &self.stage
    }

    async fn process(
        &self,
        raw: &RawEntity,
        _ctx: &RunContext,
    ) -> Result<ProcessorOutput, ProcessorError> {
        let object = raw.payload.as_object().ok_or_else(|| {
            ProcessorError::fatal(format!(
                "payload of {}/{} is not a JSON object",
                raw.provider_id, raw.external_id
            ))
        })?;

        let mut output = ProcessorOutput::new();
        for field in &self.fields {
            if let Some(value) = object.get(field) {
                output = output.with_field(self.key(field), value.clone());
            } else {
                debug!(processor = %self.id, field = %field, "field absent from payload");
            }
        }
        Ok(output)
    }
}

/// Instantiate the processors declared in configuration, in declaration order.
pub fn from_config(configs: &[BuiltinProcessorConfig]) -> Vec<Arc<dyn Processor>> {
    configs
        .iter()
        .map(|config| match config {
            BuiltinProcessorConfig::CopyFields {
                id,
                stage,
                fields,
                prefix,
            } => Arc::new(CopyFields::new(
                id.clone(),
                stage.clone(),
                fields.clone(),
                prefix.clone(),
            )) as Arc<dyn Processor>,
        })
        .collect()
}
