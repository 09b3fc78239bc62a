//! The four concrete pipelines and the registry the poller dispatches on.

pub mod committee;
pub mod evaluation;
pub mod ideas;
pub mod parse;
pub mod scan;

pub use committee::CommitteeBuildPipeline;
pub use evaluation::EvaluationPipeline;
pub use ideas::IdeaGenerationPipeline;
pub use scan::ScanPipeline;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use tracing::warn;

use crate::config::{DedupConfig, LifecycleConfig, ScanConfig};
use crate::error::{Error, JobError, ParseError};
use crate::jobs::{Job, JobType, Phase, PhaseContext, PhaseOutput, Pipeline};
use crate::llm::{Document, GenerationRequest};
use crate::movements::EvidenceFeed;
use crate::store::Database;

/// Pipelines by job type.
#[derive(Default, Clone)]
pub struct PipelineRegistry {
    pipelines: HashMap<JobType, Arc<dyn Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four standard pipelines.
    pub fn standard(
        db: Arc<dyn Database>,
        feed: Arc<dyn EvidenceFeed>,
        scan: &ScanConfig,
        lifecycle: &LifecycleConfig,
        dedup: &DedupConfig,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CommitteeBuildPipeline::new()));
        registry.register(Arc::new(EvaluationPipeline::new()));
        registry.register(Arc::new(IdeaGenerationPipeline::new()));
        registry.register(Arc::new(ScanPipeline::new(db, feed, scan, lifecycle, dedup)));
        registry
    }

    /// Register a pipeline, replacing any earlier one for the same job type.
    pub fn register(&mut self, pipeline: Arc<dyn Pipeline>) {
        let job_type = pipeline.job_type();
        if self.pipelines.insert(job_type, pipeline).is_some() {
            warn!(job_type = %job_type, "Replacing registered pipeline");
        }
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn Pipeline>> {
        self.pipelines.get(&job_type).cloned()
    }

    /// Registered job types in canonical order.
    pub fn job_types(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| self.pipelines.contains_key(t))
            .collect()
    }
}

/// Builds the user prompt of a [`PromptPhase`] from the job and prior artifacts.
pub type RenderFn = fn(&PhaseContext<'_>) -> Result<String, Error>;

/// Checks the generated text has the shape later phases rely on.
pub type ValidateFn = fn(&str) -> Result<(), ParseError>;

/// A phase that is one generation call: render, generate, validate.
///
/// Validation runs before the artifact is checkpointed, so a malformed
/// response fails the job without being stored and a re-queue regenerates it.
pub struct PromptPhase {
    name: &'static str,
    system: &'static str,
    max_tokens: u32,
    render: RenderFn,
    validate: ValidateFn,
    attach_documents: bool,
}

impl PromptPhase {
    pub fn new(name: &'static str, system: &'static str, render: RenderFn) -> Self {
        Self {
            name,
            system,
            max_tokens: 4096,
            render,
            validate: |text| non_empty(text, "generated text"),
            attach_documents: false,
        }
    }

    pub fn with_validator(mut self, validate: ValidateFn) -> Self {
        self.validate = validate;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Send the job's attached documents along with the prompt.
    pub fn with_documents(mut self) -> Self {
        self.attach_documents = true;
        self
    }
}

#[async_trait]
impl Phase for PromptPhase {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, Error> {
        let prompt = (self.render)(ctx)?;
        let mut request = GenerationRequest::new(self.system, prompt, self.max_tokens);
        if self.attach_documents {
            request = request.with_documents(job_documents(ctx.job)?);
        }

        let response = ctx.llm.generate(request).await?;
        (self.validate)(&response.text)?;
        Ok(response.into())
    }
}

/// Fail with `MissingField` unless the text has non-whitespace content.
pub fn non_empty(text: &str, context: &str) -> Result<(), ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::MissingField {
            field: "text".to_string(),
            context: context.to_string(),
        });
    }
    Ok(())
}

/// A required, non-blank string field of the job input.
pub fn required_input<'a>(job: &'a Job, key: &str) -> Result<&'a str, Error> {
    job.input_str(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            JobError::InvalidInput {
                id: job.id,
                reason: format!("missing '{key}'"),
            }
            .into()
        })
}

/// An optional string field of the job input, empty when absent.
pub fn optional_input<'a>(job: &'a Job, key: &str) -> &'a str {
    job.input_str(key).map(str::trim).unwrap_or("")
}

#[derive(Deserialize)]
struct EncodedDocument {
    name: String,
    #[serde(default = "default_mime_type")]
    mime_type: String,
    /// Base64 payload.
    data: String,
}

fn default_mime_type() -> String {
    "application/pdf".to_string()
}

/// Documents attached to the job input under `documents`, base64-decoded.
pub fn job_documents(job: &Job) -> Result<Vec<Document>, Error> {
    let Some(raw) = job.input.get("documents") else {
        return Ok(Vec::new());
    };

    let encoded: Vec<EncodedDocument> =
        serde_json::from_value(raw.clone()).map_err(|e| JobError::InvalidInput {
            id: job.id,
            reason: format!("invalid documents: {e}"),
        })?;

    encoded
        .into_iter()
        .map(|doc| {
            let data = BASE64
                .decode(doc.data.trim())
                .map_err(|e| JobError::InvalidInput {
                    id: job.id,
                    reason: format!("document '{}' is not valid base64: {e}", doc.name),
                })?;
            Ok(Document::new(doc.name, doc.mime_type, data))
        })
        .collect()
}
