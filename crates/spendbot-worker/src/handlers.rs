//! Per-kind job handlers.
//!
//! Each [`JobKind`] has one registered [`JobHandler`]. Handlers validate the
//! job payload, shape the provider request and return the document stored
//! as the job's result.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use spendbot_models::{Job, JobKind};

use crate::provider::{Provider, ProviderError, ProviderRequest};

pub type HandlerResult<T> = Result<T, HandlerError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("No handler registered for job type {0}")]
    Unsupported(JobKind),
}

impl HandlerError {
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Only transient provider failures are evidence that the provider is
    /// unhealthy.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, HandlerError::Provider(e) if e.is_transient())
    }

    pub fn is_provider_error(&self) -> bool {
        matches!(self, HandlerError::Provider(_))
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    async fn handle(&self, job: &Job) -> HandlerResult<Value>;
}

fn required_str<'a>(payload: &'a Value, field: &str) -> HandlerResult<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerError::invalid_payload(format!("`{}` must be a non-empty string", field)))
}

async fn call(provider: &dyn Provider, kind: JobKind, job: &Job, input: Value) -> HandlerResult<Value> {
    let request = ProviderRequest {
        task: kind.as_str().to_string(),
        user_id: job.user_id.clone(),
        input,
    };
    Ok(provider.call(&request).await?)
}

/// Spending analysis over a list of expenses.
pub struct AnalysisHandler {
    provider: Arc<dyn Provider>,
}

impl AnalysisHandler {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl JobHandler for AnalysisHandler {
    fn kind(&self) -> JobKind {
        JobKind::Analysis
    }

    async fn handle(&self, job: &Job) -> HandlerResult<Value> {
        let expenses = job
            .payload
            .get("expenses")
            .and_then(Value::as_array)
            .ok_or_else(|| HandlerError::invalid_payload("`expenses` must be an array"))?;
        let period = job.payload.get("period").and_then(Value::as_str);

        let analysis = call(
            self.provider.as_ref(),
            self.kind(),
            job,
            json!({ "expenses": expenses, "period": period }),
        )
        .await?;

        Ok(json!({
            "period": period,
            "expense_count": expenses.len(),
            "analysis": analysis,
        }))
    }
}

/// Categorize a free-text expense message, e.g. "lunch 12.50".
pub struct CategorizeHandler {
    provider: Arc<dyn Provider>,
}

impl CategorizeHandler {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl JobHandler for CategorizeHandler {
    fn kind(&self) -> JobKind {
        JobKind::Categorize
    }

    async fn handle(&self, job: &Job) -> HandlerResult<Value> {
        let text = required_str(&job.payload, "text")?;
        let output = call(self.provider.as_ref(), self.kind(), job, json!({ "text": text })).await?;

        let category = output
            .get("category")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidResponse("missing `category`".to_string()))?;

        Ok(json!({
            "text": text,
            "category": category,
            "amount": output.get("amount").cloned().unwrap_or(Value::Null),
        }))
    }
}

/// Extract an expense from a receipt image.
pub struct ReceiptHandler {
    provider: Arc<dyn Provider>,
}

impl ReceiptHandler {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl JobHandler for ReceiptHandler {
    fn kind(&self) -> JobKind {
        JobKind::Receipt
    }

    async fn handle(&self, job: &Job) -> HandlerResult<Value> {
        let image_url = required_str(&job.payload, "image_url")?;
        if !(image_url.starts_with("https://") || image_url.starts_with("http://")) {
            return Err(HandlerError::invalid_payload("`image_url` must be an http(s) URL"));
        }

        let receipt = call(
            self.provider.as_ref(),
            self.kind(),
            job,
            json!({ "image_url": image_url }),
        )
        .await?;

        Ok(json!({ "image_url": image_url, "receipt": receipt }))
    }
}

/// Handlers keyed by job kind.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handler for every job kind.
    pub fn with_provider(provider: Arc<dyn Provider>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AnalysisHandler::new(provider.clone())));
        registry.register(Arc::new(CategorizeHandler::new(provider.clone())));
        registry.register(Arc::new(ReceiptHandler::new(provider)));
        registry
    }

    /// Register a handler, replacing any previous one for its kind.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `job`'s kind.
    pub async fn dispatch(&self, job: &Job) -> HandlerResult<Value> {
        let handler = self.get(job.kind).ok_or(HandlerError::Unsupported(job.kind))?;
        handler.handle(job).await
    }
}
