//! The [`Handler`] contract and registry (§4.5). Reshapes the teacher's
//! `Effect<C, D>` trait — one object per `(source, card_type)`, executing
//! under a context, rather than one object per command type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::card::CardOutput;
use crate::error::AnalysisError;
use crate::job::RequestOptions;
use crate::source::Source;

/// Read-only view a handler needs to do its work: the job's canonical
/// input, its options, and the intra-job artifacts published by its
/// dependencies (§4.7 "context with ... the dict of intra-job artifacts
/// declared by deps").
#[derive(Clone)]
pub struct HandlerContext {
    pub input: Value,
    pub options: RequestOptions,
    pub artifacts: Arc<HashMap<String, Value>>,
    pub cancellation: CancellationToken,
}

impl HandlerContext {
    pub fn artifact(&self, card_type: &str) -> Option<&Value> {
        self.artifacts.get(card_type)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Result of a handler's `execute`/`fallback` call, before `normalize` runs.
/// `skip_validation` lets a handler that already knows its result is
/// authoritative (e.g. a fallback) bypass the `validate` step.
#[derive(Debug, Clone)]
pub struct CardResult {
    pub data: Value,
    pub is_fallback: bool,
    pub code: Option<String>,
    pub skip_validation: bool,
}

impl CardResult {
    pub fn ok(data: Value) -> Self {
        CardResult {
            data,
            is_fallback: false,
            code: None,
            skip_validation: false,
        }
    }

    pub fn fallback(data: Value, code: impl Into<String>) -> Self {
        CardResult {
            data,
            is_fallback: true,
            code: Some(code.into()),
            skip_validation: true,
        }
    }

    pub fn into_output(self, preserve_empty: bool) -> CardOutput {
        let mut output = if self.is_fallback {
            CardOutput::fallback(self.data, self.code.unwrap_or_else(|| "unknown".to_string()))
        } else {
            CardOutput::new(self.data)
        };
        output.meta.preserve_empty = preserve_empty;
        output
    }
}

/// One object bound to a single `(source, card_type)` pair, implementing
/// the execute/validate/fallback/normalize contract (§4.5).
#[async_trait]
pub trait Handler: Send + Sync {
    /// Computes the card's payload. May suspend on external I/O; must
    /// observe `ctx.cancellation` at every suspension point (§5).
    async fn execute(&self, ctx: &HandlerContext) -> Result<CardResult, AnalysisError>;

    /// Cheap structural/semantic check that `result` is usable. The
    /// default accepts everything; handlers with a meaningful schema
    /// should override this.
    async fn validate(&self, _result: &CardResult, _ctx: &HandlerContext) -> bool {
        true
    }

    /// Must always succeed — used once the quality-gate retry budget is
    /// exhausted (§4.7 quality gate).
    async fn fallback(&self, ctx: &HandlerContext, error: Option<&AnalysisError>) -> CardResult;

    /// Last-chance canonicalization: key order, numeric rounding, clamped
    /// list sizes. The default is the identity transform.
    fn normalize(&self, result: CardResult) -> CardResult {
        result
    }
}

/// Lookup table keyed by `(source, card_type)`, matching the teacher's
/// `CommandRegistry` table-lookup idiom in `job.rs`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, &'static str), Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Source, card_type: &'static str, handler: Arc<dyn Handler>) {
        self.handlers.insert((source.tag().to_string(), card_type), handler);
    }

    pub fn get(&self, source: &Source, card_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .get(&(source.tag().to_string(), card_type))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn execute(&self, ctx: &HandlerContext) -> Result<CardResult, AnalysisError> {
            Ok(CardResult::ok(ctx.input.clone()))
        }

        async fn fallback(&self, _ctx: &HandlerContext, _error: Option<&AnalysisError>) -> CardResult {
            CardResult::fallback(serde_json::json!({}), "upstream_unavailable")
        }
    }

    fn ctx() -> HandlerContext {
        HandlerContext {
            input: serde_json::json!({"content": "ABCDEF"}),
            options: RequestOptions::default(),
            artifacts: Arc::new(HashMap::new()),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn registry_looks_up_by_source_and_card_type() {
        let mut registry = HandlerRegistry::new();
        registry.register(Source::Scholar, "profile", Arc::new(EchoHandler));

        assert!(registry.get(&Source::Scholar, "profile").is_some());
        assert!(registry.get(&Source::Scholar, "papers").is_none());
        assert!(registry.get(&Source::Github, "profile").is_none());
    }

    #[tokio::test]
    async fn handler_execute_and_fallback() {
        let handler = EchoHandler;
        let context = ctx();
        let result = handler.execute(&context).await.unwrap();
        assert_eq!(result.data, context.input);

        let fallback = handler.fallback(&context, None).await;
        assert!(fallback.is_fallback);
    }
}
