//! Runner that turns its configuration into step output.
//!
//! Mostly used to give a task a single, well-named output composed from the
//! outputs of the steps inside it.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::context::StepContext;
use crate::error::StepError;
use crate::registry::StepRunner;
use crate::result::StepResult;

pub const KIND: &str = "compose-output";

/// Publishes its resolved config object as output.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComposeOutputRunner;

impl ComposeOutputRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepRunner for ComposeOutputRunner {
    fn name(&self) -> &str {
        KIND
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepResult, StepError> {
        let output: Map<String, Value> = ctx.config_as()?;
        tracing::debug!(alias = %ctx.alias, keys = output.len(), "Composed output");
        Ok(StepResult::succeeded().with_output(output))
    }
}
