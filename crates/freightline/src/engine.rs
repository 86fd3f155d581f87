//! Promotion execution engine.
//!
//! Drives an ordered list of steps through their runners, one at a time.
//! A single call to [`Engine::promote`] never waits on external conditions:
//! when a step is still running or failed in a retryable way the engine
//! returns a `running` result and the caller invokes it again later, resuming
//! from [`PromotionResult::current_step`].

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::context::{PromotionContext, Secrets, StepContext};
use crate::error::{PromotionError, StepError};
use crate::registry::{RegisteredRunner, StepRunner, StepRunnerRegistry};
use crate::resolve;
use crate::result::{HealthCheckStep, PromotionResult, PromotionStatus, StepResult, StepStatus};
use crate::secrets::{self, NoSecrets, SecretResolver};
use crate::step::{format_duration, resolve_aliases, Step};
use crate::template::TemplateEngine;

/// Executes promotion steps.
pub struct Engine {
    registry: Arc<StepRunnerRegistry>,
    templates: TemplateEngine,
    secrets: Arc<dyn SecretResolver>,
}

/// What happened to the step in flight.
enum Outcome {
    /// Move on to the next step.
    Continue,
    /// Stop this invocation with the given phase.
    Return(PromotionStatus, Option<String>),
}

/// Bookkeeping for one invocation that is not part of the context.
struct Invocation {
    work_dir: PathBuf,
    work_dir_created: bool,
    health_checks: Vec<HealthCheckStep>,
}

impl Invocation {
    fn finish(
        self,
        ctx: PromotionContext,
        status: PromotionStatus,
        message: Option<String>,
        current_step: usize,
    ) -> PromotionResult {
        PromotionResult {
            status,
            message,
            current_step,
            step_execution_metadata: ctx.step_execution_metadata,
            state: ctx.state,
            health_checks: self.health_checks,
            work_dir: self.work_dir,
            work_dir_created: self.work_dir_created,
        }
    }
}

impl Engine {
    /// Create an engine dispatching to the runners of `registry`.
    pub fn new(registry: Arc<StepRunnerRegistry>) -> Self {
        Self {
            registry,
            templates: TemplateEngine::new(),
            secrets: Arc::new(NoSecrets),
        }
    }

    pub fn with_template_engine(mut self, templates: TemplateEngine) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_secret_resolver(mut self, secrets: Arc<dyn SecretResolver>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn registry(&self) -> &StepRunnerRegistry {
        &self.registry
    }

    /// Run the promotion from `ctx.start_from_step` until it finishes or has
    /// to wait.
    ///
    /// Errors are returned only when the invocation cannot start (work
    /// directory or secrets). Everything that goes wrong once steps are
    /// being processed is reported through the result's status and message.
    pub async fn promote(
        &self,
        cancel: &CancellationToken,
        mut ctx: PromotionContext,
        steps: &[Step],
    ) -> Result<PromotionResult, PromotionError> {
        // Nothing is created on disk until secrets are known.
        let resolved = self
            .secrets
            .project_secrets(&ctx.project)
            .await
            .map_err(|message| PromotionError::Secrets {
                project: ctx.project.clone(),
                message,
            })?;
        let secrets = secrets::overlay(resolved, &ctx.secrets);

        let (work_dir, work_dir_created) = match ctx.work_dir.clone() {
            Some(dir) => {
                tokio::fs::create_dir_all(&dir).await?;
                (dir, false)
            }
            None => {
                let dir = std::env::temp_dir().join(format!("promotion-{}", uuid::Uuid::new_v4()));
                tokio::fs::create_dir_all(&dir).await?;
                (dir, true)
            }
        };
        let mut invocation = Invocation {
            work_dir,
            work_dir_created,
            health_checks: Vec::new(),
        };

        let start = ctx.start_from_step;
        let aliases = match resolve_aliases(steps) {
            Ok(aliases) => aliases,
            Err(e) => {
                tracing::error!(error = %e, "Invalid promotion steps");
                return Ok(invocation.finish(
                    ctx,
                    PromotionStatus::Errored,
                    Some(e.to_string()),
                    start,
                ));
            }
        };

        tracing::debug!(
            project = %ctx.project,
            promotion = %ctx.promotion,
            start,
            steps = steps.len(),
            "Executing promotion"
        );

        for (index, step) in steps.iter().enumerate().skip(start) {
            if cancel.is_cancelled() {
                tracing::warn!(step = index, "Promotion canceled");
                return Ok(invocation.finish(
                    ctx,
                    PromotionStatus::Errored,
                    Some("promotion canceled".to_string()),
                    index,
                ));
            }

            let alias = &aliases[index];
            let outcome = match self
                .execute_step(cancel, &mut ctx, &mut invocation, &secrets, step, index, alias)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(step = index, alias = %alias, kind = %step.kind, error = %e, "Step could not be executed");
                    let message = e.to_string();
                    let record = ctx.step_execution_metadata.ensure(index, alias);
                    record.status = StepStatus::Errored;
                    record.message = Some(message.clone());
                    record.finished_at = Some(Utc::now());
                    Outcome::Return(PromotionStatus::Errored, Some(message))
                }
            };

            if let Outcome::Return(status, message) = outcome {
                return Ok(invocation.finish(ctx, status, message, index));
            }
        }

        let worst = ctx.step_execution_metadata.worst_status();
        let status = PromotionStatus::from_worst_step(worst);
        let message = match status {
            PromotionStatus::Succeeded => None,
            _ => Some(format!("promotion finished with a {} step", worst)),
        };
        let last = steps.len().saturating_sub(1);
        tracing::info!(promotion = %ctx.promotion, status = %status, "Promotion finished");
        Ok(invocation.finish(ctx, status, message, last))
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_step(
        &self,
        cancel: &CancellationToken,
        ctx: &mut PromotionContext,
        invocation: &mut Invocation,
        secrets: &Secrets,
        step: &Step,
        index: usize,
        alias: &str,
    ) -> Result<Outcome, PromotionError> {
        let registered = self
            .registry
            .lookup(&step.kind)
            .ok_or_else(|| PromotionError::UnknownKind(step.kind.clone()))?;

        ctx.step_execution_metadata.ensure(index, alias).continue_on_error =
            step.continue_on_error;

        let functions = resolve::step_functions(ctx);
        let vars = resolve::resolve_vars(&self.templates, ctx, step, alias, &functions)?;
        let env = resolve::step_env(ctx, alias, vars, secrets);

        if resolve::should_skip(
            &self.templates,
            step,
            alias,
            &env,
            &functions,
            &ctx.step_execution_metadata,
        )? {
            let record = ctx.step_execution_metadata.ensure(index, alias);
            record.status = StepStatus::Skipped;
            record.message = None;
            tracing::debug!(step = index, alias = %alias, kind = %step.kind, "Step skipped");
            return Ok(Outcome::Continue);
        }

        {
            let record = ctx.step_execution_metadata.ensure(index, alias);
            record.status = StepStatus::Running;
            if record.started_at.is_none() {
                record.started_at = Some(Utc::now());
            }
        }

        let config = resolve::resolve_config(&self.templates, step, alias, &env, &functions)?;

        tracing::debug!(step = index, alias = %alias, kind = %step.kind, "Running step");
        let step_ctx = StepContext {
            alias: alias.to_string(),
            work_dir: invocation.work_dir.clone(),
            config,
            shared_state: ctx.state.clone(),
            project: ctx.project.clone(),
            stage: ctx.stage.clone(),
            promotion: ctx.promotion.clone(),
            actor: ctx.actor.clone(),
            ui_base_url: ctx.ui_base_url.clone(),
            freight_requests: ctx.freight_requests.clone(),
            freight: ctx.freight.clone(),
            target_freight_ref: ctx.target_freight_ref.clone(),
            cancel: cancel.child_token(),
        };

        let (mut result, error) = match run_isolated(Arc::clone(&registered.runner), step_ctx).await
        {
            Ok(result) => (result, None),
            Err(mut e) => {
                let result = e
                    .take_result()
                    .unwrap_or_else(|| StepResult::new(StepStatus::Errored));
                (result, Some(e))
            }
        };

        if let Some(output) = result.output.take() {
            ctx.state.record_output(alias, output);
        }

        // An error forces `errored` unless the runner reported `failed`.
        let error = match (result.status, error) {
            (StepStatus::Failed, error) => error,
            (_, Some(error)) => {
                result.status = StepStatus::Errored;
                Some(error)
            }
            (StepStatus::Errored, None) => Some(StepError::retryable(
                result
                    .message
                    .clone()
                    .unwrap_or_else(|| "step reported errored status without an error".to_string()),
            )),
            (_, None) => None,
        };

        if !result.status.is_valid_runner_status() {
            return Err(PromotionError::InvalidStatus {
                alias: alias.to_string(),
                status: result.status,
            });
        }

        Ok(self.settle(ctx, invocation, step, index, alias, &registered, result, error))
    }

    /// Record the outcome of an attempt and decide how to proceed.
    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        ctx: &mut PromotionContext,
        invocation: &mut Invocation,
        step: &Step,
        index: usize,
        alias: &str,
        registered: &RegisteredRunner,
        result: StepResult,
        error: Option<StepError>,
    ) -> Outcome {
        let retry = step.retry.clone().unwrap_or_default();
        let threshold = retry
            .error_threshold()
            .or(registered.defaults.error_threshold)
            .unwrap_or(1);
        let timeout = retry.timeout().or(registered.defaults.timeout);

        let record = ctx.step_execution_metadata.ensure(index, alias);
        record.status = result.status;
        record.message = result.message.clone();

        let terminal = |record: &mut crate::state::StepExecutionMetadata,
                        status: StepStatus,
                        message: String|
         -> Outcome {
            record.status = status;
            record.message = Some(message.clone());
            record.finished_at = Some(Utc::now());
            if step.continue_on_error {
                tracing::warn!(step = index, alias = %alias, status = %status, error = %message, "Step failed, continuing");
                return Outcome::Continue;
            }
            tracing::error!(step = index, alias = %alias, status = %status, error = %message, "Step failed");
            let phase = PromotionStatus::from_worst_step(status);
            Outcome::Return(phase, Some(format!("step '{}': {}", alias, message)))
        };

        match result.status {
            StepStatus::Succeeded | StepStatus::Skipped => {
                record.finished_at = Some(Utc::now());
                if let Some(health_check) = result.health_check {
                    invocation.health_checks.push(health_check);
                }
                tracing::info!(step = index, alias = %alias, kind = %step.kind, status = %result.status, "Step completed");
                Outcome::Continue
            }
            StepStatus::Failed | StepStatus::Aborted => {
                let message = error
                    .map(|e| e.to_string())
                    .or(result.message)
                    .unwrap_or_else(|| format!("step {}", result.status));
                terminal(record, result.status, message)
            }
            StepStatus::Running => {
                record.error_count = 0;
                if let Some(message) = timed_out(record, timeout) {
                    return terminal(record, StepStatus::Errored, message);
                }
                tracing::debug!(step = index, alias = %alias, "Step is still running");
                Outcome::Return(PromotionStatus::Running, result.message)
            }
            StepStatus::Errored | StepStatus::Pending => {
                let Some(error) = error else {
                    return terminal(record, StepStatus::Errored, "step errored".to_string());
                };
                if error.is_terminal() {
                    return terminal(record, StepStatus::Errored, error.to_string());
                }

                record.error_count += 1;
                if record.error_count >= threshold {
                    let message = format!(
                        "step failed after {} attempt(s), reaching the error threshold of {}: {}",
                        record.error_count, threshold, error
                    );
                    return terminal(record, StepStatus::Errored, message);
                }
                if let Some(message) = timed_out(record, timeout) {
                    return terminal(record, StepStatus::Errored, format!("{}: {}", message, error));
                }

                let message = format!("{}; will be retried", error);
                record.status = StepStatus::Running;
                record.message = Some(message.clone());
                tracing::warn!(
                    step = index,
                    alias = %alias,
                    error_count = record.error_count,
                    error = %error,
                    "Step errored, will be retried"
                );
                Outcome::Return(PromotionStatus::Running, Some(message))
            }
        }
    }
}

/// The timeout message if the step has run longer than `timeout`.
fn timed_out(
    record: &crate::state::StepExecutionMetadata,
    timeout: Option<Duration>,
) -> Option<String> {
    let timeout = timeout?;
    let started_at = record.started_at?;
    let elapsed = (Utc::now() - started_at).to_std().unwrap_or(Duration::ZERO);
    (elapsed > timeout).then(|| format!("step timed out after {}", format_duration(timeout)))
}

/// Run a step on its own task so a panicking runner cannot take the engine
/// down with it.
async fn run_isolated(
    runner: Arc<dyn StepRunner>,
    ctx: StepContext,
) -> Result<StepResult, StepError> {
    let handle = tokio::spawn(async move { runner.run(&ctx).await });
    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let payload = match payload.downcast::<StepError>() {
                Ok(error) => return Err(*error),
                Err(payload) => payload,
            };
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(StepError::retryable(format!("step panicked: {}", message)))
        }
        Err(e) => Err(StepError::retryable(format!("step task failed: {}", e))),
    }
}
