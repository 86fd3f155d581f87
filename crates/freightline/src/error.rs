//! Error types for template evaluation, promotion execution and step runners.

use thiserror::Error;

use crate::result::{StepResult, StepStatus};

/// Errors raised while evaluating templates and expressions.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// An expression span was opened but never closed.
    #[error("unterminated expression starting at byte {0}")]
    Unterminated(usize),

    /// The expression could not be compiled.
    #[error("failed to compile expression '{expr}': {message}")]
    Compile { expr: String, message: String },

    /// The expression compiled but failed at evaluation time.
    #[error("failed to evaluate expression '{expr}': {message}")]
    Evaluate { expr: String, message: String },

    /// The environment contains a key reserved for a built-in function.
    #[error("'{0}' is a forbidden key in the expression environment")]
    ForbiddenKey(String),

    /// The JSON template document is not valid JSON.
    #[error("invalid JSON template: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine-level configuration and fatal errors.
///
/// None of these are retried: a promotion hitting one of them ends as
/// `errored`.
#[derive(Debug, Error)]
pub enum PromotionError {
    /// No runner is registered for the step kind.
    #[error("no runner registered for step kind '{0}'")]
    UnknownKind(String),

    /// The alias of a step is not acceptable.
    #[error("step {index} has invalid alias '{alias}': {reason}")]
    InvalidAlias {
        index: usize,
        alias: String,
        reason: String,
    },

    /// Two steps resolve to the same alias.
    #[error("step alias '{0}' is not unique")]
    DuplicateAlias(String),

    /// The `if` condition of a step did not evaluate to a boolean.
    #[error("if condition of step '{alias}' must evaluate to a boolean, got {found}")]
    InvalidCondition { alias: String, found: String },

    /// A runner reported a status the engine does not accept from runners.
    #[error("step '{alias}' returned invalid status '{status}'")]
    InvalidStatus { alias: String, status: StepStatus },

    /// The step configuration did not evaluate to an object.
    #[error("config of step '{alias}' must evaluate to an object or null, got {found}")]
    InvalidConfig { alias: String, found: String },

    /// Template evaluation error.
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// Secrets could not be resolved for the project.
    #[error("failed to resolve secrets for project '{project}': {message}")]
    Secrets { project: String, message: String },

    /// I/O error (work directory management).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether retrying a failed step can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The step may succeed if attempted again.
    Retryable,
    /// Retrying cannot help; the promotion fails immediately.
    Terminal,
}

/// Error returned by a step runner.
///
/// The classification is always explicit. A runner that wants to report
/// output or a `failed` status alongside the error attaches a partial
/// result with [`StepError::with_result`].
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StepError {
    message: String,
    class: ErrorClass,
    result: Option<StepResult>,
}

impl StepError {
    /// A recoverable error, retried up to the step's error threshold.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: ErrorClass::Retryable,
            result: None,
        }
    }

    /// An unrecoverable error that fails the promotion immediately.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: ErrorClass::Terminal,
            result: None,
        }
    }

    /// Attach the partial result produced before the error occurred.
    pub fn with_result(mut self, result: StepResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn class(&self) -> ErrorClass {
        self.class
    }

    pub fn is_terminal(&self) -> bool {
        self.class == ErrorClass::Terminal
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Take the attached partial result, if any.
    pub fn take_result(&mut self) -> Option<StepResult> {
        self.result.take()
    }
}

impl From<serde_json::Error> for StepError {
    fn from(e: serde_json::Error) -> Self {
        StepError::terminal(format!("invalid step config: {}", e))
    }
}

impl From<std::io::Error> for StepError {
    fn from(e: std::io::Error) -> Self {
        StepError::retryable(format!("I/O error: {}", e))
    }
}
