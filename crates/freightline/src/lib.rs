//! Freightline Promotion Engine
//!
//! Executes the ordered steps that promote a Freight bundle into a Stage.
//!
//! This crate provides:
//! - Step runner framework with registry pattern
//! - Execution engine with skip conditions, retries, timeouts and resumption
//! - Template engine with `${{ }}` expressions and type coercion
//! - Freight lookup functions for step expressions
//! - Built-in runners: compose-output

pub mod checkpoint;
pub mod context;
pub mod engine;
pub mod error;
pub mod freight;
pub mod registry;
pub mod resolve;
pub mod result;
pub mod runners;
pub mod secrets;
pub mod state;
pub mod step;
pub mod template;

pub use checkpoint::PromotionCheckpoint;
pub use context::{PromotionContext, StepContext};
pub use engine::Engine;
pub use error::{ErrorClass, PromotionError, StepError, TemplateError};
pub use registry::{RetryDefaults, RetryableStepRunner, StepRunner, StepRunnerRegistry};
pub use result::{HealthCheckStep, PromotionResult, PromotionStatus, StepResult, StepStatus};
pub use secrets::{SecretResolver, StaticSecrets};
pub use state::{State, StepExecutionMetadata, StepExecutionMetadataList};
pub use step::{RetryPolicy, Step};
pub use template::TemplateEngine;
