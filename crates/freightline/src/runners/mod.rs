//! Built-in step runners.
//!
//! - `compose-output` - Publish its configuration as step output

mod compose_output;

pub use self::compose_output::ComposeOutputRunner;

use crate::registry::StepRunnerRegistry;

/// Create a runner registry with all built-in runners registered.
pub fn create_default_registry() -> StepRunnerRegistry {
    let mut registry = StepRunnerRegistry::new();

    registry.register(ComposeOutputRunner::new());

    registry
}
