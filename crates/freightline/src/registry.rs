//! Step runner registry and dispatch.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::context::StepContext;
use crate::error::StepError;
use crate::result::StepResult;

/// Trait for implementing the work of one step kind.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Returns the step kind this runner handles.
    fn name(&self) -> &str;

    /// Execute the step.
    async fn run(&self, ctx: &StepContext) -> Result<StepResult, StepError>;

    /// Retry defaults declared by the runner, if it declares any.
    fn as_retryable(&self) -> Option<&dyn RetryableStepRunner> {
        None
    }
}

/// Runners that declare their own retry defaults.
///
/// Consulted when a step carries no retry policy of its own.
pub trait RetryableStepRunner {
    /// Maximum time since the first attempt before the step errors.
    fn default_timeout(&self) -> Option<Duration>;

    /// Consecutive errors tolerated before the step errors.
    fn default_error_threshold(&self) -> u32;
}

/// Per-kind retry defaults registered alongside a runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryDefaults {
    pub timeout: Option<Duration>,
    pub error_threshold: Option<u32>,
}

struct Registration {
    runner: Arc<dyn StepRunner>,
    defaults: RetryDefaults,
}

/// A registered runner together with its effective retry defaults.
#[derive(Clone)]
pub struct RegisteredRunner {
    pub runner: Arc<dyn StepRunner>,
    pub defaults: RetryDefaults,
}

/// Registry of available step runners, keyed by step kind.
pub struct StepRunnerRegistry {
    runners: HashMap<String, Registration>,
}

impl StepRunnerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            runners: HashMap::new(),
        }
    }

    /// Register a runner under its name.
    pub fn register<R: StepRunner + 'static>(&mut self, runner: R) {
        self.register_with_defaults(runner, RetryDefaults::default());
    }

    /// Register a runner with per-kind retry defaults. These take precedence
    /// over any defaults the runner declares itself.
    pub fn register_with_defaults<R: StepRunner + 'static>(
        &mut self,
        runner: R,
        defaults: RetryDefaults,
    ) {
        self.register_arc(Arc::new(runner), defaults);
    }

    /// Register an already shared runner.
    pub fn register_arc(&mut self, runner: Arc<dyn StepRunner>, defaults: RetryDefaults) {
        let name = runner.name().to_string();
        self.runners.insert(name, Registration { runner, defaults });
    }

    /// Get a runner by kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn StepRunner>> {
        self.runners.get(kind).map(|r| Arc::clone(&r.runner))
    }

    /// Look up a runner and resolve its retry defaults.
    pub fn lookup(&self, kind: &str) -> Option<RegisteredRunner> {
        let registration = self.runners.get(kind)?;
        let declared = registration.runner.as_retryable();
        let defaults = RetryDefaults {
            timeout: registration
                .defaults
                .timeout
                .or_else(|| declared.and_then(|r| r.default_timeout())),
            error_threshold: registration
                .defaults
                .error_threshold
                .filter(|t| *t > 0)
                .or_else(|| {
                    declared
                        .map(|r| r.default_error_threshold())
                        .filter(|t| *t > 0)
                }),
        };
        Some(RegisteredRunner {
            runner: Arc::clone(&registration.runner),
            defaults,
        })
    }

    /// Check if a kind is registered.
    pub fn has(&self, kind: &str) -> bool {
        self.runners.contains_key(kind)
    }

    /// List all registered kinds, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.runners.keys().map(|s| s.as_str()).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for StepRunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StepRunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunnerRegistry")
            .field("runners", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockRunner;

    #[async_trait]
    impl StepRunner for MockRunner {
        fn name(&self) -> &str {
            "mock"
        }

        async fn run(&self, _ctx: &StepContext) -> Result<StepResult, StepError> {
            Ok(StepResult::succeeded())
        }
    }

    struct SlowRunner;

    #[async_trait]
    impl StepRunner for SlowRunner {
        fn name(&self) -> &str {
            "slow"
        }

        async fn run(&self, _ctx: &StepContext) -> Result<StepResult, StepError> {
            Ok(StepResult::running())
        }

        fn as_retryable(&self) -> Option<&dyn RetryableStepRunner> {
            Some(self)
        }
    }

    impl RetryableStepRunner for SlowRunner {
        fn default_timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(300))
        }

        fn default_error_threshold(&self) -> u32 {
            5
        }
    }

    #[test]
    fn test_registry_new() {
        let registry = StepRunnerRegistry::new();
        assert!(registry.list().is_empty());
        assert!(registry.lookup("mock").is_none());
    }

    #[test]
    fn test_registry_register() {
        let mut registry = StepRunnerRegistry::new();
        registry.register(MockRunner);
        registry.register(SlowRunner);

        assert!(registry.has("mock"));
        assert!(!registry.has("unknown"));
        assert_eq!(registry.list(), vec!["mock", "slow"]);
        assert_eq!(registry.get("mock").unwrap().name(), "mock");
    }

    #[test]
    fn test_lookup_declared_defaults() {
        let mut registry = StepRunnerRegistry::new();
        registry.register(MockRunner);
        registry.register(SlowRunner);

        let mock = registry.lookup("mock").unwrap();
        assert_eq!(mock.defaults, RetryDefaults::default());

        let slow = registry.lookup("slow").unwrap();
        assert_eq!(slow.defaults.timeout, Some(Duration::from_secs(300)));
        assert_eq!(slow.defaults.error_threshold, Some(5));
    }

    #[test]
    fn test_registered_defaults_override_declared() {
        let mut registry = StepRunnerRegistry::new();
        registry.register_with_defaults(
            SlowRunner,
            RetryDefaults {
                timeout: None,
                error_threshold: Some(2),
            },
        );

        let slow = registry.lookup("slow").unwrap();
        assert_eq!(slow.defaults.error_threshold, Some(2));
        assert_eq!(slow.defaults.timeout, Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_registry_run() {
        let mut registry = StepRunnerRegistry::new();
        registry.register(MockRunner);

        let ctx = StepContext {
            alias: "step-0".to_string(),
            work_dir: std::env::temp_dir(),
            config: serde_json::Value::Null,
            shared_state: Default::default(),
            project: "demo".to_string(),
            stage: "dev".to_string(),
            promotion: "dev.01".to_string(),
            actor: String::new(),
            ui_base_url: String::new(),
            freight_requests: vec![],
            freight: Default::default(),
            target_freight_ref: Default::default(),
            cancel: Default::default(),
        };
        let result = registry.get("mock").unwrap().run(&ctx).await.unwrap();
        assert_eq!(result.status, crate::result::StepStatus::Succeeded);
    }
}
