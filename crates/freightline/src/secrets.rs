//! Project secret resolution.
//!
//! The engine resolves the secrets of a project once per invocation and
//! exposes them to step configuration as `secrets.<name>.<key>`.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::context::Secrets;

/// Resolves the secrets available to a project.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Return all secrets of the project, keyed by secret name.
    async fn project_secrets(&self, project: &str) -> Result<Secrets, String>;
}

/// Resolver that knows no secrets.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecrets;

#[async_trait]
impl SecretResolver for NoSecrets {
    async fn project_secrets(&self, _project: &str) -> Result<Secrets, String> {
        Ok(Secrets::new())
    }
}

/// In-memory secrets keyed by project.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    projects: BTreeMap<String, Secrets>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret value for a project.
    pub fn with_secret(
        mut self,
        project: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.projects
            .entry(project.into())
            .or_default()
            .entry(name.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretResolver for StaticSecrets {
    async fn project_secrets(&self, project: &str) -> Result<Secrets, String> {
        Ok(self.projects.get(project).cloned().unwrap_or_default())
    }
}

/// Overlay caller supplied secrets on resolved ones, key by key.
pub fn overlay(mut resolved: Secrets, overrides: &Secrets) -> Secrets {
    for (name, values) in overrides {
        let entry = resolved.entry(name.clone()).or_default();
        for (key, value) in values {
            entry.insert(key.clone(), value.clone());
        }
    }
    resolved
}
