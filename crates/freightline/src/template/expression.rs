//! Embedded expression language.
//!
//! The template engine only needs to evaluate one expression against an
//! environment with a set of extra functions. [`ExpressionLanguage`] is that
//! seam; [`Jinja`] implements it with minijinja.

use minijinja::value::Rest;
use minijinja::{Environment, ErrorKind, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::filters;
use crate::error::TemplateError;

/// A caller supplied expression function.
pub type ExprFn =
    Arc<dyn Fn(&[serde_json::Value]) -> Result<serde_json::Value, String> + Send + Sync>;

/// Named functions made available to an evaluation.
#[derive(Clone, Default)]
pub struct Functions {
    inner: BTreeMap<String, ExprFn>,
}

impl Functions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function, replacing any function of the same name.
    pub fn insert<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[serde_json::Value]) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        self.inner.insert(name.into(), Arc::new(f));
    }

    pub fn with<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[serde_json::Value]) -> Result<serde_json::Value, String> + Send + Sync + 'static,
    {
        self.insert(name, f);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExprFn)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::fmt::Debug for Functions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.inner.keys()).finish()
    }
}

/// An expression language the template engine can embed.
pub trait ExpressionLanguage: Send + Sync {
    /// Evaluate a single expression.
    fn evaluate(
        &self,
        expr: &str,
        env: &serde_json::Map<String, serde_json::Value>,
        functions: &Functions,
    ) -> Result<serde_json::Value, TemplateError>;
}

/// Jinja expressions evaluated with minijinja.
///
/// Every evaluation gets its own environment holding the custom filters and
/// the caller's functions.
#[derive(Debug, Clone, Copy)]
pub struct Jinja;

impl Jinja {
    pub fn new() -> Self {
        Self
    }

    fn environment<'source>(&self, functions: &Functions) -> Environment<'source> {
        let mut env = Environment::new();
        filters::register(&mut env);
        for (name, f) in functions.iter() {
            let f = Arc::clone(f);
            let fn_name = name.to_string();
            env.add_function(name.to_string(), move |args: Rest<Value>| {
                call_function(&fn_name, &f, &args.0)
            });
        }
        env
    }
}

impl Default for Jinja {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionLanguage for Jinja {
    fn evaluate(
        &self,
        expr: &str,
        env: &serde_json::Map<String, serde_json::Value>,
        functions: &Functions,
    ) -> Result<serde_json::Value, TemplateError> {
        let jinja = self.environment(functions);
        let compiled = jinja
            .compile_expression(expr)
            .map_err(|e| TemplateError::Compile {
                expr: expr.to_string(),
                message: e.to_string(),
            })?;
        let ctx = Value::from_serialize(env);
        let value = compiled.eval(ctx).map_err(|e| TemplateError::Evaluate {
            expr: expr.to_string(),
            message: error_chain(&e),
        })?;

        serde_json::to_value(&value).map_err(|e| TemplateError::Evaluate {
            expr: expr.to_string(),
            message: e.to_string(),
        })
    }
}

fn call_function(name: &str, f: &ExprFn, args: &[Value]) -> Result<Value, minijinja::Error> {
    let args = args
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| minijinja::Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
    let result = f(&args).map_err(|message| {
        minijinja::Error::new(ErrorKind::InvalidOperation, format!("{}(): {}", name, message))
    })?;
    Ok(Value::from_serialize(&result))
}

/// minijinja reports function errors as the source of a generic error.
fn error_chain(err: &minijinja::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = std::error::Error::source(cause);
    }
    message
}
