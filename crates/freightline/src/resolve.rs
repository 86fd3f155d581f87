//! Step configuration resolution: variables, skip conditions, config and the
//! expression functions available to them.

use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::context::{PromotionContext, Secrets};
use crate::error::{PromotionError, TemplateError};
use crate::freight::{FreightOrigin, FreightRequest, LookupError};
use crate::state::StepExecutionMetadataList;
use crate::step::{alias_namespace, ExpressionVariable, Step};
use crate::template::{Functions, TemplateEngine};

/// Promotion-wide values exposed as `ctx`.
pub fn context_value(ctx: &PromotionContext) -> Value {
    json!({
        "project": ctx.project,
        "stage": ctx.stage,
        "promotion": ctx.promotion,
        "actor": ctx.actor,
        "targetFreight": ctx.target_freight_ref,
        "meta": {
            "promotion": {
                "actor": ctx.actor,
            },
        },
    })
}

/// Resolve promotion then step variables for the step with `alias`.
///
/// Promotion variables cannot see step outputs. Each variable sees the
/// variables resolved before it.
pub fn resolve_vars(
    templates: &TemplateEngine,
    ctx: &PromotionContext,
    step: &Step,
    alias: &str,
    functions: &Functions,
) -> Result<Map<String, Value>, TemplateError> {
    let mut vars = Map::new();

    let mut env = Map::new();
    env.insert("ctx".to_string(), context_value(ctx));
    evaluate_vars(templates, &ctx.vars, &mut env, &mut vars, functions)?;

    env.insert("outputs".to_string(), ctx.state.to_value());
    if let Some(task) = task_value(ctx, alias) {
        env.insert("task".to_string(), task);
    }
    evaluate_vars(templates, &step.vars, &mut env, &mut vars, functions)?;

    Ok(vars)
}

fn evaluate_vars(
    templates: &TemplateEngine,
    declarations: &[ExpressionVariable],
    env: &mut Map<String, Value>,
    vars: &mut Map<String, Value>,
    functions: &Functions,
) -> Result<(), TemplateError> {
    for var in declarations {
        env.insert("vars".to_string(), Value::Object(vars.clone()));
        let value = templates.evaluate_template(&var.value, env, functions)?;
        vars.insert(var.name.clone(), value);
    }
    Ok(())
}

fn task_value(ctx: &PromotionContext, alias: &str) -> Option<Value> {
    alias_namespace(alias).map(|namespace| {
        json!({
            "outputs": Value::Object(ctx.state.task_outputs(namespace)),
        })
    })
}

/// Environment for the `if` condition and config of a step.
pub fn step_env(
    ctx: &PromotionContext,
    alias: &str,
    vars: Map<String, Value>,
    secrets: &Secrets,
) -> Map<String, Value> {
    let mut env = Map::new();
    env.insert("ctx".to_string(), context_value(ctx));
    env.insert("vars".to_string(), Value::Object(vars));
    env.insert("secrets".to_string(), json!(secrets));
    env.insert("outputs".to_string(), ctx.state.to_value());
    env.insert("steps".to_string(), steps_value(&ctx.step_execution_metadata));
    if let Some(task) = task_value(ctx, alias) {
        env.insert("task".to_string(), task);
    }
    env
}

/// Execution records of earlier steps keyed by alias.
fn steps_value(metadata: &StepExecutionMetadataList) -> Value {
    Value::Object(
        metadata
            .iter()
            .filter(|record| !record.alias.is_empty())
            .map(|record| (record.alias.clone(), json!(record)))
            .collect(),
    )
}

/// Whether the step should be skipped.
///
/// Without a condition the step is skipped iff an earlier step failed.
pub fn should_skip(
    templates: &TemplateEngine,
    step: &Step,
    alias: &str,
    env: &Map<String, Value>,
    functions: &Functions,
    metadata: &StepExecutionMetadataList,
) -> Result<bool, PromotionError> {
    let Some(condition) = step.condition() else {
        return Ok(metadata.has_failures());
    };
    match templates.evaluate_template(condition, env, functions)? {
        Value::Bool(run) => Ok(!run),
        other => Err(PromotionError::InvalidCondition {
            alias: alias.to_string(),
            found: describe(&other),
        }),
    }
}

/// Evaluate the config template of a step.
pub fn resolve_config(
    templates: &TemplateEngine,
    step: &Step,
    alias: &str,
    env: &Map<String, Value>,
    functions: &Functions,
) -> Result<Value, PromotionError> {
    if step.config.is_null() {
        return Ok(Value::Null);
    }
    match templates.evaluate_value(&step.config, env, functions)? {
        value @ (Value::Object(_) | Value::Null) => Ok(value),
        other => Err(PromotionError::InvalidConfig {
            alias: alias.to_string(),
            found: describe(&other),
        }),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {}", b),
        Value::Number(n) => format!("number {}", n),
        Value::String(s) => format!("string {:?}", s),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

/// Functions available to the expressions of one step.
///
/// Status functions see the execution records as they were when the step
/// started.
pub fn step_functions(ctx: &PromotionContext) -> Functions {
    let metadata = Arc::new(ctx.step_execution_metadata.clone());
    let freight = Arc::new(ctx.freight.clone());
    let requests: Arc<Vec<FreightRequest>> = Arc::new(ctx.freight_requests.clone());

    let mut functions = Functions::new();

    let m = Arc::clone(&metadata);
    functions.insert("success", move |args| {
        no_args(args)?;
        Ok(Value::Bool(!m.has_failures()))
    });

    let m = Arc::clone(&metadata);
    functions.insert("failure", move |args| {
        no_args(args)?;
        Ok(Value::Bool(m.has_failures()))
    });

    functions.insert("always", |args| {
        no_args(args)?;
        Ok(Value::Bool(true))
    });

    let m = Arc::clone(&metadata);
    functions.insert("status", move |args| {
        let alias = string_arg(args, 0)?;
        let record = m
            .by_alias(alias)
            .ok_or_else(|| format!("no step with alias '{}'", alias))?;
        Ok(Value::String(record.status.to_string()))
    });

    functions.insert("warehouse", |args| {
        let name = string_arg(args, 0)?;
        to_value(&FreightOrigin::warehouse(name))
    });

    let (f, r) = (Arc::clone(&freight), Arc::clone(&requests));
    functions.insert("commitFrom", move |args| {
        let repo_url = string_arg(args, 0)?;
        let origin = origin_arg(args, 1)?;
        lookup(f.find_commit(repo_url, origin.as_ref(), &r))
    });

    let (f, r) = (Arc::clone(&freight), Arc::clone(&requests));
    functions.insert("imageFrom", move |args| {
        let repo_url = string_arg(args, 0)?;
        let origin = origin_arg(args, 1)?;
        lookup(f.find_image(repo_url, origin.as_ref(), &r))
    });

    let (f, r) = (freight, requests);
    functions.insert("chartFrom", move |args| {
        let repo_url = string_arg(args, 0)?;
        let (chart_name, origin) = match args.get(1) {
            Some(Value::String(name)) => (Some(name.as_str()), origin_arg(args, 2)?),
            Some(Value::Null) | None => (None, origin_arg(args, 2)?),
            Some(_) => (None, origin_arg(args, 1)?),
        };
        lookup(f.find_chart(repo_url, chart_name, origin.as_ref(), &r))
    });

    functions
}

fn lookup<T: serde::Serialize>(found: Result<Option<&T>, LookupError>) -> Result<Value, String> {
    match found.map_err(|e| e.to_string())? {
        Some(artifact) => to_value(artifact),
        None => Ok(Value::Null),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn no_args(args: &[Value]) -> Result<(), String> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(format!("expected no arguments, got {}", args.len()))
    }
}

fn string_arg(args: &[Value], index: usize) -> Result<&str, String> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(format!("argument {} must be a string, got {}", index + 1, describe(other))),
        None => Err(format!("missing argument {}", index + 1)),
    }
}

fn origin_arg(args: &[Value], index: usize) -> Result<Option<FreightOrigin>, String> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| format!("argument {} is not a Freight origin: {}", index + 1, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freight::{Chart, FreightReference, GitCommit, Image};
    use crate::result::StepStatus;

    fn promotion() -> PromotionContext {
        let mut ctx = PromotionContext::new("demo", "prod", "prod.01").with_actor("alice");
        ctx.freight.update_or_push(FreightReference {
            name: "f1".to_string(),
            origin: FreightOrigin::warehouse("main"),
            commits: vec![GitCommit {
                repo_url: "https://github.com/acme/app".to_string(),
                id: "abc123".to_string(),
                ..Default::default()
            }],
            images: vec![Image {
                repo_url: "ghcr.io/acme/app".to_string(),
                tag: "v1.0.0".to_string(),
                digest: String::new(),
            }],
            charts: vec![Chart {
                repo_url: "oci://ghcr.io/acme/charts/app".to_string(),
                name: String::new(),
                version: "1.2.3".to_string(),
            }],
        });
        ctx
    }

    fn eval(ctx: &PromotionContext, template: &str) -> Result<Value, TemplateError> {
        let env = step_env(ctx, "step-0", Map::new(), &Secrets::new());
        TemplateEngine::new().evaluate_template(template, &env, &step_functions(ctx))
    }

    #[test]
    fn test_resolve_vars_order_and_scope() {
        let mut ctx = promotion().with_var("env", "prod").with_var("greeting", "hi-${{ vars.env }}");
        ctx.state.set("step-0", json!({"tag": "v2"}));

        let step = Step::new("mock")
            .with_var("tag", "${{ outputs.step-0.tag }}")
            .with_var("label", "${{ vars.greeting }}/${{ vars.tag }}");

        let vars = resolve_vars(&TemplateEngine::new(), &ctx, &step, "deploy", &Functions::new())
            .unwrap();
        assert_eq!(vars["env"], json!("prod"));
        assert_eq!(vars["greeting"], json!("hi-prod"));
        assert_eq!(vars["tag"], json!("v2"));
        assert_eq!(vars["label"], json!("hi-prod/v2"));
    }

    #[test]
    fn test_promotion_vars_cannot_see_outputs() {
        let mut ctx = promotion().with_var("x", "${{ outputs.step-0.tag }}");
        ctx.state.set("step-0", json!({"tag": "v2"}));

        let result = resolve_vars(
            &TemplateEngine::new(),
            &ctx,
            &Step::new("mock"),
            "deploy",
            &Functions::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_task_outputs_in_vars() {
        let mut ctx = promotion();
        ctx.state.record_output("task1::clone", Map::from_iter([("path".to_string(), json!("/src"))]));

        let step = Step::new("mock").with_var("p", "${{ task.outputs.clone.path }}");
        let vars = resolve_vars(&TemplateEngine::new(), &ctx, &step, "task1::build", &Functions::new())
            .unwrap();
        assert_eq!(vars["p"], json!("/src"));
    }

    #[test]
    fn test_should_skip_without_condition() {
        let engine = TemplateEngine::new();
        let mut metadata = StepExecutionMetadataList::new();
        let step = Step::new("mock");
        let env = Map::new();

        assert!(!should_skip(&engine, &step, "a", &env, &Functions::new(), &metadata).unwrap());
        metadata.ensure(0, "prev").status = StepStatus::Errored;
        assert!(should_skip(&engine, &step, "a", &env, &Functions::new(), &metadata).unwrap());
    }

    #[test]
    fn test_should_skip_with_condition() {
        let engine = TemplateEngine::new();
        let metadata = StepExecutionMetadataList::new();
        let env = step_env(&promotion(), "a", Map::new(), &Secrets::new());

        let step = Step::new("mock").with_condition("${{ ctx.stage == 'prod' }}");
        assert!(!should_skip(&engine, &step, "a", &env, &Functions::new(), &metadata).unwrap());

        let step = Step::new("mock").with_condition("${{ ctx.stage == 'dev' }}");
        assert!(should_skip(&engine, &step, "a", &env, &Functions::new(), &metadata).unwrap());

        let step = Step::new("mock").with_condition("${{ ctx.stage }}");
        let err = should_skip(&engine, &step, "a", &env, &Functions::new(), &metadata).unwrap_err();
        assert!(matches!(err, PromotionError::InvalidCondition { .. }));
    }

    #[test]
    fn test_resolve_config() {
        let ctx = promotion();
        let mut vars = Map::new();
        vars.insert("replicas".to_string(), json!(3));
        let mut secrets = Secrets::new();
        secrets
            .entry("github".to_string())
            .or_default()
            .insert("token".to_string(), "s3cr3t".to_string());
        let env = step_env(&ctx, "a", vars, &secrets);

        let step = Step::new("mock").with_config(json!({
            "path": "./${{ ctx.stage }}",
            "replicas": "${{ vars.replicas }}",
            "token": "${{ secrets.github.token }}",
        }));
        let config = resolve_config(&TemplateEngine::new(), &step, "a", &env, &Functions::new())
            .unwrap();
        assert_eq!(config, json!({"path": "./prod", "replicas": 3, "token": "s3cr3t"}));

        let step = Step::new("mock").with_config(json!("${{ vars.replicas }}"));
        let err = resolve_config(&TemplateEngine::new(), &step, "a", &env, &Functions::new())
            .unwrap_err();
        assert!(matches!(err, PromotionError::InvalidConfig { .. }));
    }

    #[test]
    fn test_step_records_in_env() {
        let mut ctx = promotion();
        let record = ctx.step_execution_metadata.ensure(0, "clone");
        record.status = StepStatus::Running;
        record.error_count = 2;

        assert_eq!(eval(&ctx, "${{ steps.clone.status }}").unwrap(), json!("running"));
        assert_eq!(eval(&ctx, "${{ steps.clone.errorCount }}").unwrap(), json!(2));
    }

    #[test]
    fn test_status_functions() {
        let mut ctx = promotion();
        ctx.step_execution_metadata.ensure(0, "clone").status = StepStatus::Succeeded;
        assert_eq!(eval(&ctx, "${{ success() }}").unwrap(), json!(true));
        assert_eq!(eval(&ctx, "${{ failure() }}").unwrap(), json!(false));
        assert_eq!(eval(&ctx, "${{ always() }}").unwrap(), json!(true));
        assert_eq!(eval(&ctx, "${{ status('clone') }}").unwrap(), json!("succeeded"));
        assert!(eval(&ctx, "${{ status('nope') }}").is_err());

        ctx.step_execution_metadata.ensure(1, "push").status = StepStatus::Failed;
        assert_eq!(eval(&ctx, "${{ failure() }}").unwrap(), json!(true));
    }

    #[test]
    fn test_freight_functions() {
        let ctx = promotion();
        assert_eq!(
            eval(&ctx, "${{ commitFrom('https://github.com/acme/app').id }}").unwrap(),
            json!("abc123")
        );
        assert_eq!(
            eval(
                &ctx,
                "${{ imageFrom('ghcr.io/acme/app', warehouse('main')).tag }}"
            )
            .unwrap(),
            json!("v1.0.0")
        );
        assert_eq!(
            eval(&ctx, "${{ chartFrom('oci://ghcr.io/acme/charts/app').version }}").unwrap(),
            json!("1.2.3")
        );
        assert_eq!(
            eval(&ctx, "${{ commitFrom('https://github.com/acme/missing') }}").unwrap(),
            Value::Null
        );
        assert!(eval(&ctx, "${{ imageFrom('ghcr.io/acme/app', warehouse('other')) }}").is_err());
    }

    #[test]
    fn test_warehouse_function() {
        let ctx = promotion();
        assert_eq!(
            eval(&ctx, "${{ warehouse('main') }}").unwrap(),
            json!({"kind": "Warehouse", "name": "main"})
        );
    }
}
