//! `${{ ... }}` template evaluation with result coercion.

use std::sync::Arc;

use super::expression::{ExpressionLanguage, Functions, Jinja};
use crate::error::TemplateError;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

/// Name of the escape function that forces a string result.
pub const QUOTE_FN: &str = "quote";

/// Evaluates templates containing `${{ expression }}` spans.
#[derive(Clone)]
pub struct TemplateEngine {
    language: Arc<dyn ExpressionLanguage>,
}

impl TemplateEngine {
    /// Create a template engine backed by Jinja expressions.
    pub fn new() -> Self {
        Self::with_language(Arc::new(Jinja::new()))
    }

    /// Create a template engine backed by another expression language.
    pub fn with_language(language: Arc<dyn ExpressionLanguage>) -> Self {
        Self { language }
    }

    /// Check if a string contains expression spans.
    pub fn is_template(s: &str) -> bool {
        s.contains(OPEN)
    }

    /// Evaluate a template string.
    ///
    /// A template without expression spans is returned unchanged as a
    /// string. Otherwise every span is substituted and the result coerced:
    /// a result wrapped in double quotes (see `quote()`) becomes the inner
    /// string, then booleans, numbers and JSON are tried in that order, and
    /// anything else stays a string.
    pub fn evaluate_template(
        &self,
        template: &str,
        env: &serde_json::Map<String, serde_json::Value>,
        functions: &Functions,
    ) -> Result<serde_json::Value, TemplateError> {
        if env.contains_key(QUOTE_FN) {
            return Err(TemplateError::ForbiddenKey(QUOTE_FN.to_string()));
        }
        if !Self::is_template(template) {
            return Ok(serde_json::Value::String(template.to_string()));
        }

        let functions = functions.clone().with(QUOTE_FN, quote);
        let rendered = self.substitute(template, env, &functions)?;
        Ok(coerce(&rendered))
    }

    /// Evaluate every string leaf of a JSON document as a template.
    ///
    /// Object keys are never evaluated.
    pub fn evaluate_json_template(
        &self,
        json: &[u8],
        env: &serde_json::Map<String, serde_json::Value>,
        functions: &Functions,
    ) -> Result<Vec<u8>, TemplateError> {
        let document: serde_json::Value = serde_json::from_slice(json)?;
        let evaluated = self.evaluate_value(&document, env, functions)?;
        Ok(serde_json::to_vec(&evaluated)?)
    }

    /// Evaluate every string leaf of an already parsed JSON value.
    pub fn evaluate_value(
        &self,
        value: &serde_json::Value,
        env: &serde_json::Map<String, serde_json::Value>,
        functions: &Functions,
    ) -> Result<serde_json::Value, TemplateError> {
        match value {
            serde_json::Value::String(s) => self.evaluate_template(s, env, functions),
            serde_json::Value::Object(obj) => {
                let mut result = serde_json::Map::with_capacity(obj.len());
                for (k, v) in obj {
                    result.insert(k.clone(), self.evaluate_value(v, env, functions)?);
                }
                Ok(serde_json::Value::Object(result))
            }
            serde_json::Value::Array(arr) => {
                let result: Result<Vec<_>, _> = arr
                    .iter()
                    .map(|v| self.evaluate_value(v, env, functions))
                    .collect();
                Ok(serde_json::Value::Array(result?))
            }
            _ => Ok(value.clone()),
        }
    }

    fn substitute(
        &self,
        template: &str,
        env: &serde_json::Map<String, serde_json::Value>,
        functions: &Functions,
    ) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        let mut offset = 0;

        while let Some(start) = rest.find(OPEN) {
            out.push_str(&rest[..start]);
            let body_start = start + OPEN.len();
            let body_len = find_close(&rest[body_start..])
                .ok_or(TemplateError::Unterminated(offset + start))?;
            let expr = rewrite_member_access(rest[body_start..body_start + body_len].trim());

            let value = self.language.evaluate(&expr, env, functions)?;
            match value {
                serde_json::Value::String(s) => out.push_str(&s),
                other => out.push_str(&serde_json::to_string(&other)?),
            }

            let consumed = body_start + body_len + CLOSE.len();
            rest = &rest[consumed..];
            offset += consumed;
        }
        out.push_str(rest);
        Ok(out)
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine").finish_non_exhaustive()
    }
}

/// The `quote()` escape: render the argument as a double quoted string.
fn quote(args: &[serde_json::Value]) -> Result<serde_json::Value, String> {
    let [arg] = args else {
        return Err(format!("expected 1 argument, got {}", args.len()));
    };
    let inner = match arg {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    };
    Ok(serde_json::Value::String(format!("\"{}\"", inner)))
}

/// Length of the expression body up to the closing `}}`, skipping braces
/// and string literals inside the expression.
fn find_close(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
        } else {
            match b {
                b'"' | b'\'' => quote = Some(b),
                b'{' => depth += 1,
                b'}' if depth > 0 => depth -= 1,
                b'}' if bytes.get(i + 1) == Some(&b'}') => return Some(i),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Rewrite `.name-with-hyphens` member access into `["name-with-hyphens"]`
/// so aliases such as `step-0` can be used as attributes. String literals
/// are left untouched.
fn rewrite_member_access(expr: &str) -> String {
    let chars: Vec<char> = expr.chars().collect();
    let mut out = String::with_capacity(expr.len());
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                if let Some(next) = chars.get(i + 1) {
                    out.push(*next);
                    i += 1;
                }
            } else if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match c {
            '"' | '\'' => {
                quote = Some(c);
                out.push(c);
                i += 1;
            }
            '.' if is_member_receiver(chars[..i].last()) => {
                let start = i + 1;
                let mut end = start;
                if chars.get(start).map_or(false, |c| c.is_alphabetic() || *c == '_') {
                    while end < chars.len()
                        && (chars[end].is_alphanumeric() || chars[end] == '_' || chars[end] == '-')
                    {
                        end += 1;
                    }
                    while end > start && chars[end - 1] == '-' {
                        end -= 1;
                    }
                }
                let segment: String = chars[start..end].iter().collect();
                if segment.contains('-') {
                    out.push_str("[\"");
                    out.push_str(&segment);
                    out.push_str("\"]");
                } else {
                    out.push('.');
                    out.push_str(&segment);
                }
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn is_member_receiver(prev: Option<&char>) -> bool {
    matches!(prev, Some(c) if c.is_alphanumeric() || *c == '_' || *c == ']' || *c == ')')
}

fn coerce(rendered: &str) -> serde_json::Value {
    let (body, newline) = match rendered.strip_suffix('\n') {
        Some(body) => (body, "\n"),
        None => (rendered, ""),
    };

    if body.len() >= 2 && body.starts_with('"') && body.ends_with('"') {
        return serde_json::Value::String(format!("{}{}", &body[1..body.len() - 1], newline));
    }
    if body.eq_ignore_ascii_case("true") {
        return serde_json::Value::Bool(true);
    }
    if body.eq_ignore_ascii_case("false") {
        return serde_json::Value::Bool(false);
    }
    if let Some(number) = parse_number(body) {
        return serde_json::Value::Number(number);
    }
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if !json.is_string() {
            return json;
        }
    }
    serde_json::Value::String(rendered.to_string())
}

fn parse_number(s: &str) -> Option<serde_json::Number> {
    if s.is_empty() || s.trim() != s {
        return None;
    }
    if let Ok(n) = s.parse::<i64>() {
        return Some(n.into());
    }
    if let Ok(n) = s.parse::<u64>() {
        return Some(n.into());
    }
    s.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(serde_json::Number::from_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("env must be an object"),
        }
    }

    fn eval(template: &str, env_value: serde_json::Value) -> serde_json::Value {
        TemplateEngine::new()
            .evaluate_template(template, &env(env_value), &Functions::new())
            .unwrap()
    }

    #[test]
    fn test_coercion() {
        assert_eq!(eval("${{ quote(42) }}", json!({})), json!("42"));
        assert_eq!(eval("${{ 42 }}", json!({})), json!(42));
        assert_eq!(eval("${{ 2.5 }}", json!({})), json!(2.5));
        assert_eq!(eval("${{ true }}", json!({})), json!(true));
        assert_eq!(eval("${{ 'FALSE' }}", json!({})), json!(false));
        assert_eq!(eval("literal 42", json!({})), json!("literal 42"));
        assert_eq!(eval("42", json!({})), json!("42"));
    }

    #[test]
    fn test_quote_keeps_string() {
        assert_eq!(eval("${{ quote(flag) }}", json!({"flag": true})), json!("true"));
        assert_eq!(eval("${{ quote('v1') }}", json!({})), json!("v1"));
    }

    #[test]
    fn test_substitution_in_text() {
        let value = eval(
            "refs/heads/${{ vars.branch }}-${{ n }}",
            json!({"vars": {"branch": "main"}, "n": 7}),
        );
        assert_eq!(value, json!("refs/heads/main-7"));
    }

    #[test]
    fn test_structured_result() {
        let value = eval("${{ obj }}", json!({"obj": {"a": [1, 2]}}));
        assert_eq!(value, json!({"a": [1, 2]}));

        let value = eval("${{ missing }}", json!({}));
        assert_eq!(value, serde_json::Value::Null);
    }

    #[test]
    fn test_trailing_newline() {
        assert_eq!(eval("${{ 'hello' }}\n", json!({})), json!("hello\n"));
        assert_eq!(eval("${{ 5 }}\n", json!({})), json!(5));
    }

    #[test]
    fn test_hyphenated_member_access() {
        let env_value = json!({"outputs": {"step-0": {"x": 1}}});
        assert_eq!(eval("${{ outputs.step-0.x }}", env_value.clone()), json!(1));
        assert_eq!(eval("${{ outputs.step-0.x == 1 }}", env_value), json!(true));
        assert_eq!(eval("${{ n - 1 }}", json!({"n": 3})), json!(2));
    }

    #[test]
    fn test_rewrite_member_access() {
        assert_eq!(rewrite_member_access("outputs.step-0.x"), "outputs[\"step-0\"].x");
        assert_eq!(rewrite_member_access("a.b - 1"), "a.b - 1");
        assert_eq!(rewrite_member_access("'x.y-z' ~ a.b"), "'x.y-z' ~ a.b");
        assert_eq!(rewrite_member_access("1.5"), "1.5");
        assert_eq!(rewrite_member_access("f().my-key"), "f()[\"my-key\"]");
    }

    #[test]
    fn test_braces_inside_expression() {
        let value = eval("${{ {'a': {'b': 1}} }}", json!({}));
        assert_eq!(value, json!({"a": {"b": 1}}));
        assert_eq!(eval("${{ '}}' }}", json!({})), json!("}}"));
    }

    #[test]
    fn test_unterminated() {
        let err = TemplateEngine::new()
            .evaluate_template("abc ${{ 1 + 1", &serde_json::Map::new(), &Functions::new())
            .unwrap_err();
        assert!(matches!(err, TemplateError::Unterminated(4)));
    }

    #[test]
    fn test_forbidden_quote_key() {
        let err = TemplateEngine::new()
            .evaluate_template("plain", &env(json!({"quote": 1})), &Functions::new())
            .unwrap_err();
        assert!(matches!(err, TemplateError::ForbiddenKey(_)));
    }

    #[test]
    fn test_json_template_recursion() {
        let engine = TemplateEngine::new();
        let out = engine
            .evaluate_json_template(
                br#"{"a": {"b": "${{ x }}"}, "c": ["${{ y }}"]}"#,
                &env(json!({"x": "hi", "y": 3})),
                &Functions::new(),
            )
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value, json!({"a": {"b": "hi"}, "c": [3]}));
    }

    #[test]
    fn test_json_template_keys_untouched() {
        let engine = TemplateEngine::new();
        let value = engine
            .evaluate_value(
                &json!({"${{ k }}": "${{ k }}"}),
                &env(json!({"k": "v"})),
                &Functions::new(),
            )
            .unwrap();
        assert_eq!(value, json!({"${{ k }}": "v"}));
    }

    #[test]
    fn test_json_template_invalid_document() {
        let err = TemplateEngine::new()
            .evaluate_json_template(b"{not json", &serde_json::Map::new(), &Functions::new())
            .unwrap_err();
        assert!(matches!(err, TemplateError::Json(_)));
    }

    #[test]
    fn test_caller_functions() {
        let functions = Functions::new().with("greet", |args| {
            let name = args.first().and_then(|v| v.as_str()).unwrap_or("world");
            Ok(json!(format!("hello {}", name)))
        });
        let value = TemplateEngine::new()
            .evaluate_template("${{ greet('kargo') }}", &serde_json::Map::new(), &functions)
            .unwrap();
        assert_eq!(value, json!("hello kargo"));
    }
}
