//! Custom filters available in expressions.

use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{Environment, Error, ErrorKind, Value};

pub(crate) fn register(env: &mut Environment<'_>) {
    env.add_filter("int", filter_int);
    env.add_filter("float", filter_float);
    env.add_filter("tojson", filter_tojson);
    env.add_filter("fromjson", filter_fromjson);
    env.add_filter("b64encode", filter_b64encode);
    env.add_filter("b64decode", filter_b64decode);
}

fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, message.into())
}

fn filter_int(value: Value) -> Result<Value, Error> {
    let s = value.to_string();
    let s = s.trim();
    if let Ok(n) = s.parse::<i64>() {
        return Ok(Value::from(n));
    }
    if let Ok(f) = s.parse::<f64>() {
        if f.is_finite() {
            return Ok(Value::from(f.trunc() as i64));
        }
    }
    Err(invalid(format!("cannot convert '{}' to int", s)))
}

fn filter_float(value: Value) -> Result<Value, Error> {
    let s = value.to_string();
    s.trim()
        .parse::<f64>()
        .map(Value::from)
        .map_err(|_| invalid(format!("cannot convert '{}' to float", s)))
}

fn filter_tojson(value: Value) -> Result<String, Error> {
    serde_json::to_string(&value).map_err(|e| invalid(e.to_string()))
}

fn filter_fromjson(value: Value) -> Result<Value, Error> {
    let json: serde_json::Value = serde_json::from_str(&value.to_string())
        .map_err(|e| invalid(format!("fromjson: {}", e)))?;
    Ok(Value::from_serialize(&json))
}

fn filter_b64encode(value: Value) -> String {
    STANDARD.encode(value.to_string().as_bytes())
}

fn filter_b64decode(value: Value) -> Result<String, Error> {
    let decoded = STANDARD
        .decode(value.to_string().trim().as_bytes())
        .map_err(|e| invalid(e.to_string()))?;
    String::from_utf8(decoded).map_err(|e| invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(expr: &str, ctx: serde_json::Value) -> Result<serde_json::Value, Error> {
        let mut env = Environment::new();
        register(&mut env);
        let value = env.compile_expression(expr)?.eval(Value::from_serialize(&ctx))?;
        Ok(serde_json::to_value(&value).unwrap())
    }

    #[test]
    fn test_filter_int() {
        let ctx = serde_json::json!({"a": "42", "b": "3.9", "c": "x"});
        assert_eq!(eval("a | int", ctx.clone()).unwrap(), serde_json::json!(42));
        assert_eq!(eval("b | int", ctx.clone()).unwrap(), serde_json::json!(3));
        assert!(eval("c | int", ctx).is_err());
    }

    #[test]
    fn test_filter_float() {
        let ctx = serde_json::json!({"v": "3.14"});
        assert_eq!(eval("v | float", ctx).unwrap(), serde_json::json!(3.14));
    }

    #[test]
    fn test_filter_json() {
        let ctx = serde_json::json!({"raw": "{\"replicas\": 3}", "obj": {"k": "v"}});
        assert_eq!(
            eval("(raw | fromjson).replicas", ctx.clone()).unwrap(),
            serde_json::json!(3)
        );
        assert_eq!(eval("obj | tojson", ctx).unwrap(), serde_json::json!("{\"k\":\"v\"}"));
    }

    #[test]
    fn test_filter_b64() {
        let ctx = serde_json::json!({"text": "hello", "encoded": "aGVsbG8="});
        assert_eq!(eval("text | b64encode", ctx.clone()).unwrap(), serde_json::json!("aGVsbG8="));
        assert_eq!(eval("encoded | b64decode", ctx).unwrap(), serde_json::json!("hello"));
    }
}
