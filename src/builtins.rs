//! Tests, filters and globals every environment starts with.

use std::sync::Arc;

use crate::environment::{FilterFn, TestFn};
use crate::error::{Result, TemplateError};
use crate::value::{escape_html, strict_eq, CallArgs, Function, Value};

pub(crate) fn filters() -> Vec<(&'static str, Arc<FilterFn>)> {
    fn filter(f: impl Fn(Value, Vec<Value>) -> Result<Value> + Send + Sync + 'static) -> Arc<FilterFn> {
        Arc::new(f)
    }

    let escape_filter = filter(|value, _| Ok(escape(value)));
    vec![
        ("safe", filter(|value, _| Ok(safe(value)))),
        ("escape", Arc::clone(&escape_filter)),
        ("e", escape_filter),
    ]
}

fn safe(value: Value) -> Value {
    match value {
        Value::Safe(_) => value,
        other => Value::Safe(other.to_string()),
    }
}

fn escape(value: Value) -> Value {
    match value {
        Value::Safe(_) => value,
        other => Value::Safe(escape_html(&other.to_string())),
    }
}

fn arg<'a>(args: &'a [Value], name: &str, test: &str) -> Result<&'a Value> {
    args.first().ok_or_else(|| {
        TemplateError::evaluation(format!("test \"{}\" expects an argument ({})", test, name))
    })
}

fn is_lower(value: &Value) -> bool {
    value.as_str().is_some_and(|s| s.to_lowercase() == s)
}

fn is_upper(value: &Value) -> bool {
    value.as_str().is_some_and(|s| s.to_uppercase() == s)
}

pub(crate) fn tests() -> Vec<(&'static str, Arc<TestFn>)> {
    fn test(f: impl Fn(&Value, &[Value]) -> Result<bool> + Send + Sync + 'static) -> Arc<TestFn> {
        Arc::new(f)
    }
    fn check(f: fn(&Value) -> bool) -> Arc<TestFn> {
        test(move |value, _| Ok(f(value)))
    }

    let equal = test(|value, args| Ok(strict_eq(value, arg(args, "other", "equalto")?)));
    vec![
        ("defined", check(|v| !v.is_undefined())),
        ("undefined", check(Value::is_undefined)),
        ("none", check(|v| matches!(v, Value::None))),
        ("null", check(|v| matches!(v, Value::None))),
        ("number", check(Value::is_number)),
        ("string", check(|v| v.as_str().is_some())),
        ("mapping", check(|v| matches!(v, Value::Map(_)))),
        ("iterable", check(|v| matches!(v, Value::Array(_) | Value::String(_) | Value::Safe(_)))),
        ("callable", check(|v| matches!(v, Value::Macro(_) | Value::Function(_)))),
        ("odd", check(|v| v.as_i64().is_some_and(|n| n.rem_euclid(2) == 1))),
        ("even", check(|v| v.as_i64().is_some_and(|n| n.rem_euclid(2) == 0))),
        (
            "divisibleby",
            test(|value, args| {
                let divisor = arg(args, "divisor", "divisibleby")?;
                Ok(match (value.as_i64(), divisor.as_i64()) {
                    (Some(n), Some(d)) if d != 0 => n % d == 0,
                    _ => false,
                })
            }),
        ),
        ("equalto", Arc::clone(&equal)),
        ("eq", Arc::clone(&equal)),
        ("sameas", equal),
        ("truthy", check(Value::is_truthy)),
        ("falsy", check(|v| !v.is_truthy())),
        ("escaped", check(Value::is_safe)),
        ("lower", check(is_lower)),
        ("upper", check(is_upper)),
    ]
}

pub(crate) fn globals() -> Vec<(&'static str, Value)> {
    vec![("range", Value::Function(Function::new("range", range)))]
}

const MAX_RANGE_LEN: i128 = 1_000_000;

/// `range(stop)`, `range(start, stop)` or `range(start, stop, step)`.
fn range(args: CallArgs) -> Result<Value> {
    let ints = args
        .positional
        .iter()
        .map(|v| {
            v.as_i64().ok_or_else(|| {
                TemplateError::evaluation(format!("range() expects integers, got {}", v.type_name()))
            })
        })
        .collect::<Result<Vec<i64>>>()?;

    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => {
            return Err(TemplateError::evaluation(format!(
                "range() takes 1 to 3 arguments, got {}",
                ints.len()
            )))
        }
    };
    if step == 0 {
        return Err(TemplateError::evaluation("range() step must not be zero"));
    }
    let stride = i128::from(step).abs();
    let span = (i128::from(stop) - i128::from(start)) * i128::from(step.signum());
    let len = if span > 0 {
        (span + stride - 1) / stride
    } else {
        0
    };
    if len > MAX_RANGE_LEN {
        return Err(TemplateError::evaluation(format!(
            "range() would produce {} items; the limit is {}",
            len, MAX_RANGE_LEN
        )));
    }

    let mut out = Vec::with_capacity(len as usize);
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(Value::Int(i));
        i = match i.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(Value::Array(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_test(name: &str, value: Value, args: &[Value]) -> bool {
        let (_, f) = tests().into_iter().find(|(n, _)| *n == name).unwrap();
        f(&value, args).unwrap()
    }

    fn call_range(args: Vec<i64>) -> Result<Value> {
        range(CallArgs {
            positional: args.into_iter().map(Value::Int).collect(),
            ..CallArgs::default()
        })
    }

    #[test]
    fn builtin_tests() {
        assert!(run_test("defined", Value::None, &[]));
        assert!(!run_test("defined", Value::Undefined, &[]));
        assert!(!run_test("none", Value::Undefined, &[]));
        assert!(run_test("odd", Value::Int(-3), &[]));
        assert!(run_test("divisibleby", Value::Int(9), &[Value::Int(3)]));
        assert!(!run_test("divisibleby", Value::Int(9), &[Value::Int(0)]));
        assert!(run_test("sameas", Value::from("a"), &[Value::from("a")]));
        assert!(run_test("lower", Value::from("abc"), &[]));
        assert!(!run_test("upper", Value::from("aBC"), &[]));
        assert!(run_test("escaped", Value::Safe("x".into()), &[]));
    }

    #[test]
    fn missing_test_argument_is_an_error() {
        let (_, f) = tests().into_iter().find(|(n, _)| *n == "equalto").unwrap();
        assert!(f(&Value::Int(1), &[]).is_err());
    }

    #[test]
    fn escape_marks_safe_once() {
        assert_eq!(escape(Value::from("<b>")), Value::Safe("&lt;b&gt;".into()));
        assert_eq!(escape(Value::Safe("<b>".into())), Value::Safe("<b>".into()));
    }

    #[test]
    fn ranges() {
        assert_eq!(call_range(vec![3]).unwrap(), Value::from(vec![0, 1, 2]));
        assert_eq!(call_range(vec![1, 7, 3]).unwrap(), Value::from(vec![1, 4]));
        assert_eq!(call_range(vec![3, 0, -1]).unwrap(), Value::from(vec![3, 2, 1]));
        assert!(call_range(vec![0, 3, 0]).is_err());
        assert!(call_range(vec![]).is_err());
        assert_eq!(call_range(vec![0, 10, i64::MAX]).unwrap(), Value::from(vec![0]));
    }

    #[test]
    fn oversized_ranges_are_rejected() {
        let err = call_range(vec![0, 1_000_000_000_000]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Evaluation);
        assert!(err.message().contains("limit"), "{}", err);
        assert_eq!(call_range(vec![i64::MIN, i64::MAX, i64::MIN]).unwrap(), Value::Array(Vec::new()));
        assert_eq!(call_range(vec![1_000_000]).unwrap().len(), Some(1_000_000));
    }
}
