use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;

use crate::ast::NodeRef;
use crate::error::{Result, TemplateError};

pub type Map = IndexMap<String, Value>;

/// Arguments handed to a native [`Function`].
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub kwargs: Map,
}

impl CallArgs {
    /// Positional argument `index`, falling back to keyword `name`.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional.get(index).or_else(|| self.kwargs.get(name))
    }
}

type NativeFn = dyn Fn(CallArgs) -> Result<Value> + Send + Sync;

/// A host-provided callable (globals such as `range`).
#[derive(Clone)]
pub struct Function {
    name: Arc<str>,
    func: Arc<NativeFn>,
}

impl Function {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(CallArgs) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: CallArgs) -> Result<Value> {
        (self.func)(args)
    }
}

/// The declaration of a macro or `call` block caller.
#[derive(Debug)]
pub struct MacroDef {
    pub name: String,
    pub params: Vec<String>,
    pub defaults: Vec<(String, NodeRef)>,
    pub body: NodeRef,
    /// Name of the defining template.
    pub template: Arc<str>,
    pub is_caller: bool,
}

/// A callable template fragment.
#[derive(Debug, Clone)]
pub struct MacroValue {
    pub def: Arc<MacroDef>,
    /// Frame bindings visible at the `call` site (callers only).
    pub closure: Option<Arc<Map>>,
    /// Exported scope of the template the macro was imported from.
    pub scope: Option<Arc<Map>>,
}

impl MacroValue {
    pub fn new(def: MacroDef) -> Self {
        Self {
            def: Arc::new(def),
            closure: None,
            scope: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// A string exempt from autoescaping.
    Safe(String),
    Array(Vec<Value>),
    Map(Map),
    Regex(regex::Regex),
    Macro(MacroValue),
    Function(Function),
}

impl Value {
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
        serde_json::to_value(value)
            .map(Value::from)
            .map_err(TemplateError::collaborator)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::String(s) | Value::Safe(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Regex(_) | Value::Macro(_) | Value::Function(_) => true,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// `none` or undefined.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::None)
    }

    pub fn is_safe(&self) -> bool {
        matches!(self, Value::Safe(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Safe(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Numeric view used by arithmetic and ordering; numeric strings and
    /// booleans coerce.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) | Value::Safe(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            Value::String(s) | Value::Safe(s) => Some(s.chars().count()),
            Value::Array(a) => Some(a.len()),
            Value::Map(m) => Some(m.len()),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) | Value::Float(_) => "number",
            Value::String(_) | Value::Safe(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Regex(_) => "regex",
            Value::Macro(_) => "macro",
            Value::Function(_) => "function",
        }
    }

    /// Member access: `obj.name`, `obj[key]`. Missing members are undefined.
    pub fn get_member(&self, key: &Value) -> Value {
        match (self, key) {
            (Value::Map(map), key) => match key {
                Value::String(k) | Value::Safe(k) => map.get(k.as_str()).cloned().unwrap_or_default(),
                Value::Int(i) => map.get(i.to_string().as_str()).cloned().unwrap_or_default(),
                _ => Value::Undefined,
            },
            (Value::Array(items), Value::Int(i)) => index(items.len(), *i)
                .map(|i| items[i].clone())
                .unwrap_or_default(),
            (Value::String(s) | Value::Safe(s), Value::Int(i)) => {
                let len = s.chars().count();
                index(len, *i)
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or_default()
            }
            (Value::Array(_) | Value::String(_) | Value::Safe(_), key)
                if key.as_str() == Some("length") =>
            {
                self.len().map(|n| Value::Int(n as i64)).unwrap_or_default()
            }
            _ => Value::Undefined,
        }
    }

    /// JSON view of the value; callables and regexes become strings.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Undefined | Value::None => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) | Value::Safe(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            other => Json::String(other.to_string()),
        }
    }
}

/// Python-style index normalisation (negative counts from the end).
fn index(len: usize, i: i64) -> Option<usize> {
    let i = if i < 0 { len as i64 + i } else { i };
    if i >= 0 && (i as usize) < len {
        Some(i as usize)
    } else {
        None
    }
}

/// Format a float the way script engines print numbers.
fn format_number(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        let text = if f > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined | Value::None => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(n) => f.write_str(&format_number(*n)),
            Value::String(s) | Value::Safe(s) => f.write_str(s),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            Value::Map(_) => write!(f, "{}", self.to_json()),
            Value::Regex(re) => write!(f, "/{}/", re.as_str()),
            Value::Macro(m) => write!(f, "[macro {}]", m.name()),
            Value::Function(func) => write!(f, "[function {}]", func.name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("Undefined"),
            Value::None => f.write_str("None"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(n) => write!(f, "Float({})", n),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Safe(s) => write!(f, "Safe({:?})", s),
            Value::Array(items) => f.debug_list().entries(items).finish(),
            Value::Map(map) => f.debug_map().entries(map).finish(),
            Value::Regex(re) => write!(f, "Regex({:?})", re.as_str()),
            Value::Macro(m) => write!(f, "Macro({})", m.name()),
            Value::Function(func) => write!(f, "Function({})", func.name()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        strict_eq(self, other)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match value {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => Value::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Map(map)
    }
}

impl From<Function> for Value {
    fn from(func: Function) -> Self {
        Value::Function(func)
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

// Operators

/// `===`: same kind and same content. Ints and floats are both numbers;
/// plain and safe strings are both strings.
pub fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            a.as_f64() == b.as_f64()
        }
        (Value::String(x) | Value::Safe(x), Value::String(y) | Value::Safe(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| strict_eq(x, y))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| strict_eq(v, other)))
        }
        (Value::Regex(x), Value::Regex(y)) => x.as_str() == y.as_str(),
        (Value::Macro(x), Value::Macro(y)) => Arc::ptr_eq(&x.def, &y.def),
        (Value::Function(x), Value::Function(y)) => Arc::ptr_eq(&x.func, &y.func),
        _ => false,
    }
}

/// `==`: strict equality plus numeric coercion of strings and booleans, and
/// `none == undefined`.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    if strict_eq(a, b) {
        return true;
    }
    match (a, b) {
        (x, y) if x.is_nullish() || y.is_nullish() => x.is_nullish() && y.is_nullish(),
        (Value::String(_) | Value::Safe(_), Value::String(_) | Value::Safe(_)) => false,
        (
            Value::Int(_) | Value::Float(_) | Value::Bool(_) | Value::String(_) | Value::Safe(_),
            Value::Int(_) | Value::Float(_) | Value::Bool(_) | Value::String(_) | Value::Safe(_),
        ) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => false,
    }
}

/// Ordering for `< > <= >=`: strings compare lexically, anything else numerically.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => Some(x.cmp(y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

fn numbers(op: &str, a: &Value, b: &Value) -> Result<(f64, f64)> {
    match (a, b) {
        (Value::Int(_) | Value::Float(_) | Value::Bool(_), Value::Int(_) | Value::Float(_) | Value::Bool(_)) => {
            Ok((a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default()))
        }
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) if !a.is_nullish() && !b.is_nullish() => Ok((x, y)),
            _ => Err(TemplateError::evaluation(format!(
                "unsupported operand types for {}: {} and {}",
                op,
                a.type_name(),
                b.type_name()
            ))),
        },
    }
}

fn float_or_int(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Value::Int(f as i64)
    } else {
        Value::Float(f)
    }
}

fn int_pair(a: &Value, b: &Value) -> Option<(i64, i64)> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Some((*x, *y)),
        _ => None,
    }
}

pub fn add(a: &Value, b: &Value) -> Result<Value> {
    if a.as_str().is_some() || b.as_str().is_some() {
        return Ok(Value::String(format!("{}{}", a, b)));
    }
    if let (Value::Array(x), Value::Array(y)) = (a, b) {
        return Ok(Value::Array(x.iter().chain(y).cloned().collect()));
    }
    if let Some((x, y)) = int_pair(a, b) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(Value::Int(sum));
        }
    }
    let (x, y) = numbers("+", a, b)?;
    Ok(Value::Float(x + y))
}

pub fn concat(a: &Value, b: &Value) -> Value {
    Value::String(format!("{}{}", a, b))
}

pub fn sub(a: &Value, b: &Value) -> Result<Value> {
    if let Some((x, y)) = int_pair(a, b) {
        if let Some(diff) = x.checked_sub(y) {
            return Ok(Value::Int(diff));
        }
    }
    let (x, y) = numbers("-", a, b)?;
    Ok(Value::Float(x - y))
}

pub fn mul(a: &Value, b: &Value) -> Result<Value> {
    if let Some((x, y)) = int_pair(a, b) {
        if let Some(product) = x.checked_mul(y) {
            return Ok(Value::Int(product));
        }
    }
    let (x, y) = numbers("*", a, b)?;
    Ok(Value::Float(x * y))
}

/// `/` is true division; an integral quotient prints without a fraction.
pub fn div(a: &Value, b: &Value) -> Result<Value> {
    let (x, y) = numbers("/", a, b)?;
    Ok(Value::Float(x / y))
}

pub fn floor_div(a: &Value, b: &Value) -> Result<Value> {
    if let Some((x, y)) = int_pair(a, b) {
        if y == 0 {
            return Err(TemplateError::evaluation("integer division by zero"));
        }
        let quotient = x
            .checked_div_euclid(y)
            .ok_or_else(|| TemplateError::evaluation("integer overflow in //"))?;
        let adjust = if x.rem_euclid(y) != 0 && y < 0 { 1 } else { 0 };
        return Ok(Value::Int(quotient - adjust));
    }
    let (x, y) = numbers("//", a, b)?;
    Ok(float_or_int((x / y).floor()))
}

pub fn rem(a: &Value, b: &Value) -> Result<Value> {
    if let Some((x, y)) = int_pair(a, b) {
        if y == 0 {
            return Ok(Value::Float(f64::NAN));
        }
        if let Some(r) = x.checked_rem(y) {
            return Ok(Value::Int(r));
        }
    }
    let (x, y) = numbers("%", a, b)?;
    Ok(Value::Float(x % y))
}

pub fn pow(a: &Value, b: &Value) -> Result<Value> {
    if let Some((x, y)) = int_pair(a, b) {
        if (0..=u32::MAX as i64).contains(&y) {
            if let Some(p) = x.checked_pow(y as u32) {
                return Ok(Value::Int(p));
            }
        }
    }
    let (x, y) = numbers("**", a, b)?;
    Ok(Value::Float(x.powf(y)))
}

pub fn neg(a: &Value) -> Result<Value> {
    match a {
        Value::Int(i) => Ok(i.checked_neg().map(Value::Int).unwrap_or(Value::Float(-(*i as f64)))),
        other => {
            let (x, _) = numbers("unary -", other, &Value::Int(0))?;
            Ok(Value::Float(-x))
        }
    }
}

pub fn pos(a: &Value) -> Result<Value> {
    match a {
        Value::Int(_) | Value::Float(_) => Ok(a.clone()),
        other => {
            let (x, _) = numbers("unary +", other, &Value::Int(0))?;
            Ok(Value::Float(x))
        }
    }
}

/// `needle in haystack`.
pub fn contains(haystack: &Value, needle: &Value) -> Result<bool> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| loose_eq(item, needle))),
        Value::Map(map) => Ok(map.contains_key(needle.to_string().as_str())),
        Value::String(s) | Value::Safe(s) => match needle {
            Value::String(n) | Value::Safe(n) => Ok(s.contains(n.as_str())),
            other => Ok(s.contains(other.to_string().as_str())),
        },
        other => Err(TemplateError::evaluation(format!(
            "cannot use \"in\" operator to search for \"{}\" in a value of type {}",
            needle,
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::None.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::Array(vec![]).is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(Value::Float(0.5).is_truthy());
    }

    #[test]
    fn numbers_print_like_script_numbers() {
        assert_eq!(Value::Float(2.0).to_string(), "2");
        assert_eq!(Value::Float(0.5).to_string(), "0.5");
        assert_eq!(Value::Float(f64::INFINITY).to_string(), "Infinity");
        assert_eq!(div(&Value::Int(6), &Value::Int(3)).unwrap().to_string(), "2");
        assert_eq!(div(&Value::Int(7), &Value::Int(2)).unwrap().to_string(), "3.5");
    }

    #[test]
    fn json_conversion_preserves_order() {
        let value = Value::from(json!({"b": 1, "a": [true, null, "x"]}));
        match &value {
            Value::Map(map) => {
                let keys: Vec<_> = map.keys().cloned().collect();
                assert_eq!(keys, ["b", "a"]);
            }
            other => panic!("expected map, got {:?}", other),
        }
        assert_eq!(value.to_json(), json!({"b": 1, "a": [true, null, "x"]}));
    }

    #[test]
    fn member_lookup() {
        let value = Value::from(json!({"items": [1, 2, 3], "name": "abc"}));
        let items = value.get_member(&Value::from("items"));
        assert_eq!(items.get_member(&Value::Int(-1)), Value::Int(3));
        assert_eq!(items.get_member(&Value::from("length")), Value::Int(3));
        assert!(value.get_member(&Value::from("missing")).is_undefined());
        assert!(Value::None.get_member(&Value::from("x")).is_undefined());
    }

    #[test]
    fn loose_and_strict_equality() {
        assert!(loose_eq(&Value::Int(1), &Value::from("1")));
        assert!(!strict_eq(&Value::Int(1), &Value::from("1")));
        assert!(strict_eq(&Value::Int(2), &Value::Float(2.0)));
        assert!(loose_eq(&Value::None, &Value::Undefined));
        assert!(!loose_eq(&Value::None, &Value::Int(0)));
    }

    #[test]
    fn arithmetic() {
        assert_eq!(add(&Value::Int(1), &Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!(add(&Value::from("a"), &Value::Int(2)).unwrap(), Value::from("a2"));
        assert_eq!(floor_div(&Value::Int(7), &Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!(floor_div(&Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(-4));
        assert_eq!(pow(&Value::Int(2), &Value::Int(10)).unwrap(), Value::Int(1024));
        assert_eq!(rem(&Value::Int(7), &Value::Int(3)).unwrap(), Value::Int(1));
        assert!(sub(&Value::from(json!({})), &Value::Int(1)).is_err());
    }

    #[test]
    fn containment() {
        let list = Value::from(json!([1, "two"]));
        assert!(contains(&list, &Value::from("two")).unwrap());
        assert!(contains(&Value::from("hello"), &Value::from("ell")).unwrap());
        assert!(contains(&Value::from(json!({"k": 1})), &Value::from("k")).unwrap());
        assert!(contains(&Value::Int(3), &Value::Int(3)).is_err());
    }

    #[test]
    fn escaping() {
        assert_eq!(escape_html("<a href=\"x\">'&'</a>"), "&lt;a href=&quot;x&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;");
    }
}
