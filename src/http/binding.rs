//! Request binding and validation messages.
//!
//! # Data Flow
//! ```text
//! request body
//!     → empty / not JSON                 → "request payload malformed"
//!     → deserialize into T (field paths) → "<field> expects <type>, got <value>"
//!     → schema constraints, in order     → first violation's message
//!     → Bind(T)
//! ```
//!
//! # Design Decisions
//! - One [`Schema`] per request type, built once and looked up by field
//!   path; nothing is discovered at request time
//! - Only the first violation is reported
//! - Message priority: constraint-specific, then the field's generic
//!   message, then `<field>:<constraint>`

use std::fmt;

use axum::body::Bytes;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::http::error::AppError;

pub const MALFORMED: &str = "request payload malformed";
pub const TOO_LARGE: &str = "request payload too large";

/// A declarative check on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// Present, not null, and not an empty string, array or object.
    Required,
    /// Minimum length of a string (in characters), array or object.
    MinLen(usize),
    MaxLen(usize),
    /// Numeric lower bound, inclusive.
    Min(f64),
    Max(f64),
    /// String (or number) must be one of the listed values.
    OneOf(Vec<String>),
    Email,
}

impl Constraint {
    pub fn tag(&self) -> &'static str {
        match self {
            Constraint::Required => "required",
            Constraint::MinLen(_) => "min_len",
            Constraint::MaxLen(_) => "max_len",
            Constraint::Min(_) => "min",
            Constraint::Max(_) => "max",
            Constraint::OneOf(_) => "one_of",
            Constraint::Email => "email",
        }
    }

    /// Whether `value` (absent when `None`) satisfies the constraint.
    ///
    /// Only `Required` rejects an absent or null value.
    pub fn accepts(&self, value: Option<&Value>) -> bool {
        let value = match value {
            None | Some(Value::Null) => return !matches!(self, Constraint::Required),
            Some(v) => v,
        };

        match self {
            Constraint::Required => match value {
                Value::String(s) => !s.is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
                _ => true,
            },
            Constraint::MinLen(n) => length(value).map_or(true, |len| len >= *n),
            Constraint::MaxLen(n) => length(value).map_or(true, |len| len <= *n),
            Constraint::Min(n) => value.as_f64().map_or(true, |v| v >= *n),
            Constraint::Max(n) => value.as_f64().map_or(true, |v| v <= *n),
            Constraint::OneOf(allowed) => {
                let text = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return false,
                };
                allowed.iter().any(|a| *a == text)
            }
            Constraint::Email => value.as_str().is_some_and(looks_like_email),
        }
    }
}

fn length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        Value::Object(o) => Some(o.len()),
        _ => None,
    }
}

fn looks_like_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !s.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
}

#[derive(Debug, Clone)]
struct Rule {
    constraint: Constraint,
    message: Option<String>,
}

/// Constraints and messages for one field path (dotted, e.g. `profile.email`).
#[derive(Debug, Clone)]
pub struct FieldRules {
    path: String,
    message: Option<String>,
    rules: Vec<Rule>,
}

impl FieldRules {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: None,
            rules: Vec::new(),
        }
    }

    /// Generic message used when a constraint has none of its own.
    pub fn msg(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn check(mut self, constraint: Constraint) -> Self {
        self.rules.push(Rule { constraint, message: None });
        self
    }

    /// Add a constraint with its own message.
    pub fn check_msg(mut self, constraint: Constraint, message: impl Into<String>) -> Self {
        self.rules.push(Rule {
            constraint,
            message: Some(message.into()),
        });
        self
    }

    pub fn required(self) -> Self {
        self.check(Constraint::Required)
    }

    pub fn required_msg(self, message: impl Into<String>) -> Self {
        self.check_msg(Constraint::Required, message)
    }
}

/// The first constraint a payload failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub field: String,
    pub tag: &'static str,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Field path → constraints table for one request type.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<FieldRules>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, rules: FieldRules) -> Self {
        self.fields.push(rules);
        self
    }

    /// First violated constraint, in declaration order.
    pub fn violation(&self, payload: &Value) -> Option<Violation> {
        self.fields.iter().find_map(|field| {
            let value = lookup(payload, &field.path);
            field
                .rules
                .iter()
                .find(|rule| !rule.constraint.accepts(value))
                .map(|rule| Violation {
                    field: field.path.clone(),
                    tag: rule.constraint.tag(),
                    message: self.message_for(&field.path, rule.constraint.tag()),
                })
        })
    }

    /// Message for a failed `tag` on `path`.
    pub fn message_for(&self, path: &str, tag: &str) -> String {
        let field = self.fields.iter().find(|f| f.path == path);
        field
            .and_then(|f| {
                f.rules
                    .iter()
                    .find(|r| r.constraint.tag() == tag)
                    .and_then(|r| r.message.clone())
                    .or_else(|| f.message.clone())
            })
            .unwrap_or_else(|| format!("{path}:{tag}"))
    }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |node, segment| node.get(segment))
}

/// Request types that carry a binding schema.
///
/// ```ignore
/// impl RequestSchema for HelloReq {
///     fn schema() -> &'static Schema {
///         static SCHEMA: LazyLock<Schema> = LazyLock::new(|| {
///             Schema::new().field(FieldRules::new("name").required_msg("name is required"))
///         });
///         &SCHEMA
///     }
/// }
/// ```
pub trait RequestSchema {
    fn schema() -> &'static Schema;
}

/// Bind a JSON payload into `T`, producing a single user-facing message on
/// failure.
pub fn bind_json<T>(body: &[u8]) -> Result<T, String>
where
    T: DeserializeOwned + RequestSchema,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(MALFORMED.to_string());
    }
    let payload: Value = serde_json::from_slice(body).map_err(|_| MALFORMED.to_string())?;
    // Field paths address an object; derived structs would also accept arrays.
    if !payload.is_object() {
        return Err(MALFORMED.to_string());
    }
    let schema = T::schema();

    match serde_path_to_error::deserialize::<_, T>(&payload) {
        Ok(parsed) => match schema.violation(&payload) {
            Some(violation) => Err(violation.message),
            None => Ok(parsed),
        },
        Err(err) => Err(translate_decode_error(&err, schema, &payload)),
    }
}

fn translate_decode_error(
    err: &serde_path_to_error::Error<serde_json::Error>,
    schema: &Schema,
    payload: &Value,
) -> String {
    let path = match err.path().to_string() {
        p if p == "." || p.is_empty() => String::new(),
        p => p,
    };
    let text = err.inner().to_string();

    if let Some(missing) = text
        .strip_prefix("missing field `")
        .and_then(|rest| rest.split_once('`'))
        .map(|(name, _)| name)
    {
        if let Some(violation) = schema.violation(payload) {
            return violation.message;
        }
        let field = if path.is_empty() { missing.to_string() } else { format!("{path}.{missing}") };
        return schema.message_for(&field, Constraint::Required.tag());
    }

    // Serde's wording at the root names the target type.
    if path.is_empty() {
        return MALFORMED.to_string();
    }

    // Null is an absent value to the schema, so a required rule speaks first.
    if text.starts_with("invalid type: null") {
        if let Some(violation) = schema.violation(payload) {
            return violation.message;
        }
    }

    let mismatch = text
        .strip_prefix("invalid type: ")
        .or_else(|| text.strip_prefix("invalid value: "))
        .and_then(|rest| rest.rsplit_once(", expected "));
    match mismatch {
        Some((received, expected)) => format!("{path} expects {}, got {received}", describe(expected)),
        None => format!("{path} is malformed"),
    }
}

fn describe(expected: &str) -> &str {
    if expected.starts_with("struct ") {
        "an object"
    } else {
        expected
    }
}

/// Extractor binding the JSON body into `T` and validating it against
/// `T::schema()`. Rejections are 400 envelopes with code 400.
#[derive(Debug, Clone)]
pub struct Bind<T>(pub T);

impl<S, T> FromRequest<S> for Bind<T>
where
    T: DeserializeOwned + RequestSchema,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let body = Bytes::from_request(req, state).await.map_err(|rejection| {
            if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                AppError::Bind(TOO_LARGE.to_string())
            } else {
                AppError::Bind(MALFORMED.to_string())
            }
        })?;

        bind_json::<T>(&body).map(Bind).map_err(|message| {
            tracing::debug!(error = %message, "Request binding failed");
            AppError::Bind(message)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::LazyLock;

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct HelloReq {
        name: String,
        #[serde(default)]
        age: Option<u32>,
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        profile: Option<Profile>,
    }

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct Profile {
        #[serde(default)]
        email: String,
    }

    impl RequestSchema for HelloReq {
        fn schema() -> &'static Schema {
            static SCHEMA: LazyLock<Schema> = LazyLock::new(|| {
                Schema::new()
                    .field(
                        FieldRules::new("name")
                            .msg("name is invalid")
                            .required_msg("name is required")
                            .check(Constraint::MaxLen(8)),
                    )
                    .field(FieldRules::new("age").check(Constraint::Min(18.0)))
                    .field(FieldRules::new("role").check(Constraint::OneOf(vec!["admin".into(), "user".into()])))
                    .field(FieldRules::new("profile.email").check_msg(Constraint::Email, "email looks wrong"))
            });
            &SCHEMA
        }
    }

    fn bind(body: &str) -> Result<HelloReq, String> {
        bind_json::<HelloReq>(body.as_bytes())
    }

    #[test]
    fn test_empty_and_truncated_bodies() {
        assert_eq!(bind("").unwrap_err(), MALFORMED);
        assert_eq!(bind("  \n").unwrap_err(), MALFORMED);
        assert_eq!(bind(r#"{"name": "al"#).unwrap_err(), MALFORMED);
    }

    #[test]
    fn test_missing_required_uses_specific_message() {
        assert_eq!(bind("{}").unwrap_err(), "name is required");
        assert_eq!(bind(r#"{"name": ""}"#).unwrap_err(), "name is required");
    }

    #[test]
    fn test_generic_message_fallback() {
        assert_eq!(bind(r#"{"name": "much too long"}"#).unwrap_err(), "name is invalid");
    }

    #[test]
    fn test_field_tag_fallback() {
        assert_eq!(bind(r#"{"name": "al", "age": 12}"#).unwrap_err(), "age:min");
        assert_eq!(bind(r#"{"name": "al", "role": "root"}"#).unwrap_err(), "role:one_of");
    }

    #[test]
    fn test_nested_path() {
        let err = bind(r#"{"name": "al", "profile": {"email": "nope"}}"#).unwrap_err();
        assert_eq!(err, "email looks wrong");
        assert!(bind(r#"{"name": "al", "profile": {"email": "al@example.com"}}"#).is_ok());
    }

    #[test]
    fn test_type_mismatch_names_field() {
        let err = bind(r#"{"name": "al", "age": "old"}"#).unwrap_err();
        assert_eq!(err, r#"age expects u32, got string "old""#);
    }

    #[test]
    fn test_null_counts_as_missing() {
        assert_eq!(bind(r#"{"name": null}"#).unwrap_err(), "name is required");
        assert_eq!(bind(r#"{"name": "al", "age": null}"#).unwrap().age, None);
    }

    #[test]
    fn test_non_object_body_is_malformed() {
        assert_eq!(bind("[]").unwrap_err(), MALFORMED);
        assert_eq!(bind(r#"["al"]"#).unwrap_err(), MALFORMED);
        assert_eq!(bind(r#""al""#).unwrap_err(), MALFORMED);
        assert_eq!(bind("42").unwrap_err(), MALFORMED);
        assert_eq!(bind("null").unwrap_err(), MALFORMED);
    }

    #[test]
    fn test_nested_mismatch_hides_type_names() {
        let err = bind(r#"{"name": "al", "profile": 5}"#).unwrap_err();
        assert_eq!(err, "profile expects an object, got integer `5`");
    }

    #[test]
    fn test_first_violation_wins() {
        let err = bind(r#"{"name": "", "age": 3, "role": "root"}"#).unwrap_err();
        assert_eq!(err, "name is required");
    }

    #[test]
    fn test_valid_payload_binds() {
        let req = bind(r#"{"name": "alice", "age": 30, "role": "admin"}"#).unwrap();
        assert_eq!(req.name, "alice");
        assert_eq!(req.age, Some(30));
    }

    #[test]
    fn test_email_shapes() {
        assert!(looks_like_email("a@b.io"));
        assert!(!looks_like_email("a@b"));
        assert!(!looks_like_email("@b.io"));
        assert!(!looks_like_email("a b@c.io"));
    }
}
