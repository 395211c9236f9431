//! Inbound payload validation
//!
//! Every consumed message passes through [`ValidationPipe`] before any handler
//! sees it. The pipe checks the raw JSON against the message family's declared
//! shape (strict whitelist, required fields, enum membership, nested objects),
//! then deserializes it and runs the family's `validator` rules.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// Top-level message of every validation failure
pub const VALIDATION_FAILED_MESSAGE: &str = "Validation failed for message payload";

/// A single violated field, possibly with nested violations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Constraint name to human-readable message
    pub constraints: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FieldViolation>,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, value: Option<&Value>) -> Self {
        Self {
            field: field.into(),
            value: value.cloned(),
            constraints: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, name: &str, message: impl Into<String>) -> Self {
        self.constraints.insert(name.to_string(), message.into());
        self
    }
}

/// Structured rejection of an inbound payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationFailure {
    pub message: String,
    pub errors: Vec<FieldViolation>,
}

impl ValidationFailure {
    pub fn new(errors: Vec<FieldViolation>) -> Self {
        Self {
            message: VALIDATION_FAILED_MESSAGE.to_string(),
            errors,
        }
    }

    /// Find a top-level violation by field name
    pub fn violation(&self, field: &str) -> Option<&FieldViolation> {
        self.errors.iter().find(|violation| violation.field == field)
    }

    /// Whether any violation (at any depth) carries the given constraint
    pub fn has_constraint(&self, constraint: &str) -> bool {
        fn walk(violations: &[FieldViolation], constraint: &str) -> bool {
            violations.iter().any(|violation| {
                violation.constraints.contains_key(constraint)
                    || walk(&violation.children, constraint)
            })
        }
        walk(&self.errors, constraint)
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        let summary: Vec<String> = self
            .errors
            .iter()
            .map(|violation| {
                let constraints: Vec<&str> =
                    violation.constraints.keys().map(String::as_str).collect();
                if constraints.is_empty() {
                    violation.field.clone()
                } else {
                    format!("{} ({})", violation.field, constraints.join(", "))
                }
            })
            .collect();
        if !summary.is_empty() {
            write!(f, ": {}", summary.join("; "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationFailure {}

/// Expected JSON type of a declared field
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    String,
    /// String restricted to a closed set of values
    Enum(&'static [&'static str]),
    /// Nested object with its own shape
    Object(&'static [FieldSpec]),
    Any,
}

/// One declared field of a message shape
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// Wire (camelCase) name
    pub name: &'static str,
    pub required: bool,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            required: true,
            kind,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            required: false,
            kind,
        }
    }
}

/// A message family the pipe can validate into
pub trait MessageContract:
    DeserializeOwned + Serialize + Validate + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Family name used in logs
    const FAMILY: &'static str;

    /// Declared wire shape
    fn shape() -> &'static [FieldSpec];
}

/// Transforms raw payloads into validated message families
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationPipe;

impl ValidationPipe {
    pub fn new() -> Self {
        Self
    }

    /// Unwrap an envelope carrying the payload under `body`
    pub fn unwrap_envelope(raw: &Value) -> &Value {
        match raw.get("body") {
            Some(body) if body.is_object() => body,
            _ => raw,
        }
    }

    /// Validate a raw payload and produce the typed message
    pub fn transform<T: MessageContract>(&self, raw: &Value) -> Result<T, ValidationFailure> {
        let payload = Self::unwrap_envelope(raw);

        let violations = check_shape(payload, T::shape());
        if !violations.is_empty() {
            return Err(ValidationFailure::new(violations));
        }

        let message: T = serde_json::from_value(payload.clone()).map_err(|err| {
            ValidationFailure::new(vec![FieldViolation::new("payload", Some(payload))
                .with_constraint("isDeserializable", err.to_string())])
        })?;

        message
            .validate()
            .map_err(|errors| ValidationFailure::new(convert_errors(&errors, Some(payload))))?;

        Ok(message)
    }
}

/// Check a JSON value against a declared shape
pub fn check_shape(value: &Value, shape: &[FieldSpec]) -> Vec<FieldViolation> {
    let object = match value.as_object() {
        Some(object) => object,
        None => {
            return vec![FieldViolation::new("payload", Some(value))
                .with_constraint("isObject", "payload must be an object")]
        }
    };

    let mut violations = Vec::new();

    for spec in shape {
        let field_value = object.get(spec.name).filter(|value| !value.is_null());
        match field_value {
            None if spec.required => violations.push(
                FieldViolation::new(spec.name, None).with_constraint(
                    "isDefined",
                    format!("{} should not be null or undefined", spec.name),
                ),
            ),
            None => {}
            Some(field_value) => {
                if let Some(violation) = check_field(spec, field_value) {
                    violations.push(violation);
                }
            }
        }
    }

    for (key, field_value) in object {
        if !shape.iter().any(|spec| spec.name == key) {
            violations.push(
                FieldViolation::new(key.as_str(), Some(field_value)).with_constraint(
                    "whitelistValidation",
                    format!("property {} should not exist", key),
                ),
            );
        }
    }

    violations
}

fn check_field(spec: &FieldSpec, value: &Value) -> Option<FieldViolation> {
    match spec.kind {
        FieldKind::Any => None,
        FieldKind::String => (!value.is_string()).then(|| {
            FieldViolation::new(spec.name, Some(value))
                .with_constraint("isString", format!("{} must be a string", spec.name))
        }),
        FieldKind::Enum(allowed) => {
            let is_member = value
                .as_str()
                .map(|candidate| allowed.contains(&candidate))
                .unwrap_or(false);
            (!is_member).then(|| {
                FieldViolation::new(spec.name, Some(value)).with_constraint(
                    "isIn",
                    format!(
                        "{} must be one of the following values: {}",
                        spec.name,
                        allowed.join(", ")
                    ),
                )
            })
        }
        FieldKind::Object(nested) => {
            if !value.is_object() {
                return Some(
                    FieldViolation::new(spec.name, Some(value))
                        .with_constraint("isObject", format!("{} must be an object", spec.name)),
                );
            }
            let children = check_shape(value, nested);
            (!children.is_empty()).then(|| FieldViolation {
                field: spec.name.to_string(),
                value: Some(value.clone()),
                constraints: BTreeMap::new(),
                children,
            })
        }
    }
}

fn convert_errors(errors: &ValidationErrors, payload: Option<&Value>) -> Vec<FieldViolation> {
    let mut violations: Vec<FieldViolation> = errors
        .errors()
        .iter()
        .map(|(field, kind)| {
            let field = camel_case(field);
            let value = payload.and_then(|payload| payload.get(&field));
            let mut violation = FieldViolation::new(field.clone(), value);
            match kind {
                ValidationErrorsKind::Field(field_errors) => {
                    for error in field_errors {
                        let message = error
                            .message
                            .as_ref()
                            .map(|message| message.to_string())
                            .unwrap_or_else(|| default_message(&field, &error.code));
                        violation
                            .constraints
                            .insert(constraint_name(&error.code), message);
                    }
                }
                ValidationErrorsKind::Struct(nested) => {
                    violation.children = convert_errors(nested, value);
                }
                ValidationErrorsKind::List(items) => {
                    for (index, nested) in items {
                        let item = value.and_then(|value| value.get(*index));
                        violation.children.push(FieldViolation {
                            field: index.to_string(),
                            value: item.cloned(),
                            constraints: BTreeMap::new(),
                            children: convert_errors(nested, item),
                        });
                    }
                }
            }
            violation
        })
        .collect();
    violations.sort_by(|a, b| a.field.cmp(&b.field));
    violations
}

fn constraint_name(code: &str) -> String {
    match code {
        "email" => "isEmail".to_string(),
        "length" => "isLength".to_string(),
        "url" => "isUrl".to_string(),
        "range" => "isInRange".to_string(),
        other => other.to_string(),
    }
}

fn default_message(field: &str, code: &str) -> String {
    match code {
        "email" => format!("{} must be an email", field),
        "length" => format!("{} has an invalid length", field),
        "url" => format!("{} must be a URL address", field),
        other => format!("{} failed {} validation", field, other),
    }
}

fn camel_case(field: &str) -> String {
    let mut result = String::with_capacity(field.len());
    let mut upper_next = false;
    for ch in field.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            result.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            result.push(ch);
        }
    }
    result
}
