//! Validation engine for per-field and per-form checks, including conditional rules.
//!
//! Validation failures are data, not errors: every check returns structured
//! error and warning lists the user can act on.
//!
//! Conditional rules are evaluated in a single pass against the sibling values
//! already present in the form. Chains (A depends on B depends on C) are not
//! iterated to a fixed point; each call sees B's raw value, not B's own
//! conditional state.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate};
use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{trace, warn};

use crate::types::{Condition, ConditionalAction, ConditionalRule, FieldConfig, FieldType};

/// Field values keyed by field key.
pub type FormValues = HashMap<String, Value>;

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex is valid")
});

/// Outcome of validating one field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Default for FieldValidationResult {
    fn default() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// Outcome of validating a whole form. Only fields with messages appear in the maps.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormValidationResult {
    pub is_valid: bool,
    pub errors: HashMap<String, Vec<String>>,
    pub warnings: HashMap<String, Vec<String>>,
}

/// How conditional rules leave a field for the current values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldState {
    pub visible: bool,
    pub required: bool,
    pub disabled: bool,
}

/// Sibling values and surrounding metadata for validating one field.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub values: &'a FormValues,
    pub category_id: Option<&'a str>,
    /// The full field set, when known. Enables dangling-dependency warnings.
    pub fields: Option<&'a [FieldConfig]>,
}

impl<'a> ValidationContext<'a> {
    pub fn new(values: &'a FormValues) -> Self {
        Self {
            values,
            category_id: None,
            fields: None,
        }
    }

    pub fn with_fields(mut self, fields: &'a [FieldConfig]) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_category(mut self, category_id: Option<&'a str>) -> Self {
        self.category_id = category_id;
        self
    }
}

/// Validates values against field configurations.
#[derive(Default)]
pub struct ValidationEngine {
    /// Compiled `validation.pattern` regexes; `None` marks an invalid pattern.
    patterns: DashMap<String, Option<Regex>>,
}

impl ValidationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a field's visibility, requirement and editability.
    pub fn evaluate_conditions(&self, config: &FieldConfig, values: &FormValues) -> FieldState {
        let mut state = FieldState {
            visible: true,
            required: config.required,
            disabled: false,
        };
        for rule in &config.conditional {
            let met = condition_met(rule, values.get(&rule.depends_on).unwrap_or(&Value::Null));
            match rule.action {
                ConditionalAction::Show if !met => state.visible = false,
                ConditionalAction::Hide if met => state.visible = false,
                ConditionalAction::Require if met => state.required = true,
                ConditionalAction::Disable if met => state.disabled = true,
                ConditionalAction::Enable if !met => state.disabled = true,
                _ => {}
            }
        }
        state
    }

    /// Validate one value.
    ///
    /// Hidden and disabled fields are always valid. An empty value is an error
    /// only when required, and skips the type checks either way.
    pub fn validate_field(
        &self,
        config: &FieldConfig,
        value: &Value,
        context: &ValidationContext<'_>,
    ) -> FieldValidationResult {
        let mut result = FieldValidationResult::default();

        if let Some(fields) = context.fields {
            for rule in &config.conditional {
                if !fields.iter().any(|f| f.key == rule.depends_on) {
                    result.warnings.push(format!(
                        "{} depends on unknown field '{}'",
                        config.label, rule.depends_on
                    ));
                }
            }
        }

        let state = self.evaluate_conditions(config, context.values);
        if !state.visible || state.disabled {
            trace!(key = %config.key, ?state, "skipping inactive field");
            return result;
        }

        if is_empty_value(value) {
            if state.required {
                result.errors.push(format!("{} is required", config.label));
                result.is_valid = false;
            }
            return result;
        }

        match config.field_type {
            FieldType::Text | FieldType::Textarea => self.check_text(config, value, &mut result),
            FieldType::Number | FieldType::Range => check_number(config, value, &mut result),
            FieldType::Email => check_email(config, value, &mut result),
            FieldType::Url => check_url(config, value, &mut result),
            FieldType::Date => check_date(config, value, &mut result),
            FieldType::Boolean => check_boolean(config, value, &mut result),
            FieldType::Select => check_select(config, value, &mut result),
            FieldType::Multiselect => check_multiselect(config, value, &mut result),
        }

        result.is_valid = result.errors.is_empty();
        result
    }

    /// Validate every field and aggregate the results.
    ///
    /// With a `category_id`, fields assigned to other categories are skipped.
    pub fn validate_form(
        &self,
        fields: &[FieldConfig],
        values: &FormValues,
        category_id: Option<&str>,
    ) -> FormValidationResult {
        let context = ValidationContext::new(values)
            .with_fields(fields)
            .with_category(category_id);
        let mut errors = HashMap::new();
        let mut warnings = HashMap::new();

        for field in fields {
            if let Some(category_id) = category_id {
                if !field.categories.is_empty() && !field.belongs_to(category_id) {
                    continue;
                }
            }
            let value = values.get(&field.key).unwrap_or(&Value::Null);
            let result = self.validate_field(field, value, &context);
            if !result.errors.is_empty() {
                errors.insert(field.key.clone(), result.errors);
            }
            if !result.warnings.is_empty() {
                warnings.insert(field.key.clone(), result.warnings);
            }
        }

        FormValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    fn check_text(&self, config: &FieldConfig, value: &Value, result: &mut FieldValidationResult) {
        let Some(text) = scalar_text(value) else {
            result
                .errors
                .push(failure(config, format!("{} must be text", config.label)));
            return;
        };
        let rules = &config.validation;
        let length = text.chars().count();

        if let Some(min) = rules.min_length {
            if length < min {
                result.errors.push(failure(
                    config,
                    format!("{} must be at least {min} characters", config.label),
                ));
            }
        }
        if let Some(max) = rules.max_length {
            if length > max {
                result.errors.push(failure(
                    config,
                    format!("{} must be at most {max} characters", config.label),
                ));
            }
        }
        if let Some(ref pattern) = rules.pattern {
            match self.compiled(pattern) {
                Some(re) if !re.is_match(&text) => result.errors.push(failure(
                    config,
                    format!("{} has an invalid format", config.label),
                )),
                Some(_) => {}
                None => result.warnings.push(format!(
                    "validation pattern for {} is invalid and was ignored",
                    config.label
                )),
            }
        }
    }

    fn compiled(&self, pattern: &str) -> Option<Regex> {
        if let Some(cached) = self.patterns.get(pattern) {
            return cached.clone();
        }
        let compiled = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(%pattern, error = %e, "invalid validation pattern");
                None
            }
        };
        self.patterns.insert(pattern.to_string(), compiled.clone());
        compiled
    }
}

/// The configured `errorMessage`, or the built-in one.
fn failure(config: &FieldConfig, default: String) -> String {
    config
        .validation
        .error_message
        .clone()
        .unwrap_or(default)
}

fn check_number(config: &FieldConfig, value: &Value, result: &mut FieldValidationResult) {
    let Some(number) = as_number(value) else {
        result
            .errors
            .push(failure(config, format!("{} must be a number", config.label)));
        return;
    };
    if let Some(min) = config.validation.min {
        if number < min {
            result
                .errors
                .push(failure(config, format!("{} must be at least {min}", config.label)));
        }
    }
    if let Some(max) = config.validation.max {
        if number > max {
            result
                .errors
                .push(failure(config, format!("{} must be at most {max}", config.label)));
        }
    }
}

fn check_email(config: &FieldConfig, value: &Value, result: &mut FieldValidationResult) {
    let valid = value.as_str().is_some_and(|s| EMAIL_REGEX.is_match(s.trim()));
    if !valid {
        result.errors.push(failure(
            config,
            format!("{} must be a valid email address", config.label),
        ));
    }
}

fn check_url(config: &FieldConfig, value: &Value, result: &mut FieldValidationResult) {
    let valid = value
        .as_str()
        .and_then(|s| url::Url::parse(s.trim()).ok())
        .is_some_and(|u| u.has_host());
    if !valid {
        result
            .errors
            .push(failure(config, format!("{} must be a valid URL", config.label)));
    }
}

fn check_date(config: &FieldConfig, value: &Value, result: &mut FieldValidationResult) {
    let valid = value.as_str().is_some_and(|s| {
        let s = s.trim();
        NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() || DateTime::parse_from_rfc3339(s).is_ok()
    });
    if !valid {
        result
            .errors
            .push(failure(config, format!("{} must be a valid date", config.label)));
    }
}

fn check_boolean(config: &FieldConfig, value: &Value, result: &mut FieldValidationResult) {
    let valid = match value {
        Value::Bool(_) => true,
        Value::String(s) => matches!(s.as_str(), "true" | "false"),
        _ => false,
    };
    if !valid {
        result
            .errors
            .push(failure(config, format!("{} must be true or false", config.label)));
    }
}

fn check_select(config: &FieldConfig, value: &Value, result: &mut FieldValidationResult) {
    let valid = scalar_text(value).is_some_and(|v| config.option_values().any(|o| o == v));
    if !valid {
        result.errors.push(failure(
            config,
            format!("{} has an invalid selection", config.label),
        ));
    }
}

fn check_multiselect(config: &FieldConfig, value: &Value, result: &mut FieldValidationResult) {
    let selected: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    let invalid: Vec<String> = selected
        .into_iter()
        .filter_map(|item| match scalar_text(item) {
            Some(v) if config.option_values().any(|o| o == v) => None,
            Some(v) => Some(v),
            None => Some(item.to_string()),
        })
        .collect();
    if !invalid.is_empty() {
        result.errors.push(failure(
            config,
            format!(
                "{} contains invalid selections: {}",
                config.label,
                invalid.join(", ")
            ),
        ));
    }
}

/// Null, blank strings and empty lists count as "no value".
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Numbers, and strings that parse as numbers.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Scalars rendered as text; `None` for arrays and objects.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Equality that treats `3`, `3.0` and `"3"` alike.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    matches!((scalar_text(a), scalar_text(b)), (Some(x), Some(y)) if x == y)
}

fn is_in(actual: &Value, expected: &Value) -> bool {
    let Value::Array(candidates) = expected else {
        return loose_eq(actual, expected);
    };
    match actual {
        Value::Array(items) => items
            .iter()
            .any(|item| candidates.iter().any(|c| loose_eq(item, c))),
        _ => candidates.iter().any(|c| loose_eq(actual, c)),
    }
}

/// Whether a rule's condition holds for the dependency's current value.
pub fn condition_met(rule: &ConditionalRule, actual: &Value) -> bool {
    let expected = &rule.value;
    match rule.condition {
        Condition::Equals => loose_eq(actual, expected),
        Condition::NotEquals => !loose_eq(actual, expected),
        Condition::Contains => match actual {
            Value::Array(items) => items.iter().any(|item| loose_eq(item, expected)),
            Value::String(s) => scalar_text(expected).is_some_and(|needle| s.contains(&needle)),
            _ => false,
        },
        Condition::GreaterThan => {
            matches!((as_number(actual), as_number(expected)), (Some(a), Some(b)) if a > b)
        }
        Condition::LessThan => {
            matches!((as_number(actual), as_number(expected)), (Some(a), Some(b)) if a < b)
        }
        Condition::In => is_in(actual, expected),
        Condition::NotIn => !is_in(actual, expected),
    }
}
