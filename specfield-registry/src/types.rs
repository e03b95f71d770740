//! Core field-configuration types.
//!
//! These types mirror the record shape owned by the external document store,
//! so they serialize with camelCase keys (`displayOrder`, `isActive`, ...).
//! A [`FieldConfig`] describes one specification input; a
//! [`CategoryFieldMapping`] declares which fields a product category needs.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::UnknownFieldType;

/// The primitive type of a field, which determines what shape the value takes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Select,
    Multiselect,
    Boolean,
    Textarea,
    Email,
    Url,
    Date,
    Range,
}

impl FieldType {
    /// Every supported field type.
    pub const ALL: [FieldType; 10] = [
        FieldType::Text,
        FieldType::Number,
        FieldType::Select,
        FieldType::Multiselect,
        FieldType::Boolean,
        FieldType::Textarea,
        FieldType::Email,
        FieldType::Url,
        FieldType::Date,
        FieldType::Range,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Select => "select",
            FieldType::Multiselect => "multiselect",
            FieldType::Boolean => "boolean",
            FieldType::Textarea => "textarea",
            FieldType::Email => "email",
            FieldType::Url => "url",
            FieldType::Date => "date",
            FieldType::Range => "range",
        }
    }

    /// Select and multiselect fields carry an option list.
    pub fn has_options(&self) -> bool {
        matches!(self, FieldType::Select | FieldType::Multiselect)
    }

    /// Number and range fields hold numeric values.
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Number | FieldType::Range)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = UnknownFieldType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownFieldType(s.to_string()))
    }
}

/// Declarative validation bounds for a field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Replaces the built-in message when a rule fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ValidationRules {
    pub fn is_empty(&self) -> bool {
        self == &ValidationRules::default()
    }
}

/// A single option in a select or multiselect field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
}

impl SelectOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// Comparison applied between a sibling field's value and a rule value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    In,
    NotIn,
}

/// What happens to the owning field when a rule's condition holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConditionalAction {
    Show,
    Hide,
    Require,
    Disable,
    Enable,
}

/// Makes a field's visibility, requirement or editability depend on another field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalRule {
    pub depends_on: String,
    pub condition: Condition,
    #[serde(default)]
    pub value: Value,
    pub action: ConditionalAction,
}

impl ConditionalRule {
    pub fn new(
        depends_on: impl Into<String>,
        condition: Condition,
        value: impl Into<Value>,
        action: ConditionalAction,
    ) -> Self {
        Self {
            depends_on: depends_on.into(),
            condition,
            value: value.into(),
            action,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

/// A field configuration: the complete schema for one specification input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldConfig {
    pub id: String,
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "ValidationRules::is_empty")]
    pub validation: ValidationRules,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<SelectOption>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditional: Vec<ConditionalRule>,
    /// Id of the [`FieldGroup`] this field renders in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl FieldConfig {
    /// Whether this field is registered for the given category.
    pub fn belongs_to(&self, category_id: &str) -> bool {
        self.categories.iter().any(|c| c == category_id)
    }

    /// The configured option values, in declaration order.
    pub fn option_values(&self) -> impl Iterator<Item = &str> {
        self.options.iter().map(|o| o.value.as_str())
    }
}

/// Payload for creating a field. The store assigns id, version and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewFieldConfig {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "ValidationRules::is_empty")]
    pub validation: ValidationRules,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<SelectOption>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditional: Vec<ConditionalRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl NewFieldConfig {
    pub fn new(key: impl Into<String>, label: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            field_type,
            categories: Vec::new(),
            required: false,
            validation: ValidationRules::default(),
            options: Vec::new(),
            conditional: Vec::new(),
            group: None,
            placeholder: None,
            help_text: None,
            unit: None,
            display_order: 0,
            is_active: true,
        }
    }

    pub fn category(mut self, category_id: impl Into<String>) -> Self {
        self.categories.push(category_id.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn validation(mut self, rules: ValidationRules) -> Self {
        self.validation = rules;
        self
    }

    pub fn option(mut self, value: impl Into<String>, label: impl Into<String>) -> Self {
        self.options.push(SelectOption::new(value, label));
        self
    }

    pub fn conditional(mut self, rule: ConditionalRule) -> Self {
        self.conditional.push(rule);
        self
    }

    pub fn group(mut self, group_id: impl Into<String>) -> Self {
        self.group = Some(group_id.into());
        self
    }

    pub fn display_order(mut self, order: i32) -> Self {
        self.display_order = order;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Materialize into a stored record.
    pub fn into_config(self, id: impl Into<String>, now: DateTime<Utc>) -> FieldConfig {
        FieldConfig {
            id: id.into(),
            key: self.key,
            label: self.label,
            field_type: self.field_type,
            categories: self.categories,
            required: self.required,
            validation: self.validation,
            options: self.options,
            conditional: self.conditional,
            group: self.group,
            placeholder: self.placeholder,
            help_text: self.help_text,
            unit: self.unit,
            display_order: self.display_order,
            is_active: self.is_active,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A partial update. `None` leaves the stored property untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FieldPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<SelectOption>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional: Option<Vec<ConditionalRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_order: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl FieldPatch {
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    pub fn active(is_active: bool) -> Self {
        Self {
            is_active: Some(is_active),
            ..Self::default()
        }
    }

    /// Apply the patch in place. Does not touch version or timestamps.
    pub fn apply_to(&self, field: &mut FieldConfig) {
        if let Some(ref key) = self.key {
            field.key = key.clone();
        }
        if let Some(ref label) = self.label {
            field.label = label.clone();
        }
        if let Some(field_type) = self.field_type {
            field.field_type = field_type;
        }
        if let Some(ref categories) = self.categories {
            field.categories = categories.clone();
        }
        if let Some(required) = self.required {
            field.required = required;
        }
        if let Some(ref validation) = self.validation {
            field.validation = validation.clone();
        }
        if let Some(ref options) = self.options {
            field.options = options.clone();
        }
        if let Some(ref conditional) = self.conditional {
            field.conditional = conditional.clone();
        }
        if let Some(ref group) = self.group {
            field.group = Some(group.clone());
        }
        if let Some(ref placeholder) = self.placeholder {
            field.placeholder = Some(placeholder.clone());
        }
        if let Some(ref help_text) = self.help_text {
            field.help_text = Some(help_text.clone());
        }
        if let Some(ref unit) = self.unit {
            field.unit = Some(unit.clone());
        }
        if let Some(order) = self.display_order {
            field.display_order = order;
        }
        if let Some(is_active) = self.is_active {
            field.is_active = is_active;
        }
    }
}

/// A visual grouping of fields in a rendered form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FieldGroup {
    pub id: String,
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default)]
    pub collapsible: bool,
    #[serde(default = "default_true")]
    pub default_expanded: bool,
}

/// Broad classification of a product category by its specification fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CategoryType {
    Ampere,
    VoltWatt,
    Wire,
    Light,
    #[default]
    General,
}

impl CategoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryType::Ampere => "ampere",
            CategoryType::VoltWatt => "volt-watt",
            CategoryType::Wire => "wire",
            CategoryType::Light => "light",
            CategoryType::General => "general",
        }
    }
}

impl fmt::Display for CategoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Associates a product category with the field keys it requires or accepts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CategoryFieldMapping {
    pub category_id: String,
    #[serde(default)]
    pub category_type: CategoryType,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub optional_fields: Vec<String>,
    /// Field whose value becomes a product's display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_source_field: Option<String>,
}

impl CategoryFieldMapping {
    pub fn requires(&self, key: &str) -> bool {
        self.required_fields.iter().any(|k| k == key)
    }
}
