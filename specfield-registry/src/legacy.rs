//! Legacy adapter
//!
//! Translates between [`FieldConfig`] and the older flat field-definition shape
//! still read by legacy form consumers, classifies categories by the field keys
//! they carry, and coerces legacy form data into typed values.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::data_access::FieldDataAccess;
use crate::error::{ConfigurationErrorCode, FieldConfigurationError, Result};
use crate::types::{
    CategoryFieldMapping, CategoryType, Condition, ConditionalAction, ConditionalRule,
    FieldConfig, FieldType, SelectOption, ValidationRules,
};
use crate::validation::{FormValidationResult, FormValues, ValidationEngine};

/// Key sets that identify a category type, checked in order. The first set
/// whose keys are all present wins; no match means [`CategoryType::General`].
pub const CATEGORY_TYPE_RULES: &[(&[&str], CategoryType)] = &[
    (&["amperage", "voltage"], CategoryType::Ampere),
    (&["watts", "voltage"], CategoryType::VoltWatt),
    (&["wireGauge", "core"], CategoryType::Wire),
    (&["lightType"], CategoryType::Light),
    (&["lumens"], CategoryType::Light),
];

/// Classify a category by the field keys registered for it.
pub fn infer_category_type<'a>(keys: impl IntoIterator<Item = &'a str>) -> CategoryType {
    let present: HashSet<&str> = keys.into_iter().collect();
    CATEGORY_TYPE_RULES
        .iter()
        .find(|(required, _)| required.iter().all(|k| present.contains(k)))
        .map(|(_, category_type)| *category_type)
        .unwrap_or_default()
}

/// An option in the legacy shape: either a bare value or a value/label pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LegacyOption {
    Plain(String),
    Labeled { value: String, label: String },
}

impl From<LegacyOption> for SelectOption {
    fn from(option: LegacyOption) -> Self {
        match option {
            LegacyOption::Plain(value) => SelectOption::new(value.clone(), value),
            LegacyOption::Labeled { value, label } => SelectOption::new(value, label),
        }
    }
}

/// The single conditional rule a legacy definition can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyCondition {
    pub field: String,
    #[serde(default = "default_condition")]
    pub condition: Condition,
    pub value: Value,
    #[serde(default = "default_action")]
    pub action: ConditionalAction,
}

fn default_condition() -> Condition {
    Condition::Equals
}

fn default_action() -> ConditionalAction {
    ConditionalAction::Show
}

fn default_true() -> bool {
    true
}

/// A field definition in the older, flat shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyFieldDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The field key.
    pub name: String,
    pub label: String,
    /// Legacy type name, e.g. `checkbox` or `multi-select`.
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<LegacyOption>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_when: Option<LegacyCondition>,
}

/// The category view legacy consumers expect.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyCategoryFieldMapping {
    pub category_id: String,
    pub category_type: CategoryType,
    pub required_fields: Vec<String>,
    pub optional_fields: Vec<String>,
    pub fields: Vec<LegacyFieldDefinition>,
}

fn legacy_type_name(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Boolean => "checkbox",
        FieldType::Multiselect => "multi-select",
        other => other.as_str(),
    }
}

fn parse_legacy_type(
    key: &str,
    name: &str,
) -> std::result::Result<FieldType, FieldConfigurationError> {
    match name {
        "checkbox" => Ok(FieldType::Boolean),
        "multi-select" => Ok(FieldType::Multiselect),
        other => other.parse().map_err(|_| {
            FieldConfigurationError::new(
                key,
                ConfigurationErrorCode::InvalidType,
                format!("unknown legacy field type '{other}'"),
            )
        }),
    }
}

/// Bridges the registry to legacy form consumers.
pub struct LegacyAdapter {
    data: Arc<FieldDataAccess>,
    validator: ValidationEngine,
}

impl LegacyAdapter {
    pub fn new(data: Arc<FieldDataAccess>) -> Self {
        Self {
            data,
            validator: ValidationEngine::new(),
        }
    }

    /// Convert to the legacy shape. Only the first conditional rule survives.
    pub fn to_legacy_field_definition(config: &FieldConfig) -> LegacyFieldDefinition {
        if config.conditional.len() > 1 {
            debug!(
                key = %config.key,
                dropped = config.conditional.len() - 1,
                "legacy shape keeps only the first conditional rule"
            );
        }
        LegacyFieldDefinition {
            id: Some(config.id.clone()),
            name: config.key.clone(),
            label: config.label.clone(),
            field_type: legacy_type_name(config.field_type).to_string(),
            required: config.required,
            min: config.validation.min,
            max: config.validation.max,
            min_length: config.validation.min_length,
            max_length: config.validation.max_length,
            pattern: config.validation.pattern.clone(),
            error_message: config.validation.error_message.clone(),
            options: config
                .options
                .iter()
                .map(|o| LegacyOption::Labeled {
                    value: o.value.clone(),
                    label: o.label.clone(),
                })
                .collect(),
            categories: config.categories.clone(),
            placeholder: config.placeholder.clone(),
            unit: config.unit.clone(),
            order: config.display_order,
            enabled: config.is_active,
            show_when: config.conditional.first().map(|rule| LegacyCondition {
                field: rule.depends_on.clone(),
                condition: rule.condition,
                value: rule.value.clone(),
                action: rule.action,
            }),
        }
    }

    /// Convert from the legacy shape. Definitions without an id get a fresh one.
    pub fn from_legacy_field_definition(
        legacy: &LegacyFieldDefinition,
    ) -> std::result::Result<FieldConfig, FieldConfigurationError> {
        let field_type = parse_legacy_type(&legacy.name, &legacy.field_type)?;
        let now = Utc::now();
        Ok(FieldConfig {
            id: legacy
                .id
                .clone()
                .unwrap_or_else(|| Ulid::new().to_string()),
            key: legacy.name.clone(),
            label: legacy.label.clone(),
            field_type,
            categories: legacy.categories.clone(),
            required: legacy.required,
            validation: ValidationRules {
                min: legacy.min,
                max: legacy.max,
                min_length: legacy.min_length,
                max_length: legacy.max_length,
                pattern: legacy.pattern.clone(),
                error_message: legacy.error_message.clone(),
            },
            options: legacy.options.iter().cloned().map(SelectOption::from).collect(),
            conditional: legacy
                .show_when
                .iter()
                .map(|c| {
                    ConditionalRule::new(c.field.clone(), c.condition, c.value.clone(), c.action)
                })
                .collect(),
            group: None,
            placeholder: legacy.placeholder.clone(),
            help_text: None,
            unit: legacy.unit.clone(),
            display_order: legacy.order,
            is_active: legacy.enabled,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    /// The category's fields in legacy shape, with an inferred category type.
    pub async fn get_legacy_category_field_mapping(
        &self,
        category_id: &str,
    ) -> Result<LegacyCategoryFieldMapping> {
        let fields = self.data.get_fields_for_category(category_id).await?;
        let mapping = self.data.get_category_mapping(category_id).await?;

        let category_type = infer_category_type(fields.iter().map(|f| f.key.as_str()));
        if category_type == CategoryType::General {
            debug!(%category_id, "no category type rule matched, using general");
        }
        if let Some(declared) = mapping.as_ref().map(|m| m.category_type) {
            if declared != category_type {
                warn!(
                    %category_id,
                    %declared,
                    inferred = %category_type,
                    "declared category type differs from field keys"
                );
            }
        }

        let is_required = |field: &FieldConfig| {
            field.required || mapping.as_ref().is_some_and(|m| m.requires(&field.key))
        };
        let (required, optional): (Vec<&FieldConfig>, Vec<&FieldConfig>) =
            fields.iter().partition(|f| is_required(*f));

        Ok(LegacyCategoryFieldMapping {
            category_id: category_id.to_string(),
            category_type,
            required_fields: required.iter().map(|f| f.key.clone()).collect(),
            optional_fields: optional.iter().map(|f| f.key.clone()).collect(),
            fields: fields.iter().map(Self::to_legacy_field_definition).collect(),
        })
    }

    /// Validate legacy form data against the category's current fields.
    pub async fn validate_form_data(
        &self,
        form_data: &FormValues,
        category_id: &str,
    ) -> Result<FormValidationResult> {
        let mut fields = self.data.get_fields_for_category(category_id).await?;
        if let Some(mapping) = self.data.get_category_mapping(category_id).await? {
            for field in fields.iter_mut().filter(|f| mapping.requires(&f.key)) {
                field.required = true;
            }
        }
        Ok(self
            .validator
            .validate_form(&fields, form_data, Some(category_id)))
    }

    /// Coerce legacy form data to the types the category's fields declare.
    /// Keys without a matching field pass through unchanged.
    pub async fn migrate_form_data(
        &self,
        form_data: &FormValues,
        category_id: &str,
    ) -> Result<FormValues> {
        let fields = self.data.get_fields_for_category(category_id).await?;
        Ok(migrate_values(&fields, form_data))
    }

    /// The product display name, read from the mapping's name source field.
    pub fn derive_display_name(
        mapping: &CategoryFieldMapping,
        values: &FormValues,
    ) -> Option<String> {
        let source = mapping.name_source_field.as_deref()?;
        match values.get(source)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Coerce every value whose key names one of `fields`.
pub fn migrate_values(fields: &[FieldConfig], form_data: &FormValues) -> FormValues {
    form_data
        .iter()
        .map(|(key, value)| {
            let migrated = match fields.iter().find(|f| f.key == *key) {
                Some(field) => coerce_value(field, value),
                None => value.clone(),
            };
            (key.clone(), migrated)
        })
        .collect()
}

fn coerce_value(field: &FieldConfig, value: &Value) -> Value {
    match (field.field_type, value) {
        (FieldType::Number | FieldType::Range, Value::String(s)) if !s.trim().is_empty() => {
            match s.trim().parse::<f64>() {
                Ok(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                    json!(n as i64)
                }
                Ok(n) if n.is_finite() => json!(n),
                _ => {
                    warn!(
                        key = %field.key,
                        value = %s,
                        "legacy value is not numeric, keeping as text"
                    );
                    value.clone()
                }
            }
        }
        (FieldType::Boolean, Value::String(s)) => match s.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => value.clone(),
        },
        (FieldType::Multiselect, Value::String(s)) if s.is_empty() => json!([]),
        (FieldType::Multiselect, Value::Array(_) | Value::Null) => value.clone(),
        (FieldType::Multiselect, scalar) => json!([scalar]),
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::FieldEventBus;
    use crate::store::MemoryFieldStore;
    use crate::types::NewFieldConfig;

    fn field(new: NewFieldConfig) -> FieldConfig {
        let id = format!("id-{}", new.key);
        new.into_config(id, Utc::now())
    }

    fn values(pairs: &[(&str, Value)]) -> FormValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn category_type_table() {
        assert_eq!(infer_category_type(["voltage", "amperage"]), CategoryType::Ampere);
        assert_eq!(infer_category_type(["watts", "voltage"]), CategoryType::VoltWatt);
        assert_eq!(infer_category_type(["core", "wireGauge", "color"]), CategoryType::Wire);
        assert_eq!(infer_category_type(["lumens"]), CategoryType::Light);
        assert_eq!(infer_category_type(["lightType"]), CategoryType::Light);
        assert_eq!(infer_category_type(["voltage"]), CategoryType::General);
        assert_eq!(infer_category_type(Vec::<&str>::new()), CategoryType::General);
    }

    #[test]
    fn round_trip_preserves_core_properties() {
        let original = field(
            NewFieldConfig::new("wireGauge", "Wire gauge", FieldType::Range)
                .category("wires")
                .required()
                .display_order(7)
                .validation(ValidationRules {
                    min: Some(0.5),
                    max: Some(16.0),
                    ..ValidationRules::default()
                })
                .conditional(ConditionalRule::new(
                    "material",
                    Condition::NotEquals,
                    "aluminium",
                    ConditionalAction::Show,
                )),
        );
        let legacy = LegacyAdapter::to_legacy_field_definition(&original);
        let back = LegacyAdapter::from_legacy_field_definition(&legacy).unwrap();

        assert_eq!(back.id, original.id);
        assert_eq!(back.key, original.key);
        assert_eq!(back.label, original.label);
        assert_eq!(back.field_type, original.field_type);
        assert_eq!(back.required, original.required);
        assert_eq!(back.validation, original.validation);
        assert_eq!(back.display_order, 7);
        assert_eq!(back.conditional, original.conditional);
    }

    #[test]
    fn type_names_are_renamed_both_ways() {
        let flag = field(NewFieldConfig::new("dimmable", "Dimmable", FieldType::Boolean));
        let legacy = LegacyAdapter::to_legacy_field_definition(&flag);
        assert_eq!(legacy.field_type, "checkbox");

        let multi = field(
            NewFieldConfig::new("colors", "Colors", FieldType::Multiselect).option("warm", "Warm"),
        );
        assert_eq!(
            LegacyAdapter::to_legacy_field_definition(&multi).field_type,
            "multi-select"
        );
        let back = LegacyAdapter::from_legacy_field_definition(&legacy).unwrap();
        assert_eq!(back.field_type, FieldType::Boolean);
    }

    #[test]
    fn legacy_json_with_plain_options() {
        let legacy: LegacyFieldDefinition = serde_json::from_value(json!({
            "name": "finish",
            "label": "Finish",
            "type": "select",
            "options": ["matte", {"value": "gloss", "label": "Glossy"}],
            "showWhen": {"field": "painted", "value": true}
        }))
        .unwrap();
        let config = LegacyAdapter::from_legacy_field_definition(&legacy).unwrap();

        assert!(config.is_active);
        assert_eq!(config.options[0], SelectOption::new("matte", "matte"));
        assert_eq!(config.options[1].label, "Glossy");
        assert_eq!(config.conditional[0].condition, Condition::Equals);
        assert_eq!(config.conditional[0].action, ConditionalAction::Show);
    }

    #[test]
    fn unknown_legacy_type_is_rejected() {
        let legacy: LegacyFieldDefinition = serde_json::from_value(json!({
            "name": "photo",
            "label": "Photo",
            "type": "file"
        }))
        .unwrap();
        let err = LegacyAdapter::from_legacy_field_definition(&legacy).unwrap_err();
        assert_eq!(err.code, ConfigurationErrorCode::InvalidType);
        assert_eq!(err.key, "photo");
    }

    #[test]
    fn migration_coerces_by_type() {
        let fields = vec![
            field(NewFieldConfig::new("watts", "Watts", FieldType::Number)),
            field(NewFieldConfig::new("ratio", "Ratio", FieldType::Range)),
            field(NewFieldConfig::new("dimmable", "Dimmable", FieldType::Boolean)),
            field(NewFieldConfig::new("colors", "Colors", FieldType::Multiselect)),
        ];
        let migrated = migrate_values(
            &fields,
            &values(&[
                ("watts", json!("100")),
                ("ratio", json!("0.75")),
                ("dimmable", json!("false")),
                ("colors", json!("warm")),
                ("notes", json!("keep me")),
            ]),
        );
        assert_eq!(migrated["watts"], json!(100));
        assert!(migrated["watts"].is_number());
        assert_eq!(migrated["ratio"], json!(0.75));
        assert_eq!(migrated["dimmable"], json!(false));
        assert_eq!(migrated["colors"], json!(["warm"]));
        assert_eq!(migrated["notes"], json!("keep me"));
    }

    #[test]
    fn unparseable_numbers_are_kept() {
        let fields = vec![field(NewFieldConfig::new("watts", "Watts", FieldType::Number))];
        let migrated = migrate_values(&fields, &values(&[("watts", json!("lots"))]));
        assert_eq!(migrated["watts"], json!("lots"));
    }

    #[test]
    fn display_name_comes_from_declared_source() {
        let mut mapping = CategoryFieldMapping {
            category_id: "lights".into(),
            category_type: CategoryType::Light,
            required_fields: vec![],
            optional_fields: vec![],
            name_source_field: Some("modelName".into()),
        };
        let form = values(&[("modelName", json!("  Aurora 12W ")), ("usedFor", json!("Kitchen"))]);
        assert_eq!(
            LegacyAdapter::derive_display_name(&mapping, &form).as_deref(),
            Some("Aurora 12W")
        );
        mapping.name_source_field = None;
        assert_eq!(LegacyAdapter::derive_display_name(&mapping, &form), None);
    }

    #[tokio::test]
    async fn category_mapping_infers_type_and_splits_required() {
        let store = Arc::new(MemoryFieldStore::new());
        for (key, required) in [("watts", true), ("voltage", false), ("finish", false)] {
            let mut new = NewFieldConfig::new(key, key, FieldType::Text).category("lamps");
            if required {
                new = new.required();
            }
            store.insert_field(new).await;
        }
        store
            .upsert_mapping(CategoryFieldMapping {
                category_id: "lamps".into(),
                category_type: CategoryType::VoltWatt,
                required_fields: vec!["voltage".into()],
                optional_fields: vec![],
                name_source_field: None,
            })
            .await;
        let data = Arc::new(FieldDataAccess::new(
            store,
            FieldEventBus::new(),
            &EngineConfig::default(),
        ));
        let adapter = LegacyAdapter::new(data);

        let legacy = adapter.get_legacy_category_field_mapping("lamps").await.unwrap();
        assert_eq!(legacy.category_type, CategoryType::VoltWatt);
        assert_eq!(legacy.required_fields, vec!["watts", "voltage"]);
        assert_eq!(legacy.optional_fields, vec!["finish"]);
        assert_eq!(legacy.fields.len(), 3);

        let result = adapter
            .validate_form_data(&values(&[("watts", json!("60"))]), "lamps")
            .await
            .unwrap();
        assert!(!result.is_valid);
        assert!(result.errors.contains_key("voltage"));
    }

    mod round_trip_properties {
        use super::*;
        use proptest::prelude::*;

        const KEY: &str = "[a-zA-Z][a-zA-Z0-9_]{0,20}";
        const LABEL: &str = "[A-Za-z][A-Za-z ]{0,29}";

        fn bounds() -> impl Strategy<Value = ValidationRules> {
            (
                proptest::option::of(-1.0e6..1.0e6f64),
                proptest::option::of(-1.0e6..1.0e6f64),
                proptest::option::of(0usize..500),
                proptest::option::of(0usize..500),
            )
                .prop_map(|(min, max, min_length, max_length)| ValidationRules {
                    min,
                    max,
                    min_length,
                    max_length,
                    ..ValidationRules::default()
                })
        }

        fn field_config() -> impl Strategy<Value = FieldConfig> {
            (
                proptest::sample::select(FieldType::ALL.to_vec()),
                KEY,
                LABEL,
                bounds(),
                any::<bool>(),
                any::<i32>(),
                any::<bool>(),
                proptest::collection::vec("[a-z]{1,10}", 0..3),
            )
                .prop_map(
                    |(field_type, key, label, rules, required, order, active, categories)| {
                        let mut new = NewFieldConfig::new(key, label, field_type)
                            .validation(rules)
                            .display_order(order);
                        for category in categories {
                            new = new.category(category);
                        }
                        if required {
                            new = new.required();
                        }
                        if !active {
                            new = new.inactive();
                        }
                        field(new)
                    },
                )
        }

        fn legacy_definition() -> impl Strategy<Value = LegacyFieldDefinition> {
            (
                proptest::sample::select(FieldType::ALL.to_vec()).prop_map(legacy_type_name),
                KEY,
                LABEL,
                bounds(),
                any::<bool>(),
                any::<i32>(),
                any::<bool>(),
            )
                .prop_map(|(type_name, name, label, rules, required, order, enabled)| {
                    LegacyFieldDefinition {
                        id: Some(format!("id-{name}")),
                        name,
                        label,
                        field_type: type_name.to_string(),
                        required,
                        min: rules.min,
                        max: rules.max,
                        min_length: rules.min_length,
                        max_length: rules.max_length,
                        pattern: None,
                        error_message: None,
                        options: Vec::new(),
                        categories: Vec::new(),
                        placeholder: None,
                        unit: None,
                        order,
                        enabled,
                        show_when: None,
                    }
                })
        }

        proptest! {
            #[test]
            fn config_survives_legacy_round_trip(original in field_config()) {
                let legacy = LegacyAdapter::to_legacy_field_definition(&original);
                let back = LegacyAdapter::from_legacy_field_definition(&legacy).unwrap();
                prop_assert_eq!(&back.id, &original.id);
                prop_assert_eq!(&back.key, &original.key);
                prop_assert_eq!(&back.label, &original.label);
                prop_assert_eq!(back.field_type, original.field_type);
                prop_assert_eq!(back.required, original.required);
                prop_assert_eq!(&back.validation, &original.validation);
                prop_assert_eq!(back.display_order, original.display_order);
                prop_assert_eq!(back.is_active, original.is_active);
                prop_assert_eq!(&back.categories, &original.categories);
            }

            #[test]
            fn legacy_definition_survives_config_round_trip(legacy in legacy_definition()) {
                let config = LegacyAdapter::from_legacy_field_definition(&legacy).unwrap();
                prop_assert_eq!(LegacyAdapter::to_legacy_field_definition(&config), legacy);
            }
        }
    }
}
