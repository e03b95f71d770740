//! Form generation engine
//!
//! Assembles the active fields of a category into a renderable [`FormSchema`]
//! and drives [`FormState`] transitions. State transitions are pure: each
//! returns a new state and leaves the input untouched.
//!
//! Generated schemas are cached by a signature of the generation options.
//! Requests carrying field overrides are never cached. Cached schemas for a
//! category are dropped whenever a [`FieldEvent`] touches that category. A
//! schema whose fetches overlapped such an event is returned but not cached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cache::{CacheStats, FieldCache};
use crate::config::EngineConfig;
use crate::data_access::FieldDataAccess;
use crate::error::{FieldsError, Result};
use crate::events::{FieldEvent, FieldEventListener, Subscription};
use crate::types::{
    CategoryFieldMapping, ConditionalRule, FieldConfig, FieldGroup, FieldPatch, FieldType,
    ValidationRules,
};
use crate::validation::{FormValues, ValidationContext, ValidationEngine};

const SCHEMA_PREFIX: &str = "schema:";

/// What to generate a form schema for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormGenerationOptions {
    pub category_id: String,
    #[serde(default)]
    pub include_optional_fields: bool,
    #[serde(default)]
    pub exclude_fields: Vec<String>,
    /// Per-field property overrides, keyed by field key.
    #[serde(default)]
    pub field_overrides: HashMap<String, FieldPatch>,
    /// Explicit field order. Unlisted fields follow in display order.
    #[serde(default)]
    pub custom_order: Option<Vec<String>>,
}

impl FormGenerationOptions {
    pub fn new(category_id: impl Into<String>) -> Self {
        Self {
            category_id: category_id.into(),
            ..Self::default()
        }
    }

    pub fn include_optional(mut self) -> Self {
        self.include_optional_fields = true;
        self
    }

    pub fn exclude(mut self, key: impl Into<String>) -> Self {
        self.exclude_fields.push(key.into());
        self
    }

    pub fn override_field(mut self, key: impl Into<String>, patch: FieldPatch) -> Self {
        self.field_overrides.insert(key.into(), patch);
        self
    }

    pub fn order(mut self, keys: Vec<String>) -> Self {
        self.custom_order = Some(keys);
        self
    }

    /// Canonical cache key, or `None` when overrides make the request uncacheable.
    fn signature(&self) -> Option<String> {
        if !self.field_overrides.is_empty() {
            return None;
        }
        let mut excluded = self.exclude_fields.clone();
        excluded.sort();
        excluded.dedup();
        let order = self
            .custom_order
            .as_ref()
            .map(|keys| keys.join(","))
            .unwrap_or_default();
        Some(format!(
            "{}:optional={}:exclude={}:order={}",
            schema_scope(&self.category_id),
            self.include_optional_fields,
            excluded.join(","),
            order
        ))
    }
}

/// Cache-key prefix covering every schema of one category.
fn schema_scope(category_id: &str) -> String {
    format!("{SCHEMA_PREFIX}{category_id}:")
}

/// A renderable form description for one category.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormSchema {
    pub category_id: String,
    pub fields: Vec<FieldConfig>,
    pub groups: Vec<FieldGroup>,
    pub validation_rules: HashMap<String, ValidationRules>,
    pub conditional_rules: HashMap<String, Vec<ConditionalRule>>,
}

/// The values and validation status of a form being edited.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FormState {
    pub values: FormValues,
    pub errors: HashMap<String, Vec<String>>,
    pub warnings: HashMap<String, Vec<String>>,
    pub touched: HashMap<String, bool>,
    pub is_valid: bool,
    pub is_submitting: bool,
    pub is_dirty: bool,
}

impl FormState {
    pub fn is_touched(&self, key: &str) -> bool {
        self.touched.get(key).copied().unwrap_or(false)
    }

    pub fn errors_for(&self, key: &str) -> &[String] {
        self.errors.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Drops cached schemas for every category an event touches.
struct SchemaInvalidator {
    schemas: Arc<FieldCache<FormSchema>>,
    epoch: Arc<AtomicU64>,
}

impl FieldEventListener for SchemaInvalidator {
    fn on_event(&self, event: &FieldEvent) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for category_id in event.affected_categories() {
            let dropped = self.schemas.delete_prefix(&schema_scope(&category_id));
            if dropped > 0 {
                debug!(%category_id, dropped, kind = event.kind(), "invalidated form schemas");
            }
        }
    }
}

/// Builds form schemas and manages form state.
pub struct FormEngine {
    data: Arc<FieldDataAccess>,
    validator: ValidationEngine,
    schemas: Arc<FieldCache<FormSchema>>,
    /// Bumped whenever cached schemas are dropped.
    epoch: Arc<AtomicU64>,
    subscription: Option<Subscription>,
}

impl FormEngine {
    pub fn new(data: Arc<FieldDataAccess>, config: &EngineConfig) -> Self {
        let schemas = Arc::new(FieldCache::new(config.schema_cache_ttl()));
        let epoch = Arc::new(AtomicU64::new(0));
        let subscription = data.subscribe(SchemaInvalidator {
            schemas: Arc::clone(&schemas),
            epoch: Arc::clone(&epoch),
        });
        Self {
            data,
            validator: ValidationEngine::new(),
            schemas,
            epoch,
            subscription: Some(subscription),
        }
    }

    pub fn validator(&self) -> &ValidationEngine {
        &self.validator
    }

    /// Subscribe to field configuration changes, e.g. to re-render open forms.
    pub fn subscribe(&self, listener: impl FieldEventListener + 'static) -> Subscription {
        self.data.subscribe(listener)
    }

    pub fn schema_cache_stats(&self) -> CacheStats {
        self.schemas.stats()
    }

    pub fn clear_schema_cache(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.schemas.clear();
    }

    /// Assemble the schema for `options.category_id`.
    ///
    /// A failed groups fetch degrades to a schema without groups, which is
    /// returned but not cached.
    #[tracing::instrument(skip(self, options), fields(category_id = %options.category_id))]
    pub async fn generate_form_schema(
        &self,
        options: &FormGenerationOptions,
    ) -> Result<FormSchema> {
        let signature = options.signature();
        let epoch = self.epoch.load(Ordering::SeqCst);
        if let Some(ref signature) = signature {
            if let Some(schema) = self.schemas.get(signature) {
                debug!("form schema cache hit");
                return Ok(schema);
            }
        }

        let generation_error = |e: FieldsError| FieldsError::FormGeneration {
            category_id: options.category_id.clone(),
            message: e.to_string(),
        };
        let fields = self
            .data
            .get_fields_for_category(&options.category_id)
            .await
            .map_err(generation_error)?;
        let mapping = self
            .data
            .get_category_mapping(&options.category_id)
            .await
            .map_err(generation_error)?;
        let (groups, complete) = match self.data.get_field_groups().await {
            Ok(groups) => (groups, true),
            Err(e) => {
                warn!(error = %e, "field groups unavailable, generating schema without groups");
                (Vec::new(), false)
            }
        };

        let schema = build_schema(options, fields, mapping.as_ref(), groups);
        debug!(
            fields = schema.fields.len(),
            groups = schema.groups.len(),
            "generated form schema"
        );
        if let (Some(signature), true) = (signature, complete) {
            self.cache_schema(&signature, &schema, epoch);
        }
        Ok(schema)
    }

    fn cache_schema(&self, signature: &str, schema: &FormSchema, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("fields changed while generating, schema not cached");
            return;
        }
        self.schemas.set(signature, schema.clone());
        if self.epoch.load(Ordering::SeqCst) != epoch {
            self.schemas.delete(signature);
        }
    }

    /// Seed a form with the given values, falling back to type defaults.
    pub fn create_initial_form_state(
        &self,
        fields: &[FieldConfig],
        initial_values: &FormValues,
    ) -> FormState {
        let values = fields
            .iter()
            .map(|field| {
                let value = initial_values
                    .get(&field.key)
                    .cloned()
                    .unwrap_or_else(|| default_value(field));
                (field.key.clone(), value)
            })
            .collect();
        let touched = fields.iter().map(|f| (f.key.clone(), false)).collect();
        FormState {
            values,
            touched,
            is_valid: true,
            ..FormState::default()
        }
    }

    /// Record a new value for `key` and re-validate that field alone.
    pub fn handle_field_change(
        &self,
        state: &FormState,
        key: &str,
        value: Value,
        fields: &[FieldConfig],
    ) -> FormState {
        let mut next = state.clone();
        next.values.insert(key.to_string(), value);
        next.touched.insert(key.to_string(), true);
        next.is_dirty = true;

        match fields.iter().find(|f| f.key == key) {
            Some(field) => {
                let context = ValidationContext::new(&next.values).with_fields(fields);
                let current = next.values.get(key).unwrap_or(&Value::Null);
                let result = self.validator.validate_field(field, current, &context);
                set_messages(&mut next.errors, key, result.errors);
                set_messages(&mut next.warnings, key, result.warnings);
            }
            None => debug!(%key, "change for a field outside the form"),
        }

        next.is_valid = next.errors.values().all(Vec::is_empty);
        next
    }

    /// Validate every field, e.g. on submit. Marks all fields touched.
    pub fn validate_form_state(
        &self,
        state: &FormState,
        fields: &[FieldConfig],
        category_id: Option<&str>,
    ) -> FormState {
        let result = self.validator.validate_form(fields, &state.values, category_id);
        let mut next = state.clone();
        for field in fields {
            next.touched.insert(field.key.clone(), true);
        }
        next.errors = result.errors;
        next.warnings = result.warnings;
        next.is_valid = result.is_valid;
        next
    }

    pub fn set_submitting(&self, state: &FormState, is_submitting: bool) -> FormState {
        FormState {
            is_submitting,
            ..state.clone()
        }
    }
}

impl Drop for FormEngine {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

fn set_messages(map: &mut HashMap<String, Vec<String>>, key: &str, messages: Vec<String>) {
    if messages.is_empty() {
        map.remove(key);
    } else {
        map.insert(key.to_string(), messages);
    }
}

/// Default value for a field with no initial value.
pub fn default_value(field: &FieldConfig) -> Value {
    match field.field_type {
        FieldType::Boolean => Value::Bool(false),
        FieldType::Number | FieldType::Range => match field.validation.min {
            Some(min) => json!(min),
            None => json!(0),
        },
        FieldType::Multiselect => json!([]),
        FieldType::Select => field
            .option_values()
            .next()
            .map(|v| Value::String(v.to_string()))
            .unwrap_or_else(|| Value::String(String::new())),
        _ => Value::String(String::new()),
    }
}

fn build_schema(
    options: &FormGenerationOptions,
    fields: Vec<FieldConfig>,
    mapping: Option<&CategoryFieldMapping>,
    mut groups: Vec<FieldGroup>,
) -> FormSchema {
    let mut fields: Vec<FieldConfig> = fields
        .into_iter()
        .filter(|f| !options.exclude_fields.contains(&f.key))
        .map(|mut f| {
            if mapping.is_some_and(|m| m.requires(&f.key)) {
                f.required = true;
            }
            f
        })
        .filter(|f| options.include_optional_fields || f.required)
        .collect();

    for field in &mut fields {
        if let Some(patch) = options.field_overrides.get(&field.key) {
            patch.apply_to(field);
        }
    }

    match options.custom_order {
        Some(ref order) => fields.sort_by_key(|f| {
            let position = order.iter().position(|k| *k == f.key).unwrap_or(usize::MAX);
            (position, f.display_order)
        }),
        None => fields.sort_by_key(|f| f.display_order),
    }

    groups.retain(|g| fields.iter().any(|f| f.group.as_deref() == Some(g.id.as_str())));

    let validation_rules = fields
        .iter()
        .filter(|f| !f.validation.is_empty())
        .map(|f| (f.key.clone(), f.validation.clone()))
        .collect();
    let conditional_rules = fields
        .iter()
        .filter(|f| !f.conditional.is_empty())
        .map(|f| (f.key.clone(), f.conditional.clone()))
        .collect();

    FormSchema {
        category_id: options.category_id.clone(),
        fields,
        groups,
        validation_rules,
        conditional_rules,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FieldEventBus;
    use crate::store::{GatedStore, MemoryFieldStore, StoreOperation};
    use crate::types::{CategoryType, Condition, ConditionalAction, NewFieldConfig};

    fn group(id: &str, order: i32) -> FieldGroup {
        FieldGroup {
            id: id.to_string(),
            name: id.to_string(),
            label: id.to_uppercase(),
            display_order: order,
            collapsible: false,
            default_expanded: true,
        }
    }

    async fn setup() -> (Arc<MemoryFieldStore>, Arc<FieldDataAccess>, FormEngine) {
        let store = Arc::new(MemoryFieldStore::new());
        store
            .insert_field(
                NewFieldConfig::new("voltage", "Voltage", FieldType::Text)
                    .category("switches")
                    .group("electrical")
                    .display_order(2),
            )
            .await;
        store
            .insert_field(
                NewFieldConfig::new("amperage", "Amperage", FieldType::Text)
                    .category("switches")
                    .group("electrical")
                    .display_order(1),
            )
            .await;
        store
            .insert_field(
                NewFieldConfig::new("color", "Color", FieldType::Select)
                    .category("switches")
                    .group("appearance")
                    .option("white", "White")
                    .option("black", "Black")
                    .display_order(3),
            )
            .await;
        store
            .insert_field(
                NewFieldConfig::new("homeVisitFee", "Home visit fee", FieldType::Number)
                    .category("switches")
                    .display_order(4)
                    .conditional(ConditionalRule::new(
                        "locationType",
                        Condition::Equals,
                        "home",
                        ConditionalAction::Require,
                    )),
            )
            .await;
        store
            .upsert_mapping(CategoryFieldMapping {
                category_id: "switches".into(),
                category_type: CategoryType::Ampere,
                required_fields: vec!["amperage".into(), "voltage".into()],
                optional_fields: vec!["color".into()],
                name_source_field: None,
            })
            .await;
        store.insert_group(group("appearance", 2)).await;
        store.insert_group(group("electrical", 1)).await;
        store.insert_group(group("packaging", 3)).await;

        let config = EngineConfig::default();
        let data = Arc::new(FieldDataAccess::new(
            store.clone(),
            FieldEventBus::new(),
            &config,
        ));
        let engine = FormEngine::new(Arc::clone(&data), &config);
        (store, data, engine)
    }

    fn keys(schema: &FormSchema) -> Vec<&str> {
        schema.fields.iter().map(|f| f.key.as_str()).collect()
    }

    #[tokio::test]
    async fn required_fields_only_by_default() {
        let (_store, _data, engine) = setup().await;
        let schema = engine
            .generate_form_schema(&FormGenerationOptions::new("switches"))
            .await
            .unwrap();
        assert_eq!(keys(&schema), vec!["amperage", "voltage"]);
        assert!(schema.fields.iter().all(|f| f.required));
        let groups: Vec<_> = schema.groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(groups, vec!["electrical"]);
    }

    #[tokio::test]
    async fn optional_fields_exclusions_and_rule_maps() {
        let (_store, _data, engine) = setup().await;
        let schema = engine
            .generate_form_schema(
                &FormGenerationOptions::new("switches")
                    .include_optional()
                    .exclude("voltage"),
            )
            .await
            .unwrap();
        assert_eq!(keys(&schema), vec!["amperage", "color", "homeVisitFee"]);
        assert_eq!(schema.groups.len(), 2);
        assert!(schema.conditional_rules.contains_key("homeVisitFee"));
        assert!(!schema.validation_rules.contains_key("amperage"));
    }

    #[tokio::test]
    async fn custom_order_then_display_order() {
        let (_store, _data, engine) = setup().await;
        let schema = engine
            .generate_form_schema(
                &FormGenerationOptions::new("switches")
                    .include_optional()
                    .order(vec!["color".into(), "voltage".into()]),
            )
            .await
            .unwrap();
        assert_eq!(keys(&schema), vec!["color", "voltage", "amperage", "homeVisitFee"]);
    }

    #[tokio::test]
    async fn overrides_apply_and_are_not_cached() {
        let (_store, _data, engine) = setup().await;
        let options = FormGenerationOptions::new("switches")
            .override_field("amperage", FieldPatch::label("Rated current"));
        let schema = engine.generate_form_schema(&options).await.unwrap();
        assert_eq!(schema.fields[0].label, "Rated current");
        assert_eq!(engine.schema_cache_stats().cache_size, 0);
    }

    #[tokio::test]
    async fn schema_generated_across_an_update_is_not_cached() {
        let (store, _data, _engine) = setup().await;
        let gated = Arc::new(GatedStore::new(store));
        let config = EngineConfig::default();
        let data = Arc::new(FieldDataAccess::new(
            gated.clone(),
            FieldEventBus::new(),
            &config,
        ));
        let engine = FormEngine::new(Arc::clone(&data), &config);
        let voltage = data
            .get_all_fields()
            .await
            .unwrap()
            .into_iter()
            .find(|f| f.key == "voltage")
            .unwrap();
        let options = FormGenerationOptions::new("switches");

        gated.arm(StoreOperation::FetchFieldGroups);
        let (raced, ()) = tokio::join!(engine.generate_form_schema(&options), async {
            gated.parked.notified().await;
            data.update_field(&voltage.id, FieldPatch::label("New Label"))
                .await
                .unwrap();
            gated.release.notify_one();
        });
        assert_eq!(raced.unwrap().fields[1].label, "Voltage");
        assert_eq!(engine.schema_cache_stats().cache_size, 0);

        let fresh = engine.generate_form_schema(&options).await.unwrap();
        assert_eq!(fresh.fields[1].label, "New Label");
    }

    #[tokio::test]
    async fn schemas_are_cached_and_invalidated_by_field_events() {
        let (_store, data, engine) = setup().await;
        let options = FormGenerationOptions::new("switches");
        let first = engine.generate_form_schema(&options).await.unwrap();
        engine.generate_form_schema(&options).await.unwrap();
        assert_eq!(engine.schema_cache_stats().hit_count, 1);

        let amperage = first.fields[0].id.clone();
        data.update_field(&amperage, FieldPatch::label("Current"))
            .await
            .unwrap();
        assert_eq!(engine.schema_cache_stats().cache_size, 0);

        let refreshed = engine.generate_form_schema(&options).await.unwrap();
        assert_eq!(refreshed.fields[0].label, "Current");
    }

    #[tokio::test]
    async fn groups_failure_degrades_without_caching() {
        let (store, _data, engine) = setup().await;
        store.fail(StoreOperation::FetchFieldGroups, "timeout");
        let schema = engine
            .generate_form_schema(&FormGenerationOptions::new("switches"))
            .await
            .unwrap();
        assert_eq!(schema.fields.len(), 2);
        assert!(schema.groups.is_empty());
        assert_eq!(engine.schema_cache_stats().cache_size, 0);
    }

    #[tokio::test]
    async fn fields_failure_is_form_generation_error() {
        let (store, _data, engine) = setup().await;
        store.fail(StoreOperation::FetchFieldsForCategory, "offline");
        let err = engine
            .generate_form_schema(&FormGenerationOptions::new("switches"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FieldsError::FormGeneration { ref category_id, .. } if category_id == "switches"
        ));
    }

    #[tokio::test]
    async fn initial_state_uses_type_defaults() {
        let (_store, _data, engine) = setup().await;
        let fields = vec![
            NewFieldConfig::new("dimmable", "Dimmable", FieldType::Boolean)
                .into_config("1", chrono::Utc::now()),
            NewFieldConfig::new("watts", "Watts", FieldType::Number)
                .validation(ValidationRules {
                    min: Some(5.0),
                    ..ValidationRules::default()
                })
                .into_config("2", chrono::Utc::now()),
            NewFieldConfig::new("colors", "Colors", FieldType::Multiselect)
                .into_config("3", chrono::Utc::now()),
            NewFieldConfig::new("finish", "Finish", FieldType::Select)
                .option("matte", "Matte")
                .into_config("4", chrono::Utc::now()),
            NewFieldConfig::new("notes", "Notes", FieldType::Textarea)
                .into_config("5", chrono::Utc::now()),
        ];
        let initial: FormValues = [("notes".to_string(), json!("fragile"))].into_iter().collect();
        let state = engine.create_initial_form_state(&fields, &initial);

        assert_eq!(state.values["dimmable"], json!(false));
        assert_eq!(state.values["watts"], json!(5.0));
        assert_eq!(state.values["colors"], json!([]));
        assert_eq!(state.values["finish"], json!("matte"));
        assert_eq!(state.values["notes"], json!("fragile"));
        assert!(state.is_valid);
        assert!(!state.is_dirty);
        assert!(!state.is_touched("notes"));
    }

    #[tokio::test]
    async fn field_change_revalidates_only_that_field() {
        let (_store, _data, engine) = setup().await;
        let schema = engine
            .generate_form_schema(&FormGenerationOptions::new("switches"))
            .await
            .unwrap();
        let state = engine.create_initial_form_state(&schema.fields, &FormValues::new());

        let state = engine.handle_field_change(&state, "amperage", json!(""), &schema.fields);
        assert!(!state.is_valid);
        assert!(state.is_dirty);
        assert!(state.is_touched("amperage"));
        assert_eq!(state.errors_for("amperage").len(), 1);
        assert!(state.errors_for("voltage").is_empty());

        let state = engine.handle_field_change(&state, "amperage", json!("16A"), &schema.fields);
        assert!(state.is_valid);
        assert!(state.errors.is_empty());
    }

    #[tokio::test]
    async fn submit_validates_everything() {
        let (_store, _data, engine) = setup().await;
        let schema = engine
            .generate_form_schema(&FormGenerationOptions::new("switches"))
            .await
            .unwrap();
        let state = engine.create_initial_form_state(&schema.fields, &FormValues::new());
        let state = engine.set_submitting(&state, true);
        let state = engine.validate_form_state(&state, &schema.fields, Some("switches"));

        assert!(state.is_submitting);
        assert!(!state.is_valid);
        assert_eq!(state.errors.len(), 2);
        assert!(state.is_touched("voltage"));
    }

    #[tokio::test]
    async fn dropping_engine_unsubscribes() {
        let (_store, data, engine) = setup().await;
        assert_eq!(data.events().subscriber_count(), 1);
        drop(engine);
        assert_eq!(data.events().subscriber_count(), 0);
    }
}
