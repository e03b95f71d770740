//! FieldRegistry: in-memory index of active field configurations.
//!
//! Built from a full load through [`FieldDataAccess`], then kept current by
//! explicit refreshes or by applying [`FieldEvent`]s from a live-update channel.
//! Provides lookup by field key, by id and by category.
//!
//! ```text
//! Uninitialized ──load──▶ Loading ──ok──▶ Ready
//!                            │
//!                            └──err──▶ Error ──refresh──▶ Loading
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::data_access::FieldDataAccess;
use crate::error::{ConfigurationErrorCode, FieldConfigurationError, Result};
use crate::events::{FieldEvent, FieldEventBus, FieldEventListener, SubscriberId, Subscription};
use crate::types::{CategoryFieldMapping, FieldConfig};

/// Pattern every field key must match.
pub const KEY_PATTERN: &str = "^[a-zA-Z][a-zA-Z0-9_]*$";

static KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(KEY_PATTERN).expect("KEY_PATTERN is a valid regex"));

/// Whether `key` is a well-formed field key.
pub fn is_valid_key(key: &str) -> bool {
    KEY_REGEX.is_match(key)
}

/// Lifecycle of the registry's indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryState {
    Uninitialized,
    Loading,
    Ready,
    /// The last load failed; indexes still hold the last known good data.
    Error(String),
}

impl fmt::Display for RegistryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryState::Uninitialized => f.write_str("uninitialized"),
            RegistryState::Loading => f.write_str("loading"),
            RegistryState::Ready => f.write_str("ready"),
            RegistryState::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// Outcome of a full load.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub registered: usize,
    /// Fields rejected at registration; the rest of the batch was kept.
    pub rejected: Vec<FieldConfigurationError>,
    /// Tolerated invariant violations.
    pub warnings: Vec<String>,
}

/// In-memory index of active field configurations and category mappings.
pub struct FieldRegistry {
    config: EngineConfig,
    state: RegistryState,
    by_key: HashMap<String, FieldConfig>,
    key_by_id: HashMap<String, String>,
    by_category: HashMap<String, Vec<String>>,
    mappings: HashMap<String, CategoryFieldMapping>,
    events: FieldEventBus,
}

impl FieldRegistry {
    pub fn new(events: FieldEventBus, config: EngineConfig) -> Self {
        Self {
            config,
            state: RegistryState::Uninitialized,
            by_key: HashMap::new(),
            key_by_id: HashMap::new(),
            by_category: HashMap::new(),
            mappings: HashMap::new(),
            events,
        }
    }

    pub fn state(&self) -> &RegistryState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == RegistryState::Ready
    }

    // --- Loading ---

    /// Replace the indexes with a full load from the store.
    ///
    /// Always round-trips to the store through [`FieldDataAccess::reload`],
    /// never serving the data-access cache. On failure the state becomes
    /// [`RegistryState::Error`] and the previous indexes are kept.
    ///
    /// Conditional depth is checked once the whole batch is indexed, so the
    /// outcome does not depend on the order the store returns fields in.
    pub async fn load(&mut self, data: &FieldDataAccess) -> Result<LoadReport> {
        self.state = RegistryState::Loading;
        debug!("loading field registry");

        let (fields, mappings) = match data.reload().await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "field registry load failed, keeping last known state");
                self.state = RegistryState::Error(e.to_string());
                return Err(e);
            }
        };

        self.by_key.clear();
        self.key_by_id.clear();
        self.by_category.clear();
        self.mappings = mappings
            .into_iter()
            .map(|m| (m.category_id.clone(), m))
            .collect();

        let mut report = LoadReport::default();
        for field in fields.into_iter().filter(|f| f.is_active) {
            match self.check_shape(&field) {
                Ok(()) => self.index(field),
                Err(e) => report.rejected.push(e),
            }
        }
        let mut too_deep: Vec<FieldConfigurationError> = self
            .by_key
            .values()
            .filter_map(|field| self.check_depth(field).err())
            .collect();
        too_deep.sort_by(|a, b| a.key.cmp(&b.key));
        for e in &too_deep {
            self.remove_by_key(&e.key);
        }
        report.rejected.extend(too_deep);
        for e in &report.rejected {
            warn!(key = %e.key, code = %e.code, "rejected field configuration");
        }
        report.registered = self.by_key.len();
        report.warnings = self.collect_warnings();
        for warning in &report.warnings {
            warn!("{warning}");
        }

        self.state = RegistryState::Ready;
        info!(
            registered = report.registered,
            rejected = report.rejected.len(),
            categories = self.by_category.len(),
            "field registry ready"
        );
        Ok(report)
    }

    /// Manual refresh: re-enters `Loading` from any state and reads the store.
    pub async fn refresh(&mut self, data: &FieldDataAccess) -> Result<LoadReport> {
        self.load(data).await
    }

    /// Reload only the category mappings.
    pub async fn refresh_mappings(&mut self, data: &FieldDataAccess) -> Result<()> {
        let mappings = data.get_category_mappings().await?;
        self.mappings = mappings
            .into_iter()
            .map(|m| (m.category_id.clone(), m))
            .collect();
        Ok(())
    }

    // --- Registration ---

    /// Validate and index a field, then publish `field_added`.
    ///
    /// A rejected field leaves the registry untouched.
    pub fn register_field(
        &mut self,
        field: FieldConfig,
    ) -> std::result::Result<(), FieldConfigurationError> {
        let event = FieldEvent::FieldAdded {
            field: field.clone(),
        };
        self.insert_checked(field)?;
        self.events.publish(&event);
        Ok(())
    }

    /// Remove a field by key and publish `field_removed`.
    pub fn remove_field(&mut self, key: &str) -> Option<FieldConfig> {
        let removed = self.remove_by_key(key)?;
        self.events.publish(&FieldEvent::FieldRemoved {
            field_id: removed.id.clone(),
            key: removed.key.clone(),
            categories: removed.categories.clone(),
        });
        Some(removed)
    }

    /// Patch the indexes for a single-field change without a full reload.
    ///
    /// Does not republish. Returns whether the indexes changed; mapping
    /// changes need [`FieldRegistry::refresh_mappings`].
    pub fn apply_event(&mut self, event: &FieldEvent) -> bool {
        match event {
            FieldEvent::FieldAdded { field }
            | FieldEvent::FieldActivated { field }
            | FieldEvent::FieldUpdated { field, .. } => {
                self.remove_by_id(&field.id);
                if !field.is_active {
                    return true;
                }
                match self.insert_checked(field.clone()) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(key = %e.key, code = %e.code, "ignoring live update");
                        false
                    }
                }
            }
            FieldEvent::FieldDeactivated { field } => self.remove_by_id(&field.id).is_some(),
            FieldEvent::FieldRemoved { field_id, .. } => self.remove_by_id(field_id).is_some(),
            FieldEvent::CategoryMappingChanged { category_id } => {
                debug!(%category_id, "category mapping changed, refresh required");
                false
            }
        }
    }

    // --- Lookup ---

    pub fn get_field(&self, key: &str) -> Option<&FieldConfig> {
        self.by_key.get(key)
    }

    pub fn get_field_by_id(&self, id: &str) -> Option<&FieldConfig> {
        self.key_by_id.get(id).and_then(|key| self.by_key.get(key))
    }

    /// Fields of a category, sorted by display order.
    pub fn get_fields_for_category(&self, category_id: &str) -> Vec<&FieldConfig> {
        let mut fields: Vec<&FieldConfig> = self
            .by_category
            .get(category_id)
            .map(|keys| keys.iter().filter_map(|k| self.by_key.get(k)).collect())
            .unwrap_or_default();
        fields.sort_by(|a, b| {
            a.display_order
                .cmp(&b.display_order)
                .then_with(|| a.key.cmp(&b.key))
        });
        fields
    }

    /// Fields a category requires: flagged required, or listed in its mapping.
    pub fn get_required_fields(&self, category_id: &str) -> Vec<&FieldConfig> {
        let mapping = self.mappings.get(category_id);
        self.get_fields_for_category(category_id)
            .into_iter()
            .filter(|f| f.required || mapping.is_some_and(|m| m.requires(&f.key)))
            .collect()
    }

    /// Every indexed field, sorted by display order.
    pub fn get_all_fields(&self) -> Vec<&FieldConfig> {
        let mut fields: Vec<&FieldConfig> = self.by_key.values().collect();
        fields.sort_by(|a, b| {
            a.display_order
                .cmp(&b.display_order)
                .then_with(|| a.key.cmp(&b.key))
        });
        fields
    }

    pub fn get_category_mapping(&self, category_id: &str) -> Option<&CategoryFieldMapping> {
        self.mappings.get(category_id)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    // --- Subscriptions ---

    pub fn subscribe(&self, listener: impl FieldEventListener + 'static) -> Subscription {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.events.unsubscribe(id)
    }

    // --- Internal ---

    fn insert_checked(
        &mut self,
        field: FieldConfig,
    ) -> std::result::Result<(), FieldConfigurationError> {
        self.check_shape(&field)?;
        self.check_depth(&field)?;
        self.index(field);
        Ok(())
    }

    fn index(&mut self, field: FieldConfig) {
        for category_id in &field.categories {
            self.by_category
                .entry(category_id.clone())
                .or_default()
                .push(field.key.clone());
        }
        self.key_by_id.insert(field.id.clone(), field.key.clone());
        self.by_key.insert(field.key.clone(), field);
    }

    fn remove_by_id(&mut self, id: &str) -> Option<FieldConfig> {
        let key = self.key_by_id.get(id)?.clone();
        self.remove_by_key(&key)
    }

    fn remove_by_key(&mut self, key: &str) -> Option<FieldConfig> {
        let field = self.by_key.remove(key)?;
        self.key_by_id.remove(&field.id);
        for category_id in &field.categories {
            if let Some(keys) = self.by_category.get_mut(category_id) {
                keys.retain(|k| k != key);
                if keys.is_empty() {
                    self.by_category.remove(category_id);
                }
            }
        }
        Some(field)
    }

    /// Checks that need only the field itself and the set of taken keys.
    fn check_shape(&self, field: &FieldConfig) -> std::result::Result<(), FieldConfigurationError> {
        let reject = |code, message: String| {
            Err(FieldConfigurationError::new(field.key.clone(), code, message))
        };

        if self.config.enforce_key_pattern && !is_valid_key(&field.key) {
            return reject(
                ConfigurationErrorCode::InvalidKey,
                format!("key must match {KEY_PATTERN}"),
            );
        }
        if self.by_key.contains_key(&field.key) {
            return reject(
                ConfigurationErrorCode::DuplicateKey,
                "key is already registered".to_string(),
            );
        }
        if field.field_type.has_options() && field.options.is_empty() {
            return reject(
                ConfigurationErrorCode::MissingOptions,
                format!("{} field needs an options list", field.field_type),
            );
        }
        let rules = &field.validation;
        if let (Some(min), Some(max)) = (rules.min, rules.max) {
            if min > max {
                return reject(
                    ConfigurationErrorCode::InvalidBounds,
                    format!("min {min} exceeds max {max}"),
                );
            }
        }
        if let (Some(min), Some(max)) = (rules.min_length, rules.max_length) {
            if min > max {
                return reject(
                    ConfigurationErrorCode::InvalidBounds,
                    format!("minLength {min} exceeds maxLength {max}"),
                );
            }
        }
        Ok(())
    }

    fn check_depth(&self, field: &FieldConfig) -> std::result::Result<(), FieldConfigurationError> {
        if self.conditional_depth(field) > self.config.max_conditional_depth {
            return Err(FieldConfigurationError::new(
                field.key.clone(),
                ConfigurationErrorCode::ConditionalDepthExceeded,
                format!(
                    "conditional chain exceeds depth {}",
                    self.config.max_conditional_depth
                ),
            ));
        }
        Ok(())
    }

    /// Length of the longest `dependsOn` chain starting at `field`, walked
    /// breadth-first and cut off one step past the configured maximum.
    /// Only indexed fields (and `field` itself) are followed.
    fn conditional_depth(&self, field: &FieldConfig) -> usize {
        let limit = self.config.max_conditional_depth;
        let mut depth = 0;
        let mut frontier: Vec<&str> = field
            .conditional
            .iter()
            .map(|r| r.depends_on.as_str())
            .collect();
        while !frontier.is_empty() && depth <= limit {
            depth += 1;
            let mut next = Vec::new();
            for key in frontier {
                if let Some(dep) = self.resolve_dependency(field, key) {
                    next.extend(dep.conditional.iter().map(|r| r.depends_on.as_str()));
                }
            }
            frontier = next;
        }
        depth
    }

    /// The field being registered is not indexed yet, so it resolves itself.
    fn resolve_dependency<'a>(
        &'a self,
        field: &'a FieldConfig,
        key: &str,
    ) -> Option<&'a FieldConfig> {
        if key == field.key {
            Some(field)
        } else {
            self.by_key.get(key)
        }
    }

    fn collect_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for field in self.by_key.values() {
            for rule in &field.conditional {
                if !self.by_key.contains_key(&rule.depends_on) {
                    warnings.push(format!(
                        "field '{}' has a conditional rule on unknown field '{}'",
                        field.key, rule.depends_on
                    ));
                }
            }
        }
        for mapping in self.mappings.values() {
            let registered = self.by_category.get(&mapping.category_id);
            for key in &mapping.required_fields {
                if !registered.is_some_and(|keys| keys.contains(key)) {
                    warnings.push(format!(
                        "category '{}' requires field '{}' which is not registered for it",
                        mapping.category_id, key
                    ));
                }
            }
        }
        warnings.sort();
        warnings
    }
}
