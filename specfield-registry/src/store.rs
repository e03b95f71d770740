//! The external document-store seam.
//!
//! Durable CRUD for field configs, groups and category mappings lives outside
//! this crate; [`FieldStore`] is the contract it must satisfy. [`MemoryFieldStore`]
//! is an in-process implementation for tests, fixtures and local tooling. It
//! counts calls per operation and can be told to fail one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;
use ulid::Ulid;

use crate::error::StoreError;
use crate::types::{CategoryFieldMapping, FieldConfig, FieldGroup, FieldPatch, NewFieldConfig};

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Operations required from the external document store.
#[async_trait]
pub trait FieldStore: Send + Sync {
    async fn fetch_all_fields(&self) -> StoreResult<Vec<FieldConfig>>;

    async fn fetch_fields_for_category(&self, category_id: &str) -> StoreResult<Vec<FieldConfig>>;

    async fn fetch_category_mappings(&self) -> StoreResult<Vec<CategoryFieldMapping>>;

    async fn fetch_field_groups(&self) -> StoreResult<Vec<FieldGroup>>;

    /// Persist a new field and return the stored record.
    async fn create_field(&self, config: NewFieldConfig) -> StoreResult<FieldConfig>;

    /// Apply a partial update, bump `version`, and return the stored record.
    async fn update_field(&self, id: &str, patch: FieldPatch) -> StoreResult<FieldConfig>;

    async fn delete_field(&self, id: &str) -> StoreResult<()>;
}

/// Names the store operations, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    FetchAllFields,
    FetchFieldsForCategory,
    FetchCategoryMappings,
    FetchFieldGroups,
    CreateField,
    UpdateField,
    DeleteField,
}

/// Seed data for a [`MemoryFieldStore`], usually parsed from a YAML fixture.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSeed {
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub groups: Vec<FieldGroup>,
    #[serde(default)]
    pub mappings: Vec<CategoryFieldMapping>,
}

#[derive(Default)]
struct StoreData {
    fields: Vec<FieldConfig>,
    groups: Vec<FieldGroup>,
    mappings: Vec<CategoryFieldMapping>,
}

/// In-memory [`FieldStore`].
#[derive(Default)]
pub struct MemoryFieldStore {
    data: RwLock<StoreData>,
    calls: DashMap<StoreOperation, AtomicUsize>,
    failing: DashMap<StoreOperation, String>,
}

impl MemoryFieldStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: StoreSeed) -> Self {
        Self {
            data: RwLock::new(StoreData {
                fields: seed.fields,
                groups: seed.groups,
                mappings: seed.mappings,
            }),
            ..Self::default()
        }
    }

    /// Build a store from a YAML document with `fields`, `groups` and `mappings`.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml_ng::Error> {
        let seed: StoreSeed = serde_yaml_ng::from_str(yaml)?;
        debug!(
            fields = seed.fields.len(),
            groups = seed.groups.len(),
            mappings = seed.mappings.len(),
            "seeded memory store"
        );
        Ok(Self::from_seed(seed))
    }

    /// Add a field directly, bypassing counters. Returns the stored record.
    pub async fn insert_field(&self, config: NewFieldConfig) -> FieldConfig {
        let field = config.into_config(Ulid::new().to_string(), Utc::now());
        self.data.write().await.fields.push(field.clone());
        field
    }

    pub async fn insert_group(&self, group: FieldGroup) {
        self.data.write().await.groups.push(group);
    }

    /// Insert or replace the mapping for `mapping.category_id`.
    pub async fn upsert_mapping(&self, mapping: CategoryFieldMapping) {
        let mut data = self.data.write().await;
        data.mappings.retain(|m| m.category_id != mapping.category_id);
        data.mappings.push(mapping);
    }

    /// How many times `op` has been invoked, including failed calls.
    pub fn call_count(&self, op: StoreOperation) -> usize {
        self.calls
            .get(&op)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Make every subsequent call to `op` fail with [`StoreError::Unavailable`].
    pub fn fail(&self, op: StoreOperation, message: impl Into<String>) {
        self.failing.insert(op, message.into());
    }

    pub fn recover(&self, op: StoreOperation) {
        self.failing.remove(&op);
    }

    fn begin(&self, op: StoreOperation) -> StoreResult<()> {
        self.calls
            .entry(op)
            .or_default()
            .fetch_add(1, Ordering::SeqCst);
        match self.failing.get(&op) {
            Some(message) => Err(StoreError::Unavailable {
                message: message.value().clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl FieldStore for MemoryFieldStore {
    async fn fetch_all_fields(&self) -> StoreResult<Vec<FieldConfig>> {
        self.begin(StoreOperation::FetchAllFields)?;
        Ok(self.data.read().await.fields.clone())
    }

    async fn fetch_fields_for_category(&self, category_id: &str) -> StoreResult<Vec<FieldConfig>> {
        self.begin(StoreOperation::FetchFieldsForCategory)?;
        Ok(self
            .data
            .read()
            .await
            .fields
            .iter()
            .filter(|f| f.belongs_to(category_id))
            .cloned()
            .collect())
    }

    async fn fetch_category_mappings(&self) -> StoreResult<Vec<CategoryFieldMapping>> {
        self.begin(StoreOperation::FetchCategoryMappings)?;
        Ok(self.data.read().await.mappings.clone())
    }

    async fn fetch_field_groups(&self) -> StoreResult<Vec<FieldGroup>> {
        self.begin(StoreOperation::FetchFieldGroups)?;
        Ok(self.data.read().await.groups.clone())
    }

    async fn create_field(&self, config: NewFieldConfig) -> StoreResult<FieldConfig> {
        self.begin(StoreOperation::CreateField)?;
        let mut data = self.data.write().await;
        if data.fields.iter().any(|f| f.key == config.key) {
            return Err(StoreError::Conflict {
                message: format!("field key '{}' already exists", config.key),
            });
        }
        let field = config.into_config(Ulid::new().to_string(), Utc::now());
        data.fields.push(field.clone());
        Ok(field)
    }

    async fn update_field(&self, id: &str, patch: FieldPatch) -> StoreResult<FieldConfig> {
        self.begin(StoreOperation::UpdateField)?;
        let mut data = self.data.write().await;
        if let Some(ref key) = patch.key {
            let taken: HashSet<&str> = data
                .fields
                .iter()
                .filter(|f| f.id != id)
                .map(|f| f.key.as_str())
                .collect();
            if taken.contains(key.as_str()) {
                return Err(StoreError::Conflict {
                    message: format!("field key '{key}' already exists"),
                });
            }
        }
        let field = data
            .fields
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        patch.apply_to(field);
        field.version += 1;
        field.updated_at = Utc::now();
        Ok(field.clone())
    }

    async fn delete_field(&self, id: &str) -> StoreResult<()> {
        self.begin(StoreOperation::DeleteField)?;
        let mut data = self.data.write().await;
        let before = data.fields.len();
        data.fields.retain(|f| f.id != id);
        if data.fields.len() == before {
            return Err(StoreError::NotFound { id: id.to_string() });
        }
        Ok(())
    }
}

/// A store wrapper that can park one call of a chosen operation after it has
/// read its result, until the test releases it.
#[cfg(test)]
pub(crate) struct GatedStore {
    inner: std::sync::Arc<MemoryFieldStore>,
    armed: std::sync::Mutex<Option<StoreOperation>>,
    pub(crate) parked: tokio::sync::Notify,
    pub(crate) release: tokio::sync::Notify,
}

#[cfg(test)]
impl GatedStore {
    pub(crate) fn new(inner: std::sync::Arc<MemoryFieldStore>) -> Self {
        Self {
            inner,
            armed: std::sync::Mutex::new(None),
            parked: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        }
    }

    /// Park the next call of `op`.
    pub(crate) fn arm(&self, op: StoreOperation) {
        *self.armed.lock().unwrap() = Some(op);
    }

    async fn gate(&self, op: StoreOperation) {
        let hit = {
            let mut armed = self.armed.lock().unwrap();
            if *armed == Some(op) {
                *armed = None;
                true
            } else {
                false
            }
        };
        if hit {
            self.parked.notify_one();
            self.release.notified().await;
        }
    }
}

#[cfg(test)]
#[async_trait]
impl FieldStore for GatedStore {
    async fn fetch_all_fields(&self) -> StoreResult<Vec<FieldConfig>> {
        let result = self.inner.fetch_all_fields().await;
        self.gate(StoreOperation::FetchAllFields).await;
        result
    }

    async fn fetch_fields_for_category(&self, category_id: &str) -> StoreResult<Vec<FieldConfig>> {
        let result = self.inner.fetch_fields_for_category(category_id).await;
        self.gate(StoreOperation::FetchFieldsForCategory).await;
        result
    }

    async fn fetch_category_mappings(&self) -> StoreResult<Vec<CategoryFieldMapping>> {
        let result = self.inner.fetch_category_mappings().await;
        self.gate(StoreOperation::FetchCategoryMappings).await;
        result
    }

    async fn fetch_field_groups(&self) -> StoreResult<Vec<FieldGroup>> {
        let result = self.inner.fetch_field_groups().await;
        self.gate(StoreOperation::FetchFieldGroups).await;
        result
    }

    async fn create_field(&self, config: NewFieldConfig) -> StoreResult<FieldConfig> {
        self.inner.create_field(config).await
    }

    async fn update_field(&self, id: &str, patch: FieldPatch) -> StoreResult<FieldConfig> {
        self.inner.update_field(id, patch).await
    }

    async fn delete_field(&self, id: &str) -> StoreResult<()> {
        self.inner.delete_field(id).await
    }
}
