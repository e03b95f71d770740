//! Data access layer: cache, external fetch and mutation lifecycle.
//!
//! Reads go through a [`FieldCache`]; a miss round-trips to the [`FieldStore`]
//! and caches only successful results, so a failing fetch never evicts
//! unrelated data. Writes always go to the store first, then the affected
//! cache entries are invalidated and a [`FieldEvent`] is published.
//!
//! Every invalidation bumps an epoch. A fetch that started before the bump
//! returns its result to the caller but does not cache it, so a read racing a
//! completed write cannot re-cache the pre-write snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::cache::{CacheStats, FieldCache};
use crate::config::EngineConfig;
use crate::error::{FieldsError, Result};
use crate::events::{FieldEvent, FieldEventBus, FieldEventListener, Subscription};
use crate::store::FieldStore;
use crate::types::{CategoryFieldMapping, FieldConfig, FieldGroup, FieldPatch, NewFieldConfig};

mod keys {
    pub const ALL_FIELDS: &str = "fields:all";
    pub const CATEGORY_PREFIX: &str = "fields:category:";
    pub const FIELD_PREFIX: &str = "field:";
    pub const MAPPINGS: &str = "mappings";
    pub const GROUPS: &str = "groups";

    pub fn category(category_id: &str) -> String {
        format!("{CATEGORY_PREFIX}{category_id}")
    }

    pub fn field(field_id: &str) -> String {
        format!("{FIELD_PREFIX}{field_id}")
    }
}

#[derive(Clone)]
enum CachedData {
    Fields(Vec<FieldConfig>),
    Field(FieldConfig),
    Mappings(Vec<CategoryFieldMapping>),
    Groups(Vec<FieldGroup>),
}

/// Orchestrates reads and writes of field configuration against the store.
pub struct FieldDataAccess {
    store: Arc<dyn FieldStore>,
    cache: FieldCache<CachedData>,
    events: FieldEventBus,
    epoch: AtomicU64,
}

impl FieldDataAccess {
    pub fn new(store: Arc<dyn FieldStore>, events: FieldEventBus, config: &EngineConfig) -> Self {
        Self::with_ttl(store, events, config.cache_ttl())
    }

    pub fn with_ttl(store: Arc<dyn FieldStore>, events: FieldEventBus, ttl: Duration) -> Self {
        Self {
            store,
            cache: FieldCache::new(ttl),
            events,
            epoch: AtomicU64::new(0),
        }
    }

    /// The bus mutations are published on.
    pub fn events(&self) -> &FieldEventBus {
        &self.events
    }

    pub fn subscribe(&self, listener: impl FieldEventListener + 'static) -> Subscription {
        self.events.subscribe(listener)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // --- Reads ---

    /// Every field in the store, active or not.
    pub async fn get_all_fields(&self) -> Result<Vec<FieldConfig>> {
        if let Some(CachedData::Fields(fields)) = self.cache.get(keys::ALL_FIELDS) {
            return Ok(fields);
        }
        let epoch = self.current_epoch();
        let fields = self
            .store
            .fetch_all_fields()
            .await
            .map_err(|e| FieldsError::registry("fetch_all_fields", e))?;
        debug!(fields = fields.len(), "fetched all fields");
        self.fill(keys::ALL_FIELDS, CachedData::Fields(fields.clone()), epoch);
        Ok(fields)
    }

    /// One field by id.
    pub async fn get_field(&self, id: &str) -> Result<FieldConfig> {
        let key = keys::field(id);
        if let Some(CachedData::Field(field)) = self.cache.get(&key) {
            return Ok(field);
        }
        let epoch = self.current_epoch();
        let field = self
            .get_all_fields()
            .await?
            .into_iter()
            .find(|f| f.id == id)
            .ok_or_else(|| FieldsError::FieldNotFound { id: id.to_string() })?;
        self.fill(&key, CachedData::Field(field.clone()), epoch);
        Ok(field)
    }

    /// Active fields of a category, sorted by display order.
    pub async fn get_fields_for_category(&self, category_id: &str) -> Result<Vec<FieldConfig>> {
        let key = keys::category(category_id);
        if let Some(CachedData::Fields(fields)) = self.cache.get(&key) {
            return Ok(fields);
        }
        let epoch = self.current_epoch();
        let mut fields: Vec<FieldConfig> = self
            .store
            .fetch_fields_for_category(category_id)
            .await
            .map_err(|e| FieldsError::registry("fetch_fields_for_category", e))?
            .into_iter()
            .filter(|f| f.is_active)
            .collect();
        fields.sort_by_key(|f| f.display_order);
        debug!(%category_id, fields = fields.len(), "fetched category fields");
        self.fill(&key, CachedData::Fields(fields.clone()), epoch);
        Ok(fields)
    }

    pub async fn get_category_mappings(&self) -> Result<Vec<CategoryFieldMapping>> {
        if let Some(CachedData::Mappings(mappings)) = self.cache.get(keys::MAPPINGS) {
            return Ok(mappings);
        }
        let epoch = self.current_epoch();
        let mappings = self
            .store
            .fetch_category_mappings()
            .await
            .map_err(|e| FieldsError::registry("fetch_category_mappings", e))?;
        self.fill(keys::MAPPINGS, CachedData::Mappings(mappings.clone()), epoch);
        Ok(mappings)
    }

    pub async fn get_category_mapping(
        &self,
        category_id: &str,
    ) -> Result<Option<CategoryFieldMapping>> {
        Ok(self
            .get_category_mappings()
            .await?
            .into_iter()
            .find(|m| m.category_id == category_id))
    }

    /// Field groups, sorted by display order.
    pub async fn get_field_groups(&self) -> Result<Vec<FieldGroup>> {
        if let Some(CachedData::Groups(groups)) = self.cache.get(keys::GROUPS) {
            return Ok(groups);
        }
        let epoch = self.current_epoch();
        let mut groups = self
            .store
            .fetch_field_groups()
            .await
            .map_err(|e| FieldsError::registry("fetch_field_groups", e))?;
        groups.sort_by_key(|g| g.display_order);
        self.fill(keys::GROUPS, CachedData::Groups(groups.clone()), epoch);
        Ok(groups)
    }

    /// Fetch every field and mapping from the store, dropping whatever is
    /// cached first. This is the explicit resynchronisation point when live
    /// updates may have been missed.
    pub async fn reload(&self) -> Result<(Vec<FieldConfig>, Vec<CategoryFieldMapping>)> {
        self.invalidate_all();
        let fields = self.get_all_fields().await?;
        let mappings = self.get_category_mappings().await?;
        Ok((fields, mappings))
    }

    // --- Mutations ---

    pub async fn create_field(&self, config: NewFieldConfig) -> Result<FieldConfig> {
        let field = self
            .store
            .create_field(config)
            .await
            .map_err(|e| FieldsError::registry("create_field", e))?;
        debug!(id = %field.id, key = %field.key, "created field");
        self.invalidate_for(Some(&field.id), &field.categories);
        self.events.publish(&FieldEvent::FieldAdded {
            field: field.clone(),
        });
        Ok(field)
    }

    /// Patch a field. Publishes `field_activated`/`field_deactivated` when the
    /// patch flips the active flag, `field_updated` otherwise.
    pub async fn update_field(&self, id: &str, patch: FieldPatch) -> Result<FieldConfig> {
        let previous = self.get_field(id).await?;
        let field = self
            .store
            .update_field(id, patch)
            .await
            .map_err(|e| FieldsError::registry("update_field", e))?;
        debug!(id = %field.id, version = field.version, "updated field");

        let mut touched = previous.categories.clone();
        touched.extend(field.categories.iter().cloned());
        self.invalidate_for(Some(id), &touched);

        let event = match (previous.is_active, field.is_active) {
            (false, true) => FieldEvent::FieldActivated {
                field: field.clone(),
            },
            (true, false) => FieldEvent::FieldDeactivated {
                field: field.clone(),
            },
            _ => FieldEvent::FieldUpdated {
                field: field.clone(),
                previous_categories: previous.categories,
            },
        };
        self.events.publish(&event);
        Ok(field)
    }

    pub async fn activate_field(&self, id: &str) -> Result<FieldConfig> {
        self.update_field(id, FieldPatch::active(true)).await
    }

    /// Soft delete.
    pub async fn deactivate_field(&self, id: &str) -> Result<FieldConfig> {
        self.update_field(id, FieldPatch::active(false)).await
    }

    /// Hard delete.
    pub async fn delete_field(&self, id: &str) -> Result<()> {
        let previous = self.get_field(id).await?;
        self.store
            .delete_field(id)
            .await
            .map_err(|e| FieldsError::registry("delete_field", e))?;
        debug!(%id, key = %previous.key, "deleted field");
        self.invalidate_for(Some(id), &previous.categories);
        self.events.publish(&FieldEvent::FieldRemoved {
            field_id: previous.id,
            key: previous.key,
            categories: previous.categories,
        });
        Ok(())
    }

    // --- Live updates ---

    /// Handle a change made through another writer: drop what it touches and
    /// rebroadcast it to local subscribers.
    pub fn apply_external_change(&self, event: &FieldEvent) {
        debug!(kind = event.kind(), "applying external change");
        self.invalidate_for(event.field_id(), &event.affected_categories());
        self.events.publish(event);
    }

    pub fn notify_category_mapping_changed(&self, category_id: &str) {
        self.apply_external_change(&FieldEvent::CategoryMappingChanged {
            category_id: category_id.to_string(),
        });
    }

    /// Forget every cached read.
    pub fn invalidate_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache.clear();
        debug!("invalidated entire field cache");
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Cache a fetch result unless an invalidation happened since `epoch`.
    fn fill(&self, key: &str, data: CachedData, epoch: u64) {
        if self.current_epoch() != epoch {
            trace!(%key, "invalidated while fetching, not caching");
            return;
        }
        self.cache.set(key, data);
        // An invalidation between the check and the set must still win.
        if self.current_epoch() != epoch {
            self.cache.delete(key);
        }
    }

    fn invalidate_for(&self, field_id: Option<&str>, categories: &[String]) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(id) = field_id {
            self.cache.delete(&keys::field(id));
        }
        self.cache.delete(keys::ALL_FIELDS);
        self.cache.delete(keys::MAPPINGS);
        for category_id in categories {
            self.cache.delete(&keys::category(category_id));
        }
        debug!(?field_id, categories = categories.len(), "invalidated cache scope");
    }
}
