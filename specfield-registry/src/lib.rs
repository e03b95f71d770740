//! Product specification field registry and form generation engine
//!
//! `specfield-registry` manages the schema of product specification inputs
//! ("amperage" for switches, "wattage" for lights): it caches field
//! configurations fetched from an external store, indexes them per category,
//! validates values against them and assembles renderable forms.
//!
//! # Architecture
//!
//! - **Store-backed**: durable CRUD lives behind the [`FieldStore`] trait; this
//!   crate never persists anything itself
//! - **Read cache**: [`FieldDataAccess`] caches fetches with a TTL and
//!   invalidates the affected scopes after every write round-trip
//! - **Observer events**: every change is published on a [`FieldEventBus`];
//!   registries, form engines and UI adapters subscribe to it
//! - **Explicit instances**: nothing is global; construct the pieces and pass
//!   them where they are needed
//!
//! ```no_run
//! use std::sync::Arc;
//! use specfield_registry::{
//!     EngineConfig, FieldDataAccess, FieldEventBus, FormEngine, FormGenerationOptions,
//!     MemoryFieldStore,
//! };
//!
//! # async fn demo() -> specfield_registry::Result<()> {
//! let config = EngineConfig::load()?;
//! let data = Arc::new(FieldDataAccess::new(
//!     Arc::new(MemoryFieldStore::new()),
//!     FieldEventBus::new(),
//!     &config,
//! ));
//! let forms = FormEngine::new(Arc::clone(&data), &config);
//! let schema = forms
//!     .generate_form_schema(&FormGenerationOptions::new("switches"))
//!     .await?;
//! let state = forms.create_initial_form_state(&schema.fields, &Default::default());
//! # let _ = state;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod data_access;
pub mod error;
pub mod events;
pub mod form;
pub mod legacy;
pub mod registry;
pub mod store;
pub mod types;
pub mod validation;

pub use cache::{CacheStats, FieldCache};
pub use config::EngineConfig;
pub use data_access::FieldDataAccess;
pub use error::{
    ConfigError, ConfigurationErrorCode, FieldConfigurationError, FieldsError, Result, StoreError,
};
pub use events::{FieldEvent, FieldEventBus, FieldEventListener, SubscriberId, Subscription};
pub use form::{FormEngine, FormGenerationOptions, FormSchema, FormState};
pub use legacy::{
    infer_category_type, LegacyAdapter, LegacyCategoryFieldMapping, LegacyFieldDefinition,
    CATEGORY_TYPE_RULES,
};
pub use registry::{FieldRegistry, LoadReport, RegistryState};
pub use store::{FieldStore, MemoryFieldStore, StoreOperation};
pub use types::{
    CategoryFieldMapping, CategoryType, Condition, ConditionalAction, ConditionalRule,
    FieldConfig, FieldGroup, FieldPatch, FieldType, NewFieldConfig, SelectOption,
    ValidationRules,
};
pub use validation::{
    FieldState, FieldValidationResult, FormValidationResult, FormValues, ValidationContext,
    ValidationEngine,
};
