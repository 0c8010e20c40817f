//! Storage configuration.
//!
//! [`StorageConfig`] tunes how an [`EntityRegistry`](crate::registry::EntityRegistry)
//! manages archetypes and pooled chunks. It is plain data with a [`Default`]
//! and can be loaded from JSON:
//!
//! ```
//! use lode_ecs::config::{EmptyArchetypePolicy, StorageConfig};
//!
//! let config = StorageConfig::from_json_str(
//!     r#"{ "empty_archetype_policy": "teardown", "max_pooled_chunks": 8 }"#,
//! )
//! .unwrap();
//! assert_eq!(config.empty_archetype_policy, EmptyArchetypePolicy::Teardown);
//! assert_eq!(config.initial_chunks_per_archetype, 0);
//! ```

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::EcsError;

/// Upper bound for [`StorageConfig::initial_chunks_per_archetype`]. Larger
/// values are clamped.
pub const MAX_INITIAL_CHUNKS: u32 = 64;

/// What happens to an archetype once its last entity leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyArchetypePolicy {
    /// Keep the archetype and its chunks for the next entity with that type
    /// set.
    #[default]
    Retain,
    /// Remove the archetype immediately and return its chunks to the pool.
    Teardown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub empty_archetype_policy: EmptyArchetypePolicy,
    /// Chunks reserved up front when an archetype is created.
    pub initial_chunks_per_archetype: u32,
    /// Free chunks kept by the pool when it is trimmed. `None` keeps
    /// everything until [`trim_pool`](crate::registry::EntityRegistry::trim_pool)
    /// is called, which then frees every idle chunk.
    pub max_pooled_chunks: Option<u32>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            empty_archetype_policy: EmptyArchetypePolicy::Retain,
            initial_chunks_per_archetype: 0,
            max_pooled_chunks: None,
        }
    }
}

impl StorageConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// [`EcsError::InvalidConfig`] on malformed JSON or unknown fields.
    pub fn from_json_str(json: &str) -> Result<Self, EcsError> {
        serde_json::from_str(json).map_err(|e| EcsError::InvalidConfig {
            details: e.to_string(),
        })
    }

    /// Clamp out-of-range values, logging each adjustment.
    pub(crate) fn sanitized(mut self) -> Self {
        if self.initial_chunks_per_archetype > MAX_INITIAL_CHUNKS {
            warn!(
                requested = self.initial_chunks_per_archetype,
                max = MAX_INITIAL_CHUNKS,
                "initial_chunks_per_archetype clamped"
            );
            self.initial_chunks_per_archetype = MAX_INITIAL_CHUNKS;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
