//! Stored entities and their persistence.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nimbus_shared::types::{EntityId, PolicyId};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Reference to one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity identifier; nil for the placeholder.
    pub id: EntityId,
    /// Path or key inside the policy.
    pub source: String,
    /// Size in bytes.
    pub size: u64,
    /// Policy holding the object.
    pub policy_id: PolicyId,
    /// Last time the content changed.
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Create an entity for an object that was just stored.
    #[must_use]
    pub fn new(policy_id: PolicyId, source: impl Into<String>, size: u64) -> Self {
        Self {
            id: EntityId::new(),
            source: source.into(),
            size,
            policy_id,
            updated_at: Utc::now(),
        }
    }

    /// The empty entity of a file that has no content yet.
    #[must_use]
    pub fn placeholder(policy_id: PolicyId) -> Self {
        Self {
            id: EntityId::nil(),
            source: String::new(),
            size: 0,
            policy_id,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Whether this is the placeholder entity.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.id.is_nil()
    }
}

/// Repository trait for entity persistence.
pub trait EntityRepository: Send + Sync {
    /// Store an entity, replacing any entity with the same id.
    fn create(
        &self,
        entity: Entity,
    ) -> impl std::future::Future<Output = Result<Entity, StorageError>> + Send;

    /// Find an entity by id.
    fn find_by_id(
        &self,
        id: EntityId,
    ) -> impl std::future::Future<Output = Result<Option<Entity>, StorageError>> + Send;

    /// Delete an entity. Returns false if it did not exist.
    fn delete(
        &self,
        id: EntityId,
    ) -> impl std::future::Future<Output = Result<bool, StorageError>> + Send;
}

/// Process-local entity store.
#[derive(Debug, Default)]
pub struct InMemoryEntityRepository {
    entities: DashMap<EntityId, Entity>,
}

impl InMemoryEntityRepository {
    /// Empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the repository is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl EntityRepository for InMemoryEntityRepository {
    async fn create(&self, entity: Entity) -> Result<Entity, StorageError> {
        self.entities.insert(entity.id, entity.clone());
        Ok(entity)
    }

    async fn find_by_id(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        Ok(self.entities.get(&id).map(|e| e.value().clone()))
    }

    async fn delete(&self, id: EntityId) -> Result<bool, StorageError> {
        Ok(self.entities.remove(&id).is_some())
    }
}
