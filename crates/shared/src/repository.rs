//! Generic repository abstraction
//!
//! Services talk to storage through [`Repository`], scoped by simple
//! equality filters. Postgres-backed implementations live next to the
//! entities they persist; [`InMemoryRepository`] backs tests and local runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// A comparable column value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldValue {
    Text(String),
    Uuid(Uuid),
    Int(i64),
    Bool(bool),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        FieldValue::Uuid(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

/// Query filter. Multiple scopes compose by conjunction.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    Eq(&'static str, FieldValue),
}

impl Scope {
    pub fn eq(field: &'static str, value: impl Into<FieldValue>) -> Self {
        Scope::Eq(field, value.into())
    }

    pub fn matches<T: Entity>(&self, entity: &T) -> bool {
        match self {
            Scope::Eq(field, expected) => entity.field(field).as_ref() == Some(expected),
        }
    }
}

/// A persisted record
pub trait Entity: Clone + Send + Sync + 'static {
    /// Singular name used in error messages
    const NAME: &'static str;

    fn id(&self) -> Uuid;

    /// Value of a filterable field, `None` when unknown or null
    fn field(&self, name: &str) -> Option<FieldValue>;

    /// Fields that must be unique across all records
    fn unique_fields() -> &'static [&'static str] {
        &[]
    }
}

#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    /// First record matching every scope, `NotFound` when none does.
    async fn find_one(&self, scopes: &[Scope]) -> StoreResult<T>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<T>;

    async fn find_many(&self, scopes: &[Scope]) -> StoreResult<Vec<T>>;

    async fn create_one(&self, entity: &T) -> StoreResult<T>;

    async fn update_one(&self, entity: &T) -> StoreResult<T>;
}

/// Thread-safe in-process repository that enforces [`Entity::unique_fields`]
pub struct InMemoryRepository<T: Entity> {
    records: Arc<RwLock<Vec<T>>>,
    failures: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl<T: Entity> Clone for InMemoryRepository<T> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            failures: Arc::clone(&self.failures),
            writes: Arc::clone(&self.writes),
        }
    }
}

impl<T: Entity> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            failures: Arc::new(AtomicUsize::new(0)),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_records(records: Vec<T>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
            failures: Arc::new(AtomicUsize::new(0)),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `count` writes fail with a database error.
    pub fn fail_next_writes(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Successful creates and updates so far
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<T> {
        self.records.read().await.clone()
    }

    fn take_failure(&self) -> StoreResult<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Database("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn check_unique(records: &[T], candidate: &T) -> StoreResult<()> {
        for field in T::unique_fields() {
            let Some(value) = candidate.field(field) else {
                continue;
            };
            let clash = records
                .iter()
                .filter(|r| r.id() != candidate.id())
                .any(|r| r.field(field).as_ref() == Some(&value));
            if clash {
                return Err(StoreError::UniqueViolation {
                    entity: T::NAME,
                    field: (*field).to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for InMemoryRepository<T> {
    async fn find_one(&self, scopes: &[Scope]) -> StoreResult<T> {
        let records = self.records.read().await;
        records
            .iter()
            .find(|r| scopes.iter().all(|s| s.matches(*r)))
            .cloned()
            .ok_or(StoreError::not_found(T::NAME))
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<T> {
        let records = self.records.read().await;
        records
            .iter()
            .find(|r| r.id() == id)
            .cloned()
            .ok_or(StoreError::not_found(T::NAME))
    }

    async fn find_many(&self, scopes: &[Scope]) -> StoreResult<Vec<T>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| scopes.iter().all(|s| s.matches(*r)))
            .cloned()
            .collect())
    }

    async fn create_one(&self, entity: &T) -> StoreResult<T> {
        self.take_failure()?;
        let mut records = self.records.write().await;
        if records.iter().any(|r| r.id() == entity.id()) {
            return Err(StoreError::UniqueViolation {
                entity: T::NAME,
                field: "id".to_string(),
            });
        }
        Self::check_unique(&records, entity)?;
        records.push(entity.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(entity.clone())
    }

    async fn update_one(&self, entity: &T) -> StoreResult<T> {
        self.take_failure()?;
        let mut records = self.records.write().await;
        Self::check_unique(&records, entity)?;
        let slot = records
            .iter_mut()
            .find(|r| r.id() == entity.id())
            .ok_or(StoreError::not_found(T::NAME))?;
        *slot = entity.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(entity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Widget {
        id: Uuid,
        owner: Uuid,
        sku: String,
    }

    impl Entity for Widget {
        const NAME: &'static str = "widget";

        fn id(&self) -> Uuid {
            self.id
        }

        fn field(&self, name: &str) -> Option<FieldValue> {
            match name {
                "id" => Some(self.id.into()),
                "owner" => Some(self.owner.into()),
                "sku" => Some(self.sku.clone().into()),
                _ => None,
            }
        }

        fn unique_fields() -> &'static [&'static str] {
            &["sku"]
        }
    }

    fn widget(owner: Uuid, sku: &str) -> Widget {
        Widget {
            id: Uuid::new_v4(),
            owner,
            sku: sku.to_string(),
        }
    }

    #[tokio::test]
    async fn find_one_applies_all_scopes() {
        let owner = Uuid::new_v4();
        let repo = InMemoryRepository::new();
        repo.create_one(&widget(owner, "a")).await.unwrap();
        repo.create_one(&widget(owner, "b")).await.unwrap();

        let found = repo
            .find_one(&[Scope::eq("owner", owner), Scope::eq("sku", "b")])
            .await
            .unwrap();
        assert_eq!(found.sku, "b");

        let missing = repo
            .find_one(&[Scope::eq("owner", Uuid::new_v4())])
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_unique_field() {
        let repo = InMemoryRepository::new();
        repo.create_one(&widget(Uuid::new_v4(), "dup")).await.unwrap();

        let err = repo
            .create_one(&widget(Uuid::new_v4(), "dup"))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn update_replaces_record_in_place() {
        let repo = InMemoryRepository::new();
        let mut w = repo.create_one(&widget(Uuid::new_v4(), "x")).await.unwrap();
        w.sku = "y".to_string();
        repo.update_one(&w).await.unwrap();

        assert_eq!(repo.find_by_id(w.id).await.unwrap().sku, "y");
        assert_eq!(repo.len().await, 1);
        assert_eq!(repo.writes(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let repo = InMemoryRepository::new();
        repo.fail_next_writes(1);

        let err = repo
            .create_one(&widget(Uuid::new_v4(), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
        assert_eq!(repo.writes(), 0);
        repo.create_one(&widget(Uuid::new_v4(), "x")).await.unwrap();
        assert_eq!(repo.writes(), 1);
    }
}
