//! In-memory key-value store.

use super::{KeyValueStore, Result, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
enum Value {
    String(String),
    Hash(HashMap<String, String>),
    SortedSet(Vec<(String, f64)>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

/// Expiry is applied lazily: an expired key reads as absent and is dropped
/// on the next write that touches it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Members of a sorted set in ascending score order.
    pub async fn sorted_set_members(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let entries = self.entries.read().await;
        match entries.get(key).filter(|e| e.is_live(Instant::now())) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::SortedSet(members),
                ..
            }) => Ok(members.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>, key: &str) {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        entries.remove(key);
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        match entries.get(key).filter(|e| e.is_live(Instant::now())) {
            None => Ok(None),
            Some(Entry {
                value: Value::String(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        // Like Redis SET, this clears any pending expiry.
        entries.insert(key.to_string(), Entry::new(Value::String(value.to_string())));
        Ok(())
    }

    async fn hash_get(&self, hash: &str, field: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        match entries.get(hash).filter(|e| e.is_live(Instant::now())) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields.get(field).cloned()),
            Some(_) => Err(StoreError::WrongType(hash.to_string())),
        }
    }

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries, hash);

        let entry = entries
            .entry(hash.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(fields) => {
                fields.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(StoreError::WrongType(hash.to_string())),
        }
    }

    async fn hash_incr_by(&self, hash: &str, field: &str, delta: i64) -> Result<i64> {
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries, hash);

        let entry = entries
            .entry(hash.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        let fields = match &mut entry.value {
            Value::Hash(fields) => fields,
            _ => return Err(StoreError::WrongType(hash.to_string())),
        };

        let current = match fields.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::NotAnInteger {
                hash: hash.to_string(),
                field: field.to_string(),
            })?,
            None => 0,
        };
        let updated = current.checked_add(delta).ok_or_else(|| StoreError::NotAnInteger {
            hash: hash.to_string(),
            field: field.to_string(),
        })?;

        fields.insert(field.to_string(), updated.to_string());
        Ok(updated)
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries, key);

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::SortedSet(Vec::new())));
        let members = match &mut entry.value {
            Value::SortedSet(members) => members,
            _ => return Err(StoreError::WrongType(key.to_string())),
        };

        members.retain(|(existing, _)| existing != member);
        let index = members.partition_point(|(_, s)| *s <= score);
        members.insert(index, (member.to_string(), score));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .is_some_and(|e| e.is_live(Instant::now())))
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        let mut entries = self.entries.write().await;
        purge_expired(&mut entries, key);

        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
