//! Durable table interface.
//!
//! The lock and semaphore managers optionally mirror their state into a
//! key/value table so it can be rebuilt after a restart. The disk engine
//! itself lives outside this crate; what the managers need is scalar, set,
//! and hash operations plus an idle signal. [`MemTable`] is the in-process
//! implementation used by default and under test.

use crate::error::CoordinationResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

/// One stored value: a scalar, a string set, or a field hash.
#[derive(Debug, Clone, PartialEq)]
pub enum TableValue {
    Scalar(Value),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, Value>),
}

/// Key/value store with set and hash operations.
#[async_trait]
pub trait Table: Send + Sync + 'static {
    /// Reads the value under `key`.
    async fn get(&self, key: &str) -> CoordinationResult<Option<TableValue>>;

    /// Writes a scalar under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Value) -> CoordinationResult<()>;

    /// Adds `member` to the set under `key`.
    async fn sset(&self, key: &str, member: &str) -> CoordinationResult<()>;

    /// Removes `member` from the set under `key`, dropping the key when the
    /// set empties.
    async fn sdel(&self, key: &str, member: &str) -> CoordinationResult<()>;

    /// Writes `field` in the hash under `key`.
    async fn hset(&self, key: &str, field: &str, value: Value) -> CoordinationResult<()>;

    /// Removes `field` from the hash under `key`, dropping the key when the
    /// hash empties.
    async fn hdel(&self, key: &str, field: &str) -> CoordinationResult<()>;

    /// Removes `key` entirely.
    async fn del(&self, key: &str) -> CoordinationResult<()>;

    /// Removes everything.
    async fn clear(&self) -> CoordinationResult<()>;

    /// Visits a snapshot of every entry.
    async fn for_each(
        &self,
        f: &mut (dyn for<'a> FnMut(&'a str, &'a TableValue) + Send),
    ) -> CoordinationResult<()>;

    /// Whether no writes are pending.
    fn idle(&self) -> bool;

    /// Loads persisted state, if the backend has any.
    async fn load(&self) -> CoordinationResult<()>;

    /// Flushes and shuts the backend down.
    async fn stop(&self) -> CoordinationResult<()>;
}

/// In-process table.
#[derive(Debug, Default)]
pub struct MemTable {
    entries: RwLock<HashMap<String, TableValue>>,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<String, TableValue>) -> R) -> R {
        let mut guard = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl Table for MemTable {
    async fn get(&self, key: &str) -> CoordinationResult<Option<TableValue>> {
        let guard = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> CoordinationResult<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), TableValue::Scalar(value));
        });
        Ok(())
    }

    async fn sset(&self, key: &str, member: &str) -> CoordinationResult<()> {
        self.with_entries(|entries| {
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| TableValue::Set(BTreeSet::new()));
            if let TableValue::Set(set) = entry {
                set.insert(member.to_string());
            } else {
                *entry = TableValue::Set(BTreeSet::from([member.to_string()]));
            }
        });
        Ok(())
    }

    async fn sdel(&self, key: &str, member: &str) -> CoordinationResult<()> {
        self.with_entries(|entries| {
            if let Some(TableValue::Set(set)) = entries.get_mut(key) {
                set.remove(member);
                if set.is_empty() {
                    entries.remove(key);
                }
            }
        });
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: Value) -> CoordinationResult<()> {
        self.with_entries(|entries| {
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| TableValue::Hash(BTreeMap::new()));
            if let TableValue::Hash(hash) = entry {
                hash.insert(field.to_string(), value);
            } else {
                *entry = TableValue::Hash(BTreeMap::from([(field.to_string(), value)]));
            }
        });
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> CoordinationResult<()> {
        self.with_entries(|entries| {
            if let Some(TableValue::Hash(hash)) = entries.get_mut(key) {
                hash.remove(field);
                if hash.is_empty() {
                    entries.remove(key);
                }
            }
        });
        Ok(())
    }

    async fn del(&self, key: &str) -> CoordinationResult<()> {
        self.with_entries(|entries| {
            entries.remove(key);
        });
        Ok(())
    }

    async fn clear(&self) -> CoordinationResult<()> {
        self.with_entries(|entries| entries.clear());
        Ok(())
    }

    async fn for_each(
        &self,
        f: &mut (dyn for<'a> FnMut(&'a str, &'a TableValue) + Send),
    ) -> CoordinationResult<()> {
        let snapshot: Vec<(String, TableValue)> = {
            let guard = self
                .entries
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (key, value) in &snapshot {
            f(key, value);
        }
        Ok(())
    }

    fn idle(&self) -> bool {
        true
    }

    async fn load(&self) -> CoordinationResult<()> {
        Ok(())
    }

    async fn stop(&self) -> CoordinationResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn hash_fields_accumulate_and_drain() {
        let table = MemTable::new();
        table.hset("k", "h1", json!(1)).await.unwrap();
        table.hset("k", "h2", json!(2)).await.unwrap();

        let Some(TableValue::Hash(hash)) = table.get("k").await.unwrap() else {
            panic!("expected hash");
        };
        assert_eq!(hash.len(), 2);

        table.hdel("k", "h1").await.unwrap();
        table.hdel("k", "h2").await.unwrap();
        assert!(table.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scalar_set_and_del() {
        let table = MemTable::new();
        table.set("k", json!("v")).await.unwrap();
        assert_eq!(
            table.get("k").await.unwrap(),
            Some(TableValue::Scalar(json!("v")))
        );
        table.del("k").await.unwrap();
        assert!(table.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn for_each_visits_every_entry() {
        let table = MemTable::new();
        table.set("a", json!(1)).await.unwrap();
        table.sset("b", "m").await.unwrap();
        let mut seen = Vec::new();
        table
            .for_each(&mut |key, _| seen.push(key.to_string()))
            .await
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);
    }
}
