//! The in-memory store used when no external document store is attached.
//! It implements the whole [`Repository`](super::Repository) surface so the
//! server and the tests are oblivious to what is actually behind it.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{collections, Collection, Query, RepoResult, Repository, WriteOutcome};

// `RwLock` here is tokio's: collection calls await on it, and the store is
// touched from many request handlers on the same runtime.

#[derive(Default)]
pub struct MemoryRepository {
    known: HashMap<String, Arc<MemoryCollection>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        let known = [
            collections::USERS,
            collections::GUILDS,
            collections::CHANNELS,
            collections::ROLES,
            collections::MEMBERS,
            collections::MESSAGES,
            collections::INVITES,
            collections::TOKENS,
        ]
        .iter()
        .map(|name| ((*name).to_string(), Arc::new(MemoryCollection::default())))
        .collect();
        Self { known }
    }
}

impl Repository for MemoryRepository {
    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        if let Some(existing) = self.known.get(name) {
            return Arc::clone(existing) as Arc<dyn Collection>;
        }
        // unexpected collections spring into existence empty; matches the
        // behavior of document stores, and the caller's queries just find
        // nothing
        log::warn!("[repo] unknown collection {:?} requested", name);
        Arc::new(MemoryCollection::default())
    }
}

#[derive(Default)]
pub struct MemoryCollection {
    docs: RwLock<Vec<Value>>,
}

/// Sort snowflake-id strings numerically, everything else as json text.
fn field_ordering(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::String(a)), Some(Value::String(b))) => {
            match (a.parse::<u64>(), b.parse::<u64>()) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                _ => a.cmp(b),
            }
        }
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal)
        }
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    async fn find_one(&self, query: Query) -> RepoResult<Option<Value>> {
        let docs = self.docs.read().await;
        Ok(docs.iter().find(|doc| query.matches(doc)).cloned())
    }

    async fn find(&self, query: Query, sort: Option<&str>) -> RepoResult<Vec<Value>> {
        let docs = self.docs.read().await;
        let mut found: Vec<Value> = docs.iter().filter(|doc| query.matches(doc)).cloned().collect();
        if let Some(field) = sort {
            found.sort_by(|a, b| field_ordering(a.get(field), b.get(field)));
        }
        Ok(found)
    }

    async fn insert_one(&self, doc: Value) -> RepoResult<WriteOutcome> {
        let inserted_id = doc.get("id")
            .or_else(|| doc.get("code"))
            .and_then(Value::as_str)
            .map(ToString::to_string);
        self.docs.write().await.push(doc);
        Ok(WriteOutcome { inserted_id, ..Default::default() })
    }

    async fn update_one(&self, query: Query, patch: Value) -> RepoResult<WriteOutcome> {
        let mut docs = self.docs.write().await;
        let Some(doc) = docs.iter_mut().find(|doc| query.matches(doc)) else {
            return Ok(WriteOutcome::default());
        };
        let mut modified = 0;
        if let (Some(target), Some(fields)) = (doc.as_object_mut(), patch.as_object()) {
            for (key, value) in fields {
                if target.get(key) != Some(value) {
                    modified = 1;
                }
                target.insert(key.clone(), value.clone());
            }
        }
        Ok(WriteOutcome { matched_count: 1, modified_count: modified, ..Default::default() })
    }

    async fn replace_one(&self, query: Query, new_doc: Value) -> RepoResult<WriteOutcome> {
        let mut docs = self.docs.write().await;
        let Some(doc) = docs.iter_mut().find(|doc| query.matches(doc)) else {
            return Ok(WriteOutcome::default());
        };
        let modified = u64::from(*doc != new_doc);
        *doc = new_doc;
        Ok(WriteOutcome { matched_count: 1, modified_count: modified, ..Default::default() })
    }

    async fn delete_one(&self, query: Query) -> RepoResult<WriteOutcome> {
        let mut docs = self.docs.write().await;
        if let Some(idx) = docs.iter().position(|doc| query.matches(doc)) {
            docs.remove(idx);
            Ok(WriteOutcome { deleted_count: 1, ..Default::default() })
        } else {
            Ok(WriteOutcome::default())
        }
    }

    async fn delete_many(&self, query: Query) -> RepoResult<WriteOutcome> {
        let mut docs = self.docs.write().await;
        let before = docs.len();
        docs.retain(|doc| !query.matches(doc));
        Ok(WriteOutcome {
            deleted_count: (before - docs.len()) as u64,
            ..Default::default()
        })
    }

    async fn count(&self, query: Query) -> RepoResult<u64> {
        let docs = self.docs.read().await;
        Ok(docs.iter().filter(|doc| query.matches(doc)).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn insert_find_delete() {
        let coll = MemoryCollection::default();
        coll.insert_one(json!({"id": "1", "name": "a"})).await.unwrap();
        coll.insert_one(json!({"id": "2", "name": "b"})).await.unwrap();

        let found = coll.find_one(Query::new().eq("id", "2")).await.unwrap().unwrap();
        assert_eq!(found["name"], "b");

        let outcome = coll.delete_one(Query::new().eq("id", "1")).await.unwrap();
        assert_eq!(outcome.deleted_count, 1);
        assert_eq!(coll.count(Query::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_merges_fields() {
        let coll = MemoryCollection::default();
        coll.insert_one(json!({"id": "1", "name": "a", "topic": ""})).await.unwrap();
        let outcome = coll
            .update_one(Query::new().eq("id", "1"), json!({"topic": "hello"}))
            .await
            .unwrap();
        assert_eq!(outcome.matched_count, 1);
        assert_eq!(outcome.modified_count, 1);
        let doc = coll.find_one(Query::new().eq("id", "1")).await.unwrap().unwrap();
        assert_eq!(doc["name"], "a");
        assert_eq!(doc["topic"], "hello");
    }

    #[tokio::test]
    async fn sort_is_numeric_for_snowflake_strings() {
        let coll = MemoryCollection::default();
        coll.insert_one(json!({"id": "900"})).await.unwrap();
        coll.insert_one(json!({"id": "1000"})).await.unwrap();
        coll.insert_one(json!({"id": "5"})).await.unwrap();

        let sorted = coll.find(Query::all(), Some("id")).await.unwrap();
        let ids: Vec<&str> = sorted.iter().map(|d| d["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["5", "900", "1000"]);
    }

    #[tokio::test]
    async fn delete_many_reports_count() {
        let coll = MemoryCollection::default();
        for i in 0..5 {
            coll.insert_one(json!({"guild_id": "7", "n": i})).await.unwrap();
        }
        coll.insert_one(json!({"guild_id": "8"})).await.unwrap();
        let outcome = coll.delete_many(Query::new().eq("guild_id", "7")).await.unwrap();
        assert_eq!(outcome.deleted_count, 5);
        assert_eq!(coll.count(Query::all()).await.unwrap(), 1);
    }
}
