//! The abstraction over the persistent document store.
//!
//! The real store is an external collaborator; the server only depends on
//! this collection-style interface. Documents are JSON objects, entity keys
//! are snowflake ids as strings, and cross-references are embedded by id.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod memory;

pub use memory::MemoryRepository;

/// Collection names used by the server.
pub mod collections {
    pub const USERS: &str = "users";
    pub const GUILDS: &str = "guilds";
    pub const CHANNELS: &str = "channels";
    pub const ROLES: &str = "roles";
    pub const MEMBERS: &str = "members";
    pub const MESSAGES: &str = "messages";
    pub const INVITES: &str = "invites";
    pub const TOKENS: &str = "tokens";
}

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("no such collection: {0}")]
    UnknownCollection(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A conjunction of field equality constraints.
#[derive(Debug, Clone, Default)]
pub struct Query(Vec<(String, Value)>);

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.push((field.into(), value.into()));
        self
    }

    /// An empty query, matching every document.
    pub fn all() -> Self {
        Self::new()
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.0.iter().all(|(field, expected)| doc.get(field) == Some(expected))
    }
}

/// Counts reported back from a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
    pub inserted_id: Option<String>,
}

/// One named collection of documents.
#[async_trait]
pub trait Collection: Send + Sync {
    async fn find_one(&self, query: Query) -> RepoResult<Option<Value>>;

    /// All matching documents, optionally sorted ascending by a field.
    /// Fields holding stringified snowflakes sort numerically.
    async fn find(&self, query: Query, sort: Option<&str>) -> RepoResult<Vec<Value>>;

    async fn insert_one(&self, doc: Value) -> RepoResult<WriteOutcome>;

    /// Merge `patch`'s top-level fields over the first matching document.
    async fn update_one(&self, query: Query, patch: Value) -> RepoResult<WriteOutcome>;

    /// Replace the first matching document wholesale.
    async fn replace_one(&self, query: Query, doc: Value) -> RepoResult<WriteOutcome>;

    async fn delete_one(&self, query: Query) -> RepoResult<WriteOutcome>;

    async fn delete_many(&self, query: Query) -> RepoResult<WriteOutcome>;

    async fn count(&self, query: Query) -> RepoResult<u64>;
}

/// The store: a bag of named collections.
pub trait Repository: Send + Sync {
    fn collection(&self, name: &str) -> Arc<dyn Collection>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn query_matches_conjunction() {
        let doc = json!({"guild_id": "10", "user_id": "20", "nick": null});
        assert!(Query::new().eq("guild_id", "10").matches(&doc));
        assert!(Query::new().eq("guild_id", "10").eq("user_id", "20").matches(&doc));
        assert!(!Query::new().eq("guild_id", "10").eq("user_id", "99").matches(&doc));
        assert!(Query::all().matches(&doc));
    }

    #[test]
    fn query_missing_field_never_matches() {
        let doc = json!({"code": "abc"});
        assert!(!Query::new().eq("channel_id", "5").matches(&doc));
    }
}
