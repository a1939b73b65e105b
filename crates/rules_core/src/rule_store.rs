use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::{RouteRule, RuleId};
use storage::Storage;

use crate::RuleStore;

/// SQLite-backed [`RuleStore`]. One instance per process; engines and the
/// manager share it through `Arc<dyn RuleStore>`.
pub struct DurableRuleStore {
    storage: Storage,
}

impl DurableRuleStore {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let storage = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to open rule store at {database_url}"))?;
        Ok(Arc::new(Self { storage }))
    }

    pub fn from_storage(storage: Storage) -> Arc<Self> {
        Arc::new(Self { storage })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

#[async_trait]
impl RuleStore for DurableRuleStore {
    async fn list_ordered(&self) -> Result<Vec<RouteRule>> {
        self.storage.list_rules_ordered().await
    }

    async fn insert(&self, rule: &RouteRule) -> Result<RuleId> {
        self.storage.create_rule(rule).await
    }

    async fn next_user_order(&self) -> Result<i64> {
        self.storage.next_user_order().await
    }

    async fn upsert_one(&self, rule: &RouteRule) -> Result<()> {
        self.storage.update_rule(rule).await
    }

    async fn upsert_batch(&self, rules: &[RouteRule]) -> Result<()> {
        self.storage.update_rules(rules).await
    }

    async fn delete_batch(&self, ids: &[RuleId]) -> Result<u64> {
        self.storage.delete_rules(ids).await
    }

    async fn delete_all(&self) -> Result<u64> {
        self.storage.delete_all_rules().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rules_survive_reopening_the_store() {
        let suffix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let temp_root = std::env::temp_dir().join(format!("routeboard_store_test_{suffix}"));
        let db_path = temp_root.join("rules.db");
        let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

        let id = {
            let store = DurableRuleStore::initialize(&database_url)
                .await
                .expect("open");
            let mut rule = RouteRule::new("persisted");
            rule.user_order = 1;
            store.insert(&rule).await.expect("insert")
        };

        let reopened = DurableRuleStore::initialize(&database_url)
            .await
            .expect("reopen");
        let rules = reopened.list_ordered().await.expect("list");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, id);

        std::fs::remove_dir_all(temp_root).expect("cleanup");
    }
}
