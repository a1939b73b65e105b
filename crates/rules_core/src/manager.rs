use std::sync::Arc;

use anyhow::Result;
use shared::{
    domain::{RouteRule, RuleId},
    events::RuleChange,
};
use tracing::info;

use crate::{bus::ChangeBus, RuleStore};

/// Write-side facade. Every mutation lands in the store first and is then
/// announced on the change bus, so all listing instances converge without
/// polling.
#[derive(Clone)]
pub struct RuleManager {
    store: Arc<dyn RuleStore>,
    bus: ChangeBus,
}

impl RuleManager {
    pub fn new(store: Arc<dyn RuleStore>, bus: ChangeBus) -> Self {
        Self { store, bus }
    }

    /// Inserts the rule at the end of the listing (next free sort key) and
    /// returns it with its assigned id.
    pub async fn create_rule(&self, mut rule: RouteRule) -> Result<RouteRule> {
        rule.user_order = self.store.next_user_order().await?;
        rule.id = self.store.insert(&rule).await?;
        info!(rule_id = rule.id.0, name = %rule.display_name(), "created rule");
        self.bus.publish(RuleChange::Added { rule: rule.clone() });
        Ok(rule)
    }

    pub async fn update_rule(&self, rule: RouteRule) -> Result<()> {
        self.store.upsert_one(&rule).await?;
        self.bus.publish(RuleChange::Updated { rule });
        Ok(())
    }

    pub async fn delete_rules(&self, ids: &[RuleId]) -> Result<()> {
        let deleted = self.store.delete_batch(ids).await?;
        info!(deleted, "deleted rules");
        for id in ids {
            self.bus.publish(RuleChange::Removed { id: *id });
        }
        Ok(())
    }

    pub async fn clear_rules(&self) -> Result<()> {
        let removed = self.store.delete_all().await?;
        info!(removed, "cleared all rules");
        self.bus.publish(RuleChange::Cleared);
        Ok(())
    }
}
