use serde::{Deserialize, Serialize};

use crate::domain::{RouteRule, RuleId};

/// Change-bus notification published after a rule write lands in the store.
/// Every listing instance reconciles its in-memory sequence from these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RuleChange {
    Added { rule: RouteRule },
    Updated { rule: RouteRule },
    Removed { id: RuleId },
    Cleared,
}
