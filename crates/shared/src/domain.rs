use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(RuleId);
id_newtype!(ProfileId);

/// Where traffic matched by a rule is sent. Persisted as a single `i64`
/// column: `0` proxy, `-1` direct, `-2` block, positive values are profile
/// ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundTarget {
    Proxy,
    Direct,
    Block,
    Profile(ProfileId),
}

impl OutboundTarget {
    pub fn as_i64(self) -> i64 {
        match self {
            OutboundTarget::Proxy => 0,
            OutboundTarget::Direct => -1,
            OutboundTarget::Block => -2,
            OutboundTarget::Profile(ProfileId(id)) => id,
        }
    }

    pub fn from_i64(raw: i64) -> OutboundTarget {
        match raw {
            0 => OutboundTarget::Proxy,
            -1 => OutboundTarget::Direct,
            -2 => OutboundTarget::Block,
            id => OutboundTarget::Profile(ProfileId(id)),
        }
    }

    pub fn label(self) -> String {
        match self {
            OutboundTarget::Proxy => "proxy".to_string(),
            OutboundTarget::Direct => "direct".to_string(),
            OutboundTarget::Block => "block".to_string(),
            OutboundTarget::Profile(ProfileId(id)) => format!("profile {id}"),
        }
    }
}

/// One routing rule row. `user_order` is the manual sort key: listings are
/// ordered by it ascending, and drag reordering permutes the keys across the
/// affected rows without renumbering the rest of the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    pub id: RuleId,
    pub name: String,
    pub user_order: i64,
    pub enabled: bool,
    pub domains: String,
    pub ip: String,
    pub port: String,
    pub network: String,
    pub source: String,
    pub protocol: String,
    pub outbound: OutboundTarget,
    pub created_at: DateTime<Utc>,
}

impl RouteRule {
    pub fn new(name: impl Into<String>) -> RouteRule {
        RouteRule {
            id: RuleId(0),
            name: name.into(),
            user_order: 0,
            enabled: true,
            domains: String::new(),
            ip: String::new(),
            port: String::new(),
            network: String::new(),
            source: String::new(),
            protocol: String::new(),
            outbound: OutboundTarget::Proxy,
            created_at: Utc::now(),
        }
    }

    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            format!("Rule #{}", self.id.0)
        } else {
            self.name.clone()
        }
    }

    /// Short description of what the rule matches and where it sends it,
    /// e.g. `domains example.com, network tcp -> direct`.
    pub fn summary(&self) -> String {
        let criteria: Vec<String> = [
            ("domains", &self.domains),
            ("ip", &self.ip),
            ("port", &self.port),
            ("network", &self.network),
            ("source", &self.source),
            ("protocol", &self.protocol),
        ]
        .iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .map(|(label, value)| format!("{label} {}", value.trim()))
        .collect();

        if criteria.is_empty() {
            format!("match all -> {}", self.outbound.label())
        } else {
            format!("{} -> {}", criteria.join(", "), self.outbound.label())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_round_trips_through_column_encoding() {
        for outbound in [
            OutboundTarget::Proxy,
            OutboundTarget::Direct,
            OutboundTarget::Block,
            OutboundTarget::Profile(ProfileId(42)),
        ] {
            assert_eq!(OutboundTarget::from_i64(outbound.as_i64()), outbound);
        }
    }

    #[test]
    fn display_name_falls_back_to_id() {
        let mut rule = RouteRule::new("bypass lan");
        rule.id = RuleId(7);
        assert_eq!(rule.display_name(), "bypass lan");

        rule.name = "  ".to_string();
        assert_eq!(rule.display_name(), "Rule #7");
    }

    #[test]
    fn summary_lists_populated_criteria_only() {
        let mut rule = RouteRule::new("cn direct");
        rule.domains = "geosite:cn".to_string();
        rule.network = "tcp".to_string();
        rule.outbound = OutboundTarget::Direct;
        assert_eq!(rule.summary(), "domains geosite:cn, network tcp -> direct");
    }

    #[test]
    fn summary_without_criteria_matches_all() {
        let rule = RouteRule::new("catch all");
        assert_eq!(rule.summary(), "match all -> proxy");
    }
}
