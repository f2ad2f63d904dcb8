//! Firewall rule value type.
//!
//! A [`Rule`] is identified by its name within a project. Every other field is
//! part of the rule body. List-like attributes are stored as `BTreeSet`s so two
//! rules compare equal regardless of the order their ranges, tags or ports were
//! written in.

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};

/// Default priority assigned by the cloud provider when a rule omits one.
pub const DEFAULT_PRIORITY: u16 = 1000;

/// Traffic direction a rule applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Ingress,
    Egress,
}

/// Whether matching traffic is allowed or denied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[default]
    Allow,
    Deny,
}

/// A protocol plus an optional set of ports or port ranges (`"22"`, `"8000-8080"`).
///
/// An empty port set means every port of the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Permission {
    /// Always lowercase, whichever way the rule was built or loaded.
    #[serde(deserialize_with = "lowercase_protocol")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub ports: BTreeSet<String>,
}

impl Permission {
    pub fn new<I, S>(protocol: &str, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protocol: protocol.to_ascii_lowercase(),
            ports: ports.into_iter().map(Into::into).collect(),
        }
    }
}

fn lowercase_protocol<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(|p| p.to_ascii_lowercase())
}

/// A named firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    /// Network the rule is attached to. `None` in a policy means "every
    /// network of the project" when network expansion is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub action: Action,
    #[serde(default = "default_priority")]
    pub priority: u16,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub permissions: BTreeSet<Permission>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub source_ranges: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub destination_ranges: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub source_tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub target_tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

fn default_priority() -> u16 {
    DEFAULT_PRIORITY
}

impl Rule {
    /// An ingress allow rule with default priority and an empty body.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            network: None,
            direction: Direction::default(),
            action: Action::default(),
            priority: DEFAULT_PRIORITY,
            permissions: BTreeSet::new(),
            source_ranges: BTreeSet::new(),
            destination_ranges: BTreeSet::new(),
            source_tags: BTreeSet::new(),
            target_tags: BTreeSet::new(),
            description: None,
            disabled: false,
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    /// Switch the rule to `action` and add a permission for `protocol`.
    pub fn permit<I, S>(mut self, action: Action, protocol: &str, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.action = action;
        self.permissions.insert(Permission::new(protocol, ports));
        self
    }

    pub fn allow<I, S>(self, protocol: &str, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permit(Action::Allow, protocol, ports)
    }

    pub fn deny<I, S>(self, protocol: &str, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permit(Action::Deny, protocol, ports)
    }

    pub fn with_source_ranges<I, S>(mut self, ranges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_ranges.extend(ranges.into_iter().map(Into::into));
        self
    }

    pub fn with_destination_ranges<I, S>(mut self, ranges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.destination_ranges
            .extend(ranges.into_iter().map(Into::into));
        self
    }

    pub fn with_source_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_target_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// A copy of this rule under a different name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// `true` when every field except the name matches.
    pub fn same_body(&self, other: &Rule) -> bool {
        self.network == other.network
            && self.direction == other.direction
            && self.action == other.action
            && self.priority == other.priority
            && self.permissions == other.permissions
            && self.source_ranges == other.source_ranges
            && self.destination_ranges == other.destination_ranges
            && self.source_tags == other.source_tags
            && self.target_tags == other.target_tags
            && self.description == other.description
            && self.disabled == other.disabled
    }
}

/// Clone `rules` and sort them by name.
pub fn sorted_by_name<'a>(rules: impl IntoIterator<Item = &'a Rule>) -> Vec<Rule> {
    let mut out: Vec<Rule> = rules.into_iter().cloned().collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_comparison_ignores_attribute_order() {
        let a = Rule::new("allow-web")
            .allow("tcp", ["443", "80"])
            .with_source_ranges(["10.0.0.0/8", "192.168.0.0/16"]);
        let b = Rule::new("allow-web")
            .allow("TCP", ["80", "443"])
            .with_source_ranges(["192.168.0.0/16", "10.0.0.0/8"]);
        assert_eq!(a, b);
        assert!(a.same_body(&b));
    }

    #[test]
    fn loaded_protocol_matches_built_protocol() {
        let loaded: Rule = serde_json::from_str(
            r#"{"name": "allow-web", "permissions": [{"protocol": "TCP", "ports": ["443"]}]}"#,
        )
        .unwrap();
        let built = Rule::new("allow-web").allow("TCP", ["443"]);
        assert_eq!(loaded.permissions.iter().next().unwrap().protocol, "tcp");
        assert_eq!(loaded, built);
        assert!(crate::diff::diff_rules(&[loaded], &[built]).unwrap().is_empty());
    }

    #[test]
    fn renamed_rule_keeps_body() {
        let a = Rule::new("allow-ssh").allow("tcp", ["22"]).with_network("default");
        let b = a.renamed("allow-ssh-copy");
        assert_ne!(a, b);
        assert!(a.same_body(&b));
    }

    #[test]
    fn deserialize_applies_defaults() {
        let rule: Rule = serde_json::from_str(
            r#"{"name": "allow-icmp", "permissions": [{"protocol": "icmp"}]}"#,
        )
        .unwrap();
        assert_eq!(rule.priority, DEFAULT_PRIORITY);
        assert_eq!(rule.direction, Direction::Ingress);
        assert_eq!(rule.action, Action::Allow);
        assert!(rule.network.is_none());
        assert!(!rule.disabled);
    }

    #[test]
    fn serialize_skips_empty_fields() {
        let v = serde_json::to_value(Rule::new("bare")).unwrap();
        let obj = v.as_object().unwrap();
        assert!(!obj.contains_key("source_ranges"));
        assert!(!obj.contains_key("disabled"));
        assert_eq!(obj["direction"], "ingress");
        assert_eq!(obj["action"], "allow");
    }

    #[test]
    fn sorted_by_name_orders_rules() {
        let rules = vec![Rule::new("c"), Rule::new("a"), Rule::new("b")];
        let names: Vec<String> = sorted_by_name(&rules).into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
