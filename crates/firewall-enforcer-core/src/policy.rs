//! Desired-state policies and their validation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::rule::{sorted_by_name, Rule};

/// Longest rule name the cloud API accepts.
pub const MAX_RULE_NAME_LEN: usize = 63;

/// Which input of a comparison a rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSide {
    Current,
    Desired,
}

impl fmt::Display for RuleSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleSide::Current => f.write_str("current"),
            RuleSide::Desired => f.write_str("desired"),
        }
    }
}

/// Errors produced when a rule set is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("duplicate rule name '{name}' in {side} rules")]
    DuplicateRuleName { side: RuleSide, name: String },

    #[error("invalid rule name '{name}': must be 1-63 lowercase letters, digits or hyphens, starting with a letter")]
    InvalidRuleName { name: String },

    #[error("policy has no rules; refusing to remove every firewall rule")]
    EmptyPolicy,

    #[error("rule '{rule}' references unknown network '{network}'")]
    UnknownNetwork { rule: String, network: String },

    #[error("project has no networks to expand rule '{rule}' onto")]
    NoNetworks { rule: String },
}

fn rule_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z]([-a-z0-9]{0,61}[a-z0-9])?$").expect("rule name pattern is valid")
    })
}

/// `true` if `name` is accepted by the cloud API as a firewall rule name.
pub fn is_valid_rule_name(name: &str) -> bool {
    rule_name_pattern().is_match(name)
}

/// Index `rules` by name, rejecting duplicates.
pub fn index_by_name(rules: &[Rule], side: RuleSide) -> Result<BTreeMap<&str, &Rule>, PolicyError> {
    let mut index = BTreeMap::new();
    for rule in rules {
        if index.insert(rule.name.as_str(), rule).is_some() {
            return Err(PolicyError::DuplicateRuleName {
                side,
                name: rule.name.clone(),
            });
        }
    }
    Ok(index)
}

/// The desired firewall rules for one project.
///
/// Serialized as a bare JSON array of rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Policy {
    rules: Vec<Rule>,
}

impl Policy {
    pub fn new(rules: impl IntoIterator<Item = Rule>) -> Self {
        Self {
            rules: rules.into_iter().collect(),
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check names are unique and well-formed, and that the policy is not
    /// empty unless `allow_empty` is set.
    pub fn validate(&self, allow_empty: bool) -> Result<(), PolicyError> {
        if self.rules.is_empty() && !allow_empty {
            return Err(PolicyError::EmptyPolicy);
        }
        index_by_name(&self.rules, RuleSide::Desired)?;
        if let Some(bad) = self.rules.iter().find(|r| !is_valid_rule_name(&r.name)) {
            return Err(PolicyError::InvalidRuleName {
                name: bad.name.clone(),
            });
        }
        Ok(())
    }

    /// SHA-256 hex digest of the rules, sorted by name.
    ///
    /// Two policies with the same rules in a different order share a digest.
    pub fn digest(&self) -> String {
        let canonical = sorted_by_name(&self.rules);
        // Rule serialization cannot fail: every field is a string, set or scalar.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Attach network-less rules to every network of the project.
    ///
    /// A rule without a network is replaced by one copy per entry of
    /// `networks`, named `<rule>-<network>`. Rules that name a network must
    /// name one of `networks`.
    pub fn expand_to_networks(&self, networks: &[String]) -> Result<Policy, PolicyError> {
        let known: BTreeSet<&str> = networks.iter().map(String::as_str).collect();
        let mut expanded = Vec::with_capacity(self.rules.len() * networks.len().max(1));

        for rule in &self.rules {
            match &rule.network {
                Some(network) if known.contains(network.as_str()) => expanded.push(rule.clone()),
                Some(network) => {
                    return Err(PolicyError::UnknownNetwork {
                        rule: rule.name.clone(),
                        network: network.clone(),
                    })
                }
                None if known.is_empty() => {
                    return Err(PolicyError::NoNetworks {
                        rule: rule.name.clone(),
                    })
                }
                None => {
                    for network in &known {
                        let mut copy = rule.renamed(expanded_rule_name(&rule.name, network));
                        copy.network = Some((*network).to_string());
                        expanded.push(copy);
                    }
                }
            }
        }

        Ok(Policy { rules: expanded })
    }
}

impl FromIterator<Rule> for Policy {
    fn from_iter<T: IntoIterator<Item = Rule>>(iter: T) -> Self {
        Self::new(iter)
    }
}

/// Name of `rule` once attached to `network`.
///
/// Network identifiers may be full resource paths; only the last segment is
/// used. When the combined name is too long the network part is replaced by
/// a short digest of the full identifier.
pub fn expanded_rule_name(rule: &str, network: &str) -> String {
    let short = network.rsplit('/').next().unwrap_or(network);
    let candidate = format!("{rule}-{short}");
    if candidate.len() <= MAX_RULE_NAME_LEN {
        return candidate;
    }

    let tag = &hex::encode(Sha256::digest(network.as_bytes()))[..8];
    let keep = MAX_RULE_NAME_LEN - tag.len() - 1;
    let prefix: String = rule.chars().take(keep).collect();
    format!("{}-{tag}", prefix.trim_end_matches('-'))
}
