//! Rule set diffing.
//!
//! [`diff_rules`] classifies the rules of a project against a desired policy
//! into three disjoint sets keyed by rule name: rules to delete, rules to
//! insert and rules whose body must be updated.

use std::collections::btree_map::Values;
use std::collections::BTreeMap;

use crate::policy::{index_by_name, PolicyError, RuleSide};
use crate::rule::Rule;

/// Changes needed to turn a current rule set into a desired one.
///
/// Each rule name appears in at most one of the three sets. Iteration is
/// ordered by rule name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleDiff {
    to_delete: BTreeMap<String, Rule>,
    to_insert: BTreeMap<String, Rule>,
    to_update: BTreeMap<String, Rule>,
}

impl RuleDiff {
    /// Rules present remotely but absent from the policy (the current version).
    pub fn to_delete(&self) -> Values<'_, String, Rule> {
        self.to_delete.values()
    }

    /// Rules in the policy but absent remotely.
    pub fn to_insert(&self) -> Values<'_, String, Rule> {
        self.to_insert.values()
    }

    /// Rules present on both sides with different bodies (the desired version).
    pub fn to_update(&self) -> Values<'_, String, Rule> {
        self.to_update.values()
    }

    pub fn delete_count(&self) -> usize {
        self.to_delete.len()
    }

    pub fn insert_count(&self) -> usize {
        self.to_insert.len()
    }

    pub fn update_count(&self) -> usize {
        self.to_update.len()
    }

    /// Total number of mutations the diff calls for.
    pub fn len(&self) -> usize {
        self.to_delete.len() + self.to_insert.len() + self.to_update.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` if `name` is deleted, inserted or updated.
    pub fn touches(&self, name: &str) -> bool {
        self.to_delete.contains_key(name)
            || self.to_insert.contains_key(name)
            || self.to_update.contains_key(name)
    }

    /// The three sets as name-sorted vectors: `(to_delete, to_insert, to_update)`.
    pub fn to_sorted_vecs(&self) -> (Vec<Rule>, Vec<Rule>, Vec<Rule>) {
        (
            self.to_delete().cloned().collect(),
            self.to_insert().cloned().collect(),
            self.to_update().cloned().collect(),
        )
    }
}

/// Compare `current` against `desired`.
///
/// Both inputs must have unique rule names; a duplicate on either side is a
/// [`PolicyError::DuplicateRuleName`]. The result is empty iff both inputs
/// contain exactly the same rules.
pub fn diff_rules(current: &[Rule], desired: &[Rule]) -> Result<RuleDiff, PolicyError> {
    let current = index_by_name(current, RuleSide::Current)?;
    let desired = index_by_name(desired, RuleSide::Desired)?;

    let mut diff = RuleDiff::default();

    for (name, rule) in &current {
        match desired.get(name) {
            None => {
                diff.to_delete.insert((*name).to_string(), (*rule).clone());
            }
            Some(wanted) if !rule.same_body(wanted) => {
                diff.to_update.insert((*name).to_string(), (*wanted).clone());
            }
            Some(_) => {}
        }
    }

    for (name, rule) in &desired {
        if !current.contains_key(name) {
            diff.to_insert.insert((*name).to_string(), (*rule).clone());
        }
    }

    Ok(diff)
}
