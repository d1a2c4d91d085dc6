//! Requirement sets for conflict detection.
//!
//! Every [`Command`](crate::command::Command) declares the set of
//! [`Mechanism`]s it needs exclusive access to. The scheduler compares
//! *footprints* (requirements expanded through nested mechanisms) to decide
//! whether two commands can run at the same time.
//!
//! # Conflict Rules
//!
//! - Disjoint footprints: OK (both may run)
//! - Any shared mechanism, direct or nested: CONFLICT
//! - Empty requirements never conflict with anything

use indexmap::IndexSet;

use crate::mechanism::Mechanism;

/// An ordered set of mechanisms a command requires.
///
/// Insertion order is preserved so that diagnostics and snapshots list
/// mechanisms the way the command declared them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    set: IndexSet<Mechanism>,
}

impl Requirements {
    /// Creates an empty requirement set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mechanism. Returns `false` if it was already present.
    pub fn add(&mut self, mechanism: Mechanism) -> bool {
        self.set.insert(mechanism)
    }

    /// Builder-style variant of [`add`](Self::add).
    #[must_use]
    pub fn with(mut self, mechanism: Mechanism) -> Self {
        self.add(mechanism);
        self
    }

    /// Returns `true` if the mechanism is directly listed in this set.
    ///
    /// Nested mechanisms are not consulted; use [`footprint`](Self::footprint)
    /// first for transitive membership.
    #[must_use]
    pub fn contains(&self, mechanism: &Mechanism) -> bool {
        self.set.contains(mechanism)
    }

    /// Returns the number of mechanisms in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Returns `true` if the set holds no mechanisms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Iterates the mechanisms in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Mechanism> {
        self.set.iter()
    }

    /// Expands the set through nested mechanisms, transitively.
    ///
    /// Each mechanism appears once, even when reachable along several paths.
    #[must_use]
    pub fn footprint(&self) -> Requirements {
        let mut expanded = IndexSet::with_capacity(self.set.len());
        let mut stack: Vec<&Mechanism> = self.set.iter().rev().collect();

        while let Some(mechanism) = stack.pop() {
            if expanded.insert(mechanism.clone()) {
                stack.extend(mechanism.nested_mechanisms().iter().rev());
            }
        }

        Requirements { set: expanded }
    }

    /// Checks whether two requirement sets contend for any mechanism.
    ///
    /// Both sides are expanded through nested mechanisms before comparing.
    #[must_use]
    pub fn conflicts_with(&self, other: &Requirements) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let theirs = other.footprint();
        self.footprint().iter().any(|m| theirs.contains(m))
    }

    /// Returns every mechanism both sets contend for.
    ///
    /// Useful for generating detailed error messages.
    #[must_use]
    pub fn find_conflicts(&self, other: &Requirements) -> Vec<Mechanism> {
        let theirs = other.footprint();
        self.footprint()
            .iter()
            .filter(|m| theirs.contains(m))
            .cloned()
            .collect()
    }
}

impl FromIterator<Mechanism> for Requirements {
    fn from_iter<I: IntoIterator<Item = Mechanism>>(iter: I) -> Self {
        Self {
            set: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Requirements {
    type Item = &'a Mechanism;
    type IntoIter = indexmap::set::Iter<'a, Mechanism>;

    fn into_iter(self) -> Self::IntoIter {
        self.set.iter()
    }
}
