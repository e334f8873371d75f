//! Observed-remove set without tombstones (ORSWOT).
//!
//! Every insertion gets a unique [`Tag`] (replica, clock); removal names the
//! observed tags. Under concurrent add and remove of the same element the
//! add wins, because the remove can only name tags it has seen. Deltas carry
//! additions, removed tags and the causal context, and merging is
//! commutative, associative and idempotent.

use super::{Clock, Replica};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;

/// Unique tag for each inserted element: the inserting replica and its
/// logical clock at insertion time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    /// The replica that created the entry.
    pub replica: Replica,
    /// The replica's logical clock at creation.
    pub clock: Clock,
}

impl Tag {
    /// Create a new tag.
    pub fn new(replica: impl Into<Replica>, clock: Clock) -> Self {
        Self {
            replica: replica.into(),
            clock,
        }
    }
}

/// Incremental changes since the last delta flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDelta<T> {
    /// Elements added, with their tags.
    pub adds: Vec<(T, Tag)>,
    /// Tags of elements removed.
    pub removed_tags: Vec<Tag>,
    /// Causal context at the time of the delta.
    pub context: HashMap<Replica, Clock>,
}

impl<T> Default for SetDelta<T> {
    fn default() -> Self {
        Self {
            adds: Vec::new(),
            removed_tags: Vec::new(),
            context: HashMap::new(),
        }
    }
}

impl<T> SetDelta<T> {
    /// Whether the delta carries no changes.
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.removed_tags.is_empty()
    }
}

/// Effect of merging a remote delta.
#[derive(Debug)]
pub struct MergeOutcome<T> {
    /// Elements that became visible.
    pub added: Vec<T>,
    /// Elements that disappeared.
    pub removed: Vec<T>,
}

impl<T> Default for MergeOutcome<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl<T> MergeOutcome<T> {
    /// Whether the merge changed anything.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// An observed-remove set replica.
pub struct OrSet<T> {
    replica: Replica,
    clock: Clock,
    context: HashMap<Replica, Clock>,
    entries: HashMap<T, Vec<Tag>>,
    delta: SetDelta<T>,
}

impl<T> OrSet<T>
where
    T: Clone + Eq + Hash,
{
    /// Create an empty replica.
    pub fn new(replica: impl Into<Replica>) -> Self {
        let replica = replica.into();
        Self {
            replica: replica.clone(),
            clock: 0,
            context: HashMap::from([(replica, 0)]),
            entries: HashMap::new(),
            delta: SetDelta::default(),
        }
    }

    /// Our replica name.
    pub fn replica(&self) -> &str {
        &self.replica
    }

    /// The causal context: the highest clock seen from each replica.
    pub fn context(&self) -> &HashMap<Replica, Clock> {
        &self.context
    }

    /// Insert an element, returning the tag assigned to it.
    ///
    /// Inserting an element that is already present adds another tag for it;
    /// the element stays a single member of the set.
    pub fn insert(&mut self, value: T) -> Tag {
        self.clock += 1;
        let tag = Tag::new(self.replica.clone(), self.clock);
        self.context.insert(self.replica.clone(), self.clock);

        self.entries
            .entry(value.clone())
            .or_default()
            .push(tag.clone());

        self.delta.adds.push((value, tag.clone()));
        self.delta.context = self.context.clone();
        tag
    }

    /// Remove an element by naming all of its observed tags.
    ///
    /// Returns the removed tags; empty when the element was not present.
    pub fn remove(&mut self, value: &T) -> Vec<Tag> {
        let removed = self.entries.remove(value).unwrap_or_default();
        if !removed.is_empty() {
            self.delta.removed_tags.extend(removed.iter().cloned());
            self.delta.context = self.context.clone();
        }
        removed
    }

    /// Remove every element matching the predicate, returning them.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let victims: Vec<T> = self
            .entries
            .keys()
            .filter(|v| pred(v))
            .cloned()
            .collect();
        for value in &victims {
            self.remove(value);
        }
        victims
    }

    /// Whether the element is currently a member.
    pub fn contains(&self, value: &T) -> bool {
        self.entries.contains_key(value)
    }

    /// Snapshot of the current members.
    pub fn elements(&self) -> Vec<T> {
        self.entries.keys().cloned().collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set has no members.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge a remote delta into this replica.
    ///
    /// Removals are applied first, by tag. Additions are admitted unless the
    /// tag is dominated by the context we held *before* this merge started;
    /// updating the context mid-merge would wrongly reject adds that arrive
    /// out of clock order within one delta.
    pub fn merge(&mut self, remote: &SetDelta<T>) -> MergeOutcome<T> {
        let mut outcome = MergeOutcome::default();
        let original_context = self.context.clone();

        for tag in &remote.removed_tags {
            let mut emptied = Vec::new();
            for (value, tags) in self.entries.iter_mut() {
                if tags.iter().any(|t| t == tag) {
                    tags.retain(|t| t != tag);
                    if tags.is_empty() {
                        emptied.push(value.clone());
                    }
                }
            }
            for value in emptied {
                self.entries.remove(&value);
                outcome.removed.push(value);
            }
        }

        for (value, tag) in &remote.adds {
            let dominated = original_context
                .get(&tag.replica)
                .map(|&clock| tag.clock <= clock)
                .unwrap_or(false);
            if dominated {
                continue;
            }
            let tags = self.entries.entry(value.clone()).or_default();
            if !tags.iter().any(|t| t == tag) {
                let was_absent = tags.is_empty();
                tags.push(tag.clone());
                if was_absent {
                    outcome.added.push(value.clone());
                }
            }
        }

        for (replica, &clock) in &remote.context {
            let ours = self.context.get(replica).copied().unwrap_or(0);
            if clock > ours {
                self.context.insert(replica.clone(), clock);
            }
        }

        outcome
    }

    /// Extract the additions a remote replica with the given context has not
    /// observed yet. Used by anti-entropy sync responses.
    pub fn extract(&self, remote_context: &HashMap<Replica, Clock>) -> SetDelta<T> {
        let mut delta = SetDelta::default();
        for (value, tags) in &self.entries {
            for tag in tags {
                let seen = remote_context.get(&tag.replica).copied().unwrap_or(0);
                if tag.clock > seen {
                    delta.adds.push((value.clone(), tag.clone()));
                }
            }
        }
        delta.context = self.context.clone();
        delta
    }

    /// Extract the full state as a delta.
    pub fn extract_all(&self) -> SetDelta<T> {
        let mut delta = SetDelta::default();
        for (value, tags) in &self.entries {
            for tag in tags {
                delta.adds.push((value.clone(), tag.clone()));
            }
        }
        delta.context = self.context.clone();
        delta
    }

    /// Take the pending delta, leaving an empty one behind.
    pub fn take_delta(&mut self) -> Option<SetDelta<T>> {
        if self.delta.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.delta))
        }
    }

    /// Whether there are unflushed local changes.
    pub fn has_delta(&self) -> bool {
        !self.delta.is_empty()
    }
}
