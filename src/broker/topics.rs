//! Topic registry
//!
//! Pure bookkeeping of which topics are wanted, by whom and why. The registry
//! never talks to the broker itself; the Connection Manager reads and mutates
//! it around its wire calls.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// Logical reason a topic subscription exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    /// Registered by a trigger flow card
    Trigger,
    /// Registered by a condition flow card
    Condition,
    /// Registered through the API, removable by the caller
    Api,
    /// Registered through the API and declared non-removable
    ApiPermanent,
}

impl Purpose {
    /// Protected purposes refuse removal through `unsubscribe`
    pub fn is_protected(&self) -> bool {
        matches!(self, Purpose::Trigger | Purpose::ApiPermanent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Trigger => "trigger",
            Purpose::Condition => "condition",
            Purpose::Api => "api",
            Purpose::ApiPermanent => "api_permanent",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the internal consumer holding a reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerRef(String);

impl CallerRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallerRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One logical reference `{purpose, caller}` on a topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicReference {
    pub purpose: Purpose,
    pub caller: CallerRef,
}

impl TopicReference {
    pub fn new(purpose: Purpose, caller: impl Into<CallerRef>) -> Self {
        Self {
            purpose,
            caller: caller.into(),
        }
    }
}

/// A topic known to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    name: String,
    registered: bool,
    pending: bool,
    /// Broker acknowledged a subscribe at least once; survives reconnects
    acknowledged: bool,
    references: HashSet<TopicReference>,
}

impl Topic {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            registered: false,
            pending: false,
            acknowledged: false,
            references: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the broker acknowledged the subscribe
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// True if any connection ever had this topic acknowledged
    pub fn was_acknowledged(&self) -> bool {
        self.acknowledged
    }

    /// True while a wire subscribe is in flight
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Registered or about to be: no further wire subscribe is needed
    pub fn is_active(&self) -> bool {
        self.registered || self.pending
    }

    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    pub fn references(&self) -> impl Iterator<Item = &TopicReference> {
        self.references.iter()
    }

    /// References in a stable order, for display
    pub fn sorted_references(&self) -> Vec<TopicReference> {
        let mut refs: Vec<TopicReference> = self.references.iter().cloned().collect();
        refs.sort();
        refs
    }

    pub fn has_purpose(&self, purpose: Purpose) -> bool {
        self.references.iter().any(|r| r.purpose == purpose)
    }
}

/// Result of removing a reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// Topic or reference unknown; nothing changed
    NotFound,
    /// Reference removed, others remain
    Remaining(usize),
    /// Last reference removed; the entry is gone from the registry
    Emptied(Topic),
}

/// Mapping topic name -> [`Topic`], at most one entry per name
#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: HashMap<String, Topic>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reference, creating the topic entry if needed.
    /// Returns true when the reference was not present before.
    pub fn add_reference(&mut self, topic: &str, reference: TopicReference) -> bool {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic))
            .references
            .insert(reference)
    }

    /// Remove a reference. Removing an unknown reference is a no-op.
    pub fn remove_reference(&mut self, topic: &str, reference: &TopicReference) -> RemoveOutcome {
        let Some(entry) = self.topics.get_mut(topic) else {
            return RemoveOutcome::NotFound;
        };
        if !entry.references.remove(reference) {
            return RemoveOutcome::NotFound;
        }
        if entry.references.is_empty() {
            match self.topics.remove(topic) {
                Some(removed) => RemoveOutcome::Emptied(removed),
                None => RemoveOutcome::NotFound,
            }
        } else {
            RemoveOutcome::Remaining(entry.references.len())
        }
    }

    /// Remove every reference `caller` holds on `topic`, whatever the purpose
    pub fn remove_caller(&mut self, topic: &str, caller: &CallerRef) -> RemoveOutcome {
        let Some(entry) = self.topics.get_mut(topic) else {
            return RemoveOutcome::NotFound;
        };
        let before = entry.references.len();
        entry.references.retain(|r| &r.caller != caller);
        if entry.references.len() == before {
            return RemoveOutcome::NotFound;
        }
        if entry.references.is_empty() {
            match self.topics.remove(topic) {
                Some(removed) => RemoveOutcome::Emptied(removed),
                None => RemoveOutcome::NotFound,
            }
        } else {
            RemoveOutcome::Remaining(entry.references.len())
        }
    }

    pub fn get(&self, topic: &str) -> Option<&Topic> {
        self.topics.get(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Every distinct topic name, sorted
    pub fn all_topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_reference(&self, topic: &str, purpose: Purpose) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|t| t.has_purpose(purpose))
    }

    /// References held by `caller` on `topic`
    pub fn references_of(&self, topic: &str, caller: &CallerRef) -> Vec<TopicReference> {
        self.topics
            .get(topic)
            .map(|t| {
                t.references
                    .iter()
                    .filter(|r| &r.caller == caller)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Distinct topic names on which `caller` holds any reference
    pub fn topics_for_caller(&self, caller: &CallerRef) -> BTreeSet<String> {
        self.topics
            .values()
            .filter(|t| t.references.iter().any(|r| &r.caller == caller))
            .map(|t| t.name.clone())
            .collect()
    }

    /// Mark a wire subscribe as in flight
    pub fn mark_pending(&mut self, topic: &str) {
        if let Some(entry) = self.topics.get_mut(topic) {
            entry.pending = true;
        }
    }

    /// Record the broker's acknowledgement. Returns false for unknown topics.
    pub fn mark_registered(&mut self, topic: &str) -> bool {
        match self.topics.get_mut(topic) {
            Some(entry) => {
                entry.pending = false;
                entry.registered = true;
                entry.acknowledged = true;
                true
            }
            None => false,
        }
    }

    /// Clear the in-flight flag after a failed subscribe
    pub fn clear_pending(&mut self, topic: &str) {
        if let Some(entry) = self.topics.get_mut(topic) {
            entry.pending = false;
        }
    }

    /// Forget per-connection wire state for every topic, keeping references
    /// and the acknowledged history
    pub fn reset_wire_state(&mut self) {
        for entry in self.topics.values_mut() {
            entry.registered = false;
            entry.pending = false;
        }
    }

    /// Drop a topic entry entirely
    pub fn remove(&mut self, topic: &str) -> Option<Topic> {
        self.topics.remove(topic)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Topics in name order
    pub fn iter_sorted(&self) -> Vec<&Topic> {
        let mut topics: Vec<&Topic> = self.topics.values().collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn api(caller: &str) -> TopicReference {
        TopicReference::new(Purpose::Api, caller)
    }

    fn trigger(caller: &str) -> TopicReference {
        TopicReference::new(Purpose::Trigger, caller)
    }

    #[test]
    fn test_add_creates_single_entry() {
        let mut registry = TopicRegistry::new();
        assert!(registry.add_reference("a/b", api("ref1")));
        assert!(registry.add_reference("a/b", trigger("ref2")));
        assert!(!registry.add_reference("a/b", api("ref1")));

        assert_eq!(registry.len(), 1);
        let topic = registry.get("a/b").unwrap();
        assert_eq!(topic.reference_count(), 2);
        assert!(!topic.is_registered());
    }

    #[test]
    fn test_remove_reference_outcomes() {
        let mut registry = TopicRegistry::new();
        registry.add_reference("a/b", api("ref1"));
        registry.add_reference("a/b", trigger("ref2"));
        registry.mark_registered("a/b");

        assert_eq!(
            registry.remove_reference("a/b", &api("ref1")),
            RemoveOutcome::Remaining(1)
        );
        assert!(registry.get("a/b").unwrap().is_registered());

        match registry.remove_reference("a/b", &trigger("ref2")) {
            RemoveOutcome::Emptied(topic) => {
                assert_eq!(topic.name(), "a/b");
                assert!(topic.is_registered());
            }
            other => panic!("Expected Emptied, got {other:?}"),
        }
        assert!(!registry.contains("a/b"));
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut registry = TopicRegistry::new();
        assert_eq!(
            registry.remove_reference("nope", &api("x")),
            RemoveOutcome::NotFound
        );

        registry.add_reference("a/b", api("ref1"));
        assert_eq!(
            registry.remove_reference("a/b", &api("other")),
            RemoveOutcome::NotFound
        );
        assert_eq!(
            registry.remove_reference("a/b", &trigger("ref1")),
            RemoveOutcome::NotFound
        );
        assert_eq!(registry.get("a/b").unwrap().reference_count(), 1);
    }

    #[test]
    fn test_has_reference_by_purpose() {
        let mut registry = TopicRegistry::new();
        registry.add_reference("a/b", api("ref1"));
        assert!(registry.has_reference("a/b", Purpose::Api));
        assert!(!registry.has_reference("a/b", Purpose::Trigger));
        assert!(!registry.has_reference("x/y", Purpose::Api));
    }

    #[test]
    fn test_all_topic_names_distinct_and_sorted() {
        let mut registry = TopicRegistry::new();
        registry.add_reference("z", api("1"));
        registry.add_reference("a", api("1"));
        registry.add_reference("a", trigger("2"));
        assert_eq!(registry.all_topic_names(), vec!["a", "z"]);
    }

    #[test]
    fn test_topics_for_caller_and_remove_caller() {
        let mut registry = TopicRegistry::new();
        registry.add_reference("a", api("flow"));
        registry.add_reference("a", trigger("flow"));
        registry.add_reference("b", trigger("flow"));
        registry.add_reference("b", api("other"));

        let topics = registry.topics_for_caller(&CallerRef::new("flow"));
        assert_eq!(topics.len(), 2);

        assert!(matches!(
            registry.remove_caller("a", &CallerRef::new("flow")),
            RemoveOutcome::Emptied(_)
        ));
        assert_eq!(
            registry.remove_caller("b", &CallerRef::new("flow")),
            RemoveOutcome::Remaining(1)
        );
        assert_eq!(
            registry.remove_caller("b", &CallerRef::new("flow")),
            RemoveOutcome::NotFound
        );
    }

    #[test]
    fn test_wire_flags() {
        let mut registry = TopicRegistry::new();
        registry.add_reference("a", api("1"));
        registry.mark_pending("a");
        assert!(registry.get("a").unwrap().is_pending());
        assert!(registry.get("a").unwrap().is_active());

        assert!(registry.mark_registered("a"));
        let topic = registry.get("a").unwrap();
        assert!(topic.is_registered());
        assert!(!topic.is_pending());

        registry.reset_wire_state();
        let topic = registry.get("a").unwrap();
        assert!(!topic.is_active());
        assert!(topic.was_acknowledged());
        assert!(!registry.mark_registered("unknown"));
    }

    #[test]
    fn test_protected_purposes() {
        assert!(Purpose::Trigger.is_protected());
        assert!(Purpose::ApiPermanent.is_protected());
        assert!(!Purpose::Api.is_protected());
        assert!(!Purpose::Condition.is_protected());
    }

    #[test]
    fn test_purpose_serialization() {
        let json = serde_json::to_string(&Purpose::ApiPermanent).unwrap();
        assert_eq!(json, "\"api_permanent\"");
        let parsed: Purpose = serde_json::from_str("\"trigger\"").unwrap();
        assert_eq!(parsed, Purpose::Trigger);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, u8, u8),
        Remove(u8, u8, u8),
    }

    fn purpose_of(n: u8) -> Purpose {
        match n % 4 {
            0 => Purpose::Trigger,
            1 => Purpose::Condition,
            2 => Purpose::Api,
            _ => Purpose::ApiPermanent,
        }
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, 0u8..4, 0u8..3).prop_map(|(t, p, c)| Op::Add(t, p, c)),
            (0u8..4, 0u8..4, 0u8..3).prop_map(|(t, p, c)| Op::Remove(t, p, c)),
        ]
    }

    proptest! {
        #[test]
        fn registry_entries_exist_iff_referenced(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let mut registry = TopicRegistry::new();
            let mut model: HashMap<String, HashSet<TopicReference>> = HashMap::new();

            for op in ops {
                match op {
                    Op::Add(t, p, c) => {
                        let topic = format!("t/{t}");
                        let reference = TopicReference::new(purpose_of(p), format!("c{c}").as_str());
                        registry.add_reference(&topic, reference.clone());
                        model.entry(topic).or_default().insert(reference);
                    }
                    Op::Remove(t, p, c) => {
                        let topic = format!("t/{t}");
                        let reference = TopicReference::new(purpose_of(p), format!("c{c}").as_str());
                        registry.remove_reference(&topic, &reference);
                        if let Some(set) = model.get_mut(&topic) {
                            set.remove(&reference);
                            if set.is_empty() {
                                model.remove(&topic);
                            }
                        }
                    }
                }
            }

            prop_assert_eq!(registry.len(), model.len());
            for (name, refs) in &model {
                let topic = registry.get(name);
                prop_assert!(topic.is_some());
                prop_assert_eq!(topic.unwrap().reference_count(), refs.len());
            }
        }
    }
}
