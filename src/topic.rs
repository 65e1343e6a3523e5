//! Topics and prefix filters.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reserved suffix addressing a store's authoritative channel.
pub const MASTER_SUFFIX: &str = "master";

/// Reserved suffix addressing a store's replica channel. Messages on a clone
/// channel are never forwarded by the transport.
pub const CLONE_SUFFIX: &str = "clone";

/// Prefix of the per-store change-event topics.
pub const STORE_EVENTS_PREFIX: &str = ".store_events";

/// A `/`-delimited topic name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends a path component: `Topic::new("foo").join("master")` is
    /// `foo/master`.
    pub fn join(&self, component: &str) -> Topic {
        Topic(format!("{}/{component}", self.0))
    }

    /// The authoritative channel of the named store.
    pub fn master_channel(name: &str) -> Topic {
        Topic(format!("{name}/{MASTER_SUFFIX}"))
    }

    /// The replica channel of the named store.
    pub fn clone_channel(name: &str) -> Topic {
        Topic(format!("{name}/{CLONE_SUFFIX}"))
    }

    /// The change-event topic of the named store.
    pub fn store_events(name: &str) -> Topic {
        Topic(format!("{STORE_EVENTS_PREFIX}/{name}"))
    }

    /// True iff the final `/`-separated component equals `suffix`.
    pub fn ends_with_component(&self, suffix: &str) -> bool {
        match self.0.rsplit_once('/') {
            Some((_, last)) => last == suffix,
            None => false,
        }
    }

    pub fn is_clone_channel(&self) -> bool {
        self.ends_with_component(CLONE_SUFFIX)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic::new(name)
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Topic::new(name)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A set of topic prefixes. A topic matches a filter iff some element of the
/// filter is a prefix of the topic aligned on `/` boundaries: `a/b` matches
/// both `a/b` and `a/b/c`, while `a` does not match `abc`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter(BTreeSet<Topic>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, topic: Topic) -> bool {
        self.0.insert(topic)
    }

    pub fn remove(&mut self, topic: &Topic) -> bool {
        self.0.remove(topic)
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.0.contains(topic)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Topic> {
        self.0.iter()
    }

    /// True iff any filter element is a `/`-aligned prefix of `topic`.
    pub fn matches(&self, topic: &Topic) -> bool {
        self.0.iter().any(|prefix| prefix_matches(prefix, topic))
    }

    /// The set union of two filters.
    pub fn union(&self, other: &Filter) -> Filter {
        Filter(self.0.union(&other.0).cloned().collect())
    }

    /// The elements of `self` not present in `other`.
    pub fn difference(&self, other: &Filter) -> Filter {
        Filter(self.0.difference(&other.0).cloned().collect())
    }

    /// Extends `self` with the elements of `other` in place.
    pub fn extend(&mut self, other: &Filter) {
        for topic in &other.0 {
            self.0.insert(topic.clone());
        }
    }
}

impl FromIterator<Topic> for Filter {
    fn from_iter<I: IntoIterator<Item = Topic>>(iter: I) -> Self {
        Filter(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[&str; N]> for Filter {
    fn from(topics: [&str; N]) -> Self {
        topics.iter().map(|t| Topic::new(*t)).collect()
    }
}

impl From<Topic> for Filter {
    fn from(topic: Topic) -> Self {
        std::iter::once(topic).collect()
    }
}

impl From<&str> for Filter {
    fn from(topic: &str) -> Self {
        Filter::from(Topic::new(topic))
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

fn prefix_matches(prefix: &Topic, topic: &Topic) -> bool {
    let prefix = prefix.as_str();
    let topic = topic.as_str();
    if !topic.starts_with(prefix) {
        return false;
    }
    topic.len() == prefix.len() || topic.as_bytes()[prefix.len()] == b'/'
}
