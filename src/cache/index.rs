//! Invalidation Index
//!
//! Tag membership and the dependency graph used for cascading invalidation.
//! The graph is not required to be acyclic: traversal keeps a visited set and
//! reports back edges as a diagnostic.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use regex::Regex;

use crate::error::{Error, Result};

// =============================================================================
// Key Patterns
// =============================================================================

/// Glob-style key pattern: `*` matches any run of characters, `?` exactly one
#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn new(glob: &str) -> Result<Self> {
        let mut source = String::with_capacity(glob.len() + 8);
        source.push('^');
        for ch in glob.chars() {
            match ch {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            }
        }
        source.push('$');

        let regex = Regex::new(&source)
            .map_err(|e| Error::Config(format!("invalid key pattern {:?}: {}", glob, e)))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// Pattern without wildcards
    pub fn is_literal(&self) -> bool {
        !self.glob.contains(['*', '?'])
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }
}

impl std::fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.glob)
    }
}

// =============================================================================
// Invalidation Index
// =============================================================================

#[derive(Debug, Default)]
struct IndexState {
    tag_keys: HashMap<String, BTreeSet<String>>,
    key_tags: HashMap<String, BTreeSet<String>>,
    /// parent -> keys invalidated with it
    dependents: HashMap<String, BTreeSet<String>>,
}

impl IndexState {
    fn detach_tags(&mut self, key: &str) {
        let Some(tags) = self.key_tags.remove(key) else {
            return;
        };
        for tag in tags {
            if let Some(keys) = self.tag_keys.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_keys.remove(&tag);
                }
            }
        }
    }
}

/// Result of a cascading traversal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeOutcome {
    /// Roots plus every key reachable from them
    pub keys: BTreeSet<String>,
    /// A back edge was seen during traversal
    pub cycle_detected: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

struct Frame<'a> {
    children: Vec<&'a str>,
    next: usize,
    node: &'a str,
}

fn children_of<'a>(graph: &'a HashMap<String, BTreeSet<String>>, node: &str) -> Vec<&'a str> {
    graph
        .get(node)
        .map(|c| c.iter().map(String::as_str).collect())
        .unwrap_or_default()
}

/// Tag and dependency index shared by all tiers
#[derive(Debug, Default)]
pub struct InvalidationIndex {
    state: RwLock<IndexState>,
}

impl InvalidationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key's tags, replacing any previous set
    pub fn record(&self, key: &str, tags: &BTreeSet<String>) {
        let mut state = self.state.write();
        state.detach_tags(key);
        if tags.is_empty() {
            return;
        }
        for tag in tags {
            state
                .tag_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        state.key_tags.insert(key.to_string(), tags.clone());
    }

    /// Drop a key from every tag set. Dependency edges are kept so they
    /// still apply if the key is stored again.
    pub fn forget(&self, key: &str) {
        self.state.write().detach_tags(key);
    }

    /// Union of the keys carrying any of `tags`
    pub fn keys_for_tags<S: AsRef<str>>(&self, tags: &[S]) -> BTreeSet<String> {
        let state = self.state.read();
        tags.iter()
            .filter_map(|t| state.tag_keys.get(t.as_ref()))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn tags_for(&self, key: &str) -> BTreeSet<String> {
        self.state
            .read()
            .key_tags
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Declare that invalidating `parent` also invalidates `dependent`
    pub fn add_dependency(&self, parent: &str, dependent: &str) {
        self.state
            .write()
            .dependents
            .entry(parent.to_string())
            .or_default()
            .insert(dependent.to_string());
    }

    pub fn remove_dependency(&self, parent: &str, dependent: &str) -> bool {
        let mut state = self.state.write();
        let Some(children) = state.dependents.get_mut(parent) else {
            return false;
        };
        let removed = children.remove(dependent);
        if children.is_empty() {
            state.dependents.remove(parent);
        }
        removed
    }

    pub fn dependents_of(&self, key: &str) -> BTreeSet<String> {
        self.state
            .read()
            .dependents
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of tags with at least one key
    pub fn tag_count(&self) -> usize {
        self.state.read().tag_keys.len()
    }

    /// Depth-first closure of `roots` over the dependency graph
    pub fn cascade<I, S>(&self, roots: I) -> CascadeOutcome
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let state = self.state.read();
        let graph = &state.dependents;

        let roots: Vec<String> = roots.into_iter().map(|r| r.as_ref().to_string()).collect();
        let mut visits: HashMap<&str, Visit> = HashMap::new();
        let mut cycle_detected = false;

        for root in &roots {
            if visits.contains_key(root.as_str()) {
                continue;
            }
            visits.insert(root.as_str(), Visit::InProgress);
            let mut stack = vec![Frame {
                children: children_of(graph, root),
                next: 0,
                node: root.as_str(),
            }];

            loop {
                let step = match stack.last_mut() {
                    None => break,
                    Some(frame) if frame.next < frame.children.len() => {
                        frame.next += 1;
                        Some(frame.children[frame.next - 1])
                    }
                    Some(_) => None,
                };

                match step {
                    Some(child) => match visits.get(child) {
                        None => {
                            visits.insert(child, Visit::InProgress);
                            stack.push(Frame {
                                children: children_of(graph, child),
                                next: 0,
                                node: child,
                            });
                        }
                        Some(Visit::InProgress) => cycle_detected = true,
                        Some(Visit::Done) => {}
                    },
                    None => {
                        if let Some(frame) = stack.pop() {
                            visits.insert(frame.node, Visit::Done);
                        }
                    }
                }
            }
        }

        CascadeOutcome {
            keys: visits.keys().map(|k| k.to_string()).collect(),
            cycle_detected,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
