//! Server capability sets and merge semantics
//!
//! A capability set has four category maps (`resources`, `tools`, `prompts`,
//! `experimental`) plus a scalar `logging` flag. Merging two sets is the
//! heart of aggregation: notification keys (`listChanged`, `subscribe`) OR
//! together when both sides are booleans, everything else is last-writer-wins
//! with structural conflicts reported to the caller.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Reserved per-category keys with OR merge semantics
pub const NOTIFICATION_KEYS: &[&str] = &["listChanged", "subscribe"];

/// Capability categories subject to map merging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Resources,
    Tools,
    Prompts,
    Experimental,
}

impl Category {
    /// All categories in wire order
    pub const ALL: [Category; 4] = [
        Category::Resources,
        Category::Tools,
        Category::Prompts,
        Category::Experimental,
    ];

    /// Whether notification-key conflicts in this category are worth
    /// reporting. Notification flags are legitimately independent across
    /// upstreams for the three standard categories.
    fn reports_notification_conflicts(&self) -> bool {
        matches!(self, Category::Resources | Category::Tools | Category::Prompts)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Resources => "resources",
            Category::Tools => "tools",
            Category::Prompts => "prompts",
            Category::Experimental => "experimental",
        };
        f.write_str(name)
    }
}

/// A server capability set as exchanged in the MCP handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Map<String, Value>>,

    /// Scalar logging capability; merged last-writer-wins with no conflict
    /// detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
}

impl CapabilitySet {
    /// Parse a capability set from a raw handshake value; `null` reads as
    /// the empty set
    pub fn from_value(value: Value) -> Self {
        if value.is_null() {
            return Self::default();
        }
        serde_json::from_value(value).unwrap_or_default()
    }

    /// Whether no capability is advertised at all
    pub fn is_empty(&self) -> bool {
        self.resources.is_none()
            && self.tools.is_none()
            && self.prompts.is_none()
            && self.experimental.is_none()
            && self.logging.is_none()
    }

    fn category(&self, category: Category) -> &Option<Map<String, Value>> {
        match category {
            Category::Resources => &self.resources,
            Category::Tools => &self.tools,
            Category::Prompts => &self.prompts,
            Category::Experimental => &self.experimental,
        }
    }

    fn category_mut(&mut self, category: Category) -> &mut Option<Map<String, Value>> {
        match category {
            Category::Resources => &mut self.resources,
            Category::Tools => &mut self.tools,
            Category::Prompts => &mut self.prompts,
            Category::Experimental => &mut self.experimental,
        }
    }

    /// Merge another capability set into this one, returning the conflicts
    /// observed. The result depends only on the order of `merge_from` calls,
    /// so aggregation over an ordered upstream sequence is deterministic.
    pub fn merge_from(&mut self, incoming: &CapabilitySet) -> Vec<CapabilityConflict> {
        let mut conflicts = Vec::new();

        for category in Category::ALL {
            let incoming_map = match incoming.category(category) {
                Some(map) => map,
                None => continue,
            };
            let existing = self.category_mut(category);
            match existing {
                None => {
                    *existing = Some(incoming_map.clone());
                }
                Some(existing_map) => {
                    merge_category(category, existing_map, incoming_map, &mut conflicts);
                }
            }
        }

        if incoming.logging.is_some() {
            self.logging = incoming.logging.clone();
        }

        conflicts
    }
}

/// A divergence observed while merging one upstream's capabilities
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityConflict {
    pub category: Category,
    pub key: String,
    pub previous: Value,
    pub incoming: Value,
}

fn merge_category(
    category: Category,
    existing: &mut Map<String, Value>,
    incoming: &Map<String, Value>,
    conflicts: &mut Vec<CapabilityConflict>,
) {
    for (key, incoming_value) in incoming {
        let previous = existing.get(key).cloned();

        if NOTIFICATION_KEYS.contains(&key.as_str()) {
            match (&previous, incoming_value) {
                (Some(Value::Bool(a)), Value::Bool(b)) => {
                    // Both boolean: true if either upstream supports it.
                    existing.insert(key.clone(), Value::Bool(*a || *b));
                }
                _ => {
                    if let Some(prev) = previous {
                        if &prev != incoming_value && category.reports_notification_conflicts() {
                            conflicts.push(CapabilityConflict {
                                category,
                                key: key.clone(),
                                previous: prev,
                                incoming: incoming_value.clone(),
                            });
                        }
                    }
                    existing.insert(key.clone(), incoming_value.clone());
                }
            }
            continue;
        }

        if let Some(prev) = previous {
            if prev != *incoming_value {
                conflicts.push(CapabilityConflict {
                    category,
                    key: key.clone(),
                    previous: prev,
                    incoming: incoming_value.clone(),
                });
            }
        }
        existing.insert(key.clone(), incoming_value.clone());
    }
}
