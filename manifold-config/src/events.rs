//! Configuration change events
//!
//! When the upstream map changes at runtime, the proxy reacts incrementally
//! rather than rebuilding the world. `diff` computes the change set between
//! two configurations and `plan_action` maps each change to the minimal
//! runtime action: a tags-only edit updates metadata without touching the
//! connection.

use serde::{Deserialize, Serialize};

use crate::upstream::{ProxyConfig, UpstreamConfig};

/// A single change to the upstream map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConfigChange {
    /// A new upstream appeared
    Added { name: String },

    /// An upstream was removed
    Removed { name: String },

    /// An existing upstream changed
    Modified {
        name: String,
        fields_changed: Vec<ChangedField>,
    },
}

impl ConfigChange {
    /// Name of the upstream this change concerns
    pub fn name(&self) -> &str {
        match self {
            Self::Added { name } | Self::Removed { name } | Self::Modified { name, .. } => name,
        }
    }
}

/// Which part of an upstream config changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangedField {
    Transport,
    Tags,
    Timeouts,
    Disabled,
}

/// Compute the change set between two configurations
pub fn diff(old: &ProxyConfig, new: &ProxyConfig) -> Vec<ConfigChange> {
    let mut changes = Vec::new();

    for (name, old_cfg) in &old.upstreams {
        match new.upstreams.get(name) {
            None => changes.push(ConfigChange::Removed { name: name.clone() }),
            Some(new_cfg) => {
                let fields = changed_fields(old_cfg, new_cfg);
                if !fields.is_empty() {
                    changes.push(ConfigChange::Modified {
                        name: name.clone(),
                        fields_changed: fields,
                    });
                }
            }
        }
    }

    for name in new.upstreams.keys() {
        if !old.upstreams.contains_key(name) {
            changes.push(ConfigChange::Added { name: name.clone() });
        }
    }

    changes
}

fn changed_fields(old: &UpstreamConfig, new: &UpstreamConfig) -> Vec<ChangedField> {
    let mut fields = Vec::new();
    if old.transport != new.transport {
        fields.push(ChangedField::Transport);
    }
    if old.tags != new.tags {
        fields.push(ChangedField::Tags);
    }
    if (old.timeout, old.connection_timeout, old.request_timeout)
        != (new.timeout, new.connection_timeout, new.request_timeout)
    {
        fields.push(ChangedField::Timeouts);
    }
    if old.disabled != new.disabled {
        fields.push(ChangedField::Disabled);
    }
    fields
}

/// Runtime action to take for a configuration change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    /// Start the upstream connection
    Start,

    /// Stop the upstream connection
    Stop,

    /// Stop then start with the new configuration
    Restart,

    /// Update tag metadata only; the connection is untouched
    UpdateMetadata,

    /// Nothing to do
    None,
}

/// Map a change to the minimal runtime action.
///
/// `new_config` is the upstream's configuration after the change (absent for
/// removals); `was_running` reflects whether the connection manager currently
/// holds a record for it.
pub fn plan_action(
    change: &ConfigChange,
    new_config: Option<&UpstreamConfig>,
    was_running: bool,
) -> ChangeAction {
    match change {
        ConfigChange::Added { .. } => match new_config {
            Some(cfg) if !cfg.disabled => ChangeAction::Start,
            _ => ChangeAction::None,
        },
        ConfigChange::Removed { .. } => {
            if was_running {
                ChangeAction::Stop
            } else {
                ChangeAction::None
            }
        }
        ConfigChange::Modified { fields_changed, .. } => {
            let disabled = new_config.map(|c| c.disabled).unwrap_or(false);
            if disabled {
                return if was_running {
                    ChangeAction::Stop
                } else {
                    ChangeAction::None
                };
            }
            if !was_running {
                return ChangeAction::Start;
            }
            if fields_changed == &[ChangedField::Tags] {
                return ChangeAction::UpdateMetadata;
            }
            ChangeAction::Restart
        }
    }
}
