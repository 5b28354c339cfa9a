//! Capability aggregation across upstreams
//!
//! Walks the connection manager's records in their stable iteration order,
//! records each upstream's advertised capabilities, and folds them into the
//! single set this proxy advertises downstream. Divergent values are
//! reported per key at WARN and summarised per upstream/category at INFO;
//! a failing upstream never blocks the others.

use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::protocol::{CapabilityConflict, CapabilitySet};
use crate::upstream::{UpstreamManager, UpstreamStatus};

/// Result of one aggregation pass
#[derive(Debug, Default)]
pub struct AggregatedCapabilities {
    /// The merged capability set advertised to downstream clients
    pub capabilities: CapabilitySet,

    /// Conflicts observed, tagged with the upstream that introduced them
    pub conflicts: Vec<(String, CapabilityConflict)>,

    /// Instruction text per upstream, in aggregation order, verbatim
    pub instructions: Vec<(String, String)>,
}

/// Builds the merged capability view advertised to clients
pub struct CapabilityAggregator;

impl CapabilityAggregator {
    /// Aggregate capabilities over every connected upstream.
    ///
    /// The output is a function only of the ordered sequence of upstream
    /// capability sets; the manager iterates records in name order, so
    /// repeated runs over the same connections agree.
    pub async fn aggregate(manager: &UpstreamManager) -> AggregatedCapabilities {
        let mut result = AggregatedCapabilities::default();

        for record in manager.all().await {
            let name = record.name().to_string();
            if record.status().await != UpstreamStatus::Connected {
                debug!(upstream = %name, "skipping capability aggregation, not connected");
                continue;
            }
            let client = match record.client().await {
                Some(client) => client,
                None => {
                    debug!(upstream = %name, "skipping capability aggregation, no client");
                    continue;
                }
            };

            // Absent capabilities read as the empty set.
            let capabilities = client.server_capabilities().unwrap_or_default();
            record.set_capabilities(capabilities.clone()).await;

            let conflicts = result.capabilities.merge_from(&capabilities);
            if !conflicts.is_empty() {
                let mut keys_by_category: BTreeMap<String, Vec<String>> = BTreeMap::new();
                for conflict in &conflicts {
                    warn!(
                        upstream = %name,
                        key = %format!("{}.{}", conflict.category, conflict.key),
                        previous = %conflict.previous,
                        incoming = %conflict.incoming,
                        "capability value overridden by later upstream"
                    );
                    keys_by_category
                        .entry(conflict.category.to_string())
                        .or_default()
                        .push(conflict.key.clone());
                }
                for (category, keys) in keys_by_category {
                    info!(
                        upstream = %name,
                        category = %category,
                        keys = %keys.join(", "),
                        "capability conflicts resolved last-writer-wins"
                    );
                }
                result
                    .conflicts
                    .extend(conflicts.into_iter().map(|c| (name.clone(), c)));
            }

            if let Some(instructions) = client.instructions() {
                result.instructions.push((name.clone(), instructions));
            }
        }

        result
    }
}
