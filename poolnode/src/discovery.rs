use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pool::DiscoveryRequest;
use crate::runner::{RunnerMeta, SocketSchema};

/// Inclusive range of job kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KindRange {
    pub min: u32,
    pub max: u32,
}

impl KindRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, kind: u32) -> bool {
        self.min <= kind && kind <= self.max
    }
}

impl fmt::Display for KindRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Filter for [`JobContext::discover_actions`](crate::context::JobContext::discover_actions).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryFilter {
    pub kinds: Vec<u32>,
    pub kind_ranges: Vec<KindRange>,
    pub tags: Vec<String>,
    pub nodes: Vec<String>,
    pub pools: Vec<String>,
}

impl DiscoveryFilter {
    pub fn with_kind(mut self, kind: u32) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn with_kind_range(mut self, min: u32, max: u32) -> Self {
        self.kind_ranges.push(KindRange::new(min, max));
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.nodes.push(node.into());
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pools.push(pool.into());
        self
    }

    pub(crate) fn to_request(&self, include_pools: bool) -> DiscoveryRequest {
        DiscoveryRequest {
            filter_by_kinds: self.kinds.clone(),
            filter_by_nodes: self.nodes.clone(),
            filter_by_tags: self.tags.clone(),
            filter_by_kind_ranges: self
                .kind_ranges
                .iter()
                .map(ToString::to_string)
                .collect(),
            filter_by_pools: if include_pools {
                self.pools.clone()
            } else {
                Vec::new()
            },
        }
    }
}

/// Metadata of a discovered action: the announcing runner's meta plus the
/// pool-assigned template id, when present.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub runner: RunnerMeta,
}

/// A runner template announced somewhere in the network.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub meta: ActionMeta,
    #[serde(default)]
    pub sockets: SocketSchema,
}

impl ActionDescriptor {
    pub fn kind(&self) -> u32 {
        self.meta.runner.kind
    }

    pub fn name(&self) -> &str {
        &self.meta.runner.name
    }

    /// Decodes the JSON strings returned by a discovery call.
    ///
    /// Entries that fail to decode are logged and skipped.
    pub fn parse_all<I, S>(raw: I) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        raw.into_iter()
            .filter_map(|entry| {
                let entry = entry.as_ref();
                match serde_json::from_str::<Self>(entry) {
                    Ok(action) => Some(action),
                    Err(err) => {
                        tracing::warn!("skipping malformed action descriptor: {err}");
                        None
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_range_wire_format() {
        let filter = DiscoveryFilter::default()
            .with_kind(5003)
            .with_kind_range(5000, 5999)
            .with_pool("pool-a");

        let request = filter.to_request(true);
        assert_eq!(request.filter_by_kinds, vec![5003]);
        assert_eq!(request.filter_by_kind_ranges, vec!["5000-5999".to_string()]);
        assert_eq!(request.filter_by_pools, vec!["pool-a".to_string()]);

        let nearby = filter.to_request(false);
        assert!(nearby.filter_by_pools.is_empty());
        assert!(KindRange::new(5000, 5999).contains(5999));
        assert!(!KindRange::new(5000, 5999).contains(6000));
    }

    #[test]
    fn test_parse_skips_malformed_descriptors() {
        let good = json!({
            "template": "{{meta}}",
            "meta": {"id": "tmpl-1", "kind": 5003, "name": "Search", "tags": ["tool"]},
            "sockets": {
                "in": {"query": {"type": "string"}},
                "out": {"output": {"type": "string"}}
            }
        })
        .to_string();

        let actions = ActionDescriptor::parse_all([good.as_str(), "not json", "[1,2]"]);
        assert_eq!(actions.len(), 1);

        let action = &actions[0];
        assert_eq!(action.kind(), 5003);
        assert_eq!(action.name(), "Search");
        assert_eq!(action.meta.id.as_deref(), Some("tmpl-1"));
        assert_eq!(action.meta.runner.tags, vec!["tool".to_string()]);
        assert!(action.sockets.inputs.contains_key("query"));
    }

    #[test]
    fn test_descriptor_defaults_missing_sections() {
        let actions = ActionDescriptor::parse_all(["{}"]);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind(), 5003);
        assert!(actions[0].sockets.inputs.is_empty());
    }
}
