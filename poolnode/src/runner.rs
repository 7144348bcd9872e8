use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::JobContext;
use crate::pool::PendingJobsRequest;
use crate::runtime::NodeRuntime;

/// Descriptive metadata a runner advertises with its template.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerMeta {
    pub kind: u32,
    pub name: String,
    pub description: String,
    pub tos: String,
    pub privacy: String,
    pub author: String,
    pub web: String,
    pub picture: String,
    pub tags: Vec<String>,
}

impl Default for RunnerMeta {
    fn default() -> Self {
        Self {
            kind: 5003,
            name: "An event template".to_string(),
            description: String::new(),
            tos: String::new(),
            privacy: String::new(),
            author: String::new(),
            web: String::new(),
            picture: String::new(),
            tags: Vec::new(),
        }
    }
}

/// Pool-side filters selecting which pending jobs a runner is offered.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFilter {
    pub run_on: Option<String>,
    pub customer: Option<String>,
    pub description: Option<String>,
    pub id: Option<String>,
    pub kind: Option<String>,
}

impl JobFilter {
    pub fn run_on(target: impl Into<String>) -> Self {
        Self {
            run_on: Some(target.into()),
            ..Default::default()
        }
    }

    pub(crate) fn to_request(
        &self,
        exclude_ids: Vec<String>,
        wait_ms: u64,
    ) -> PendingJobsRequest {
        PendingJobsRequest {
            filter_by_run_on: self.run_on.clone(),
            filter_by_customer: self.customer.clone(),
            filter_by_description: self.description.clone(),
            filter_by_id: self.id.clone(),
            filter_by_kind: self.kind.clone(),
            exclude_ids,
            wait_ms,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Map,
    Object,
    File,
    #[serde(other)]
    Unknown,
}

/// Declaration of one input or output socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SocketSpec {
    #[serde(rename = "type")]
    pub socket_type: SocketType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    /// Element schema of an array socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SocketSpec>>,
    /// Field schemas of a map socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, SocketSpec>>,
}

impl SocketSpec {
    pub fn new(socket_type: SocketType) -> Self {
        Self {
            socket_type,
            title: None,
            description: None,
            default: None,
            required: None,
            items: None,
            properties: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_items(mut self, items: SocketSpec) -> Self {
        self.items = Some(Box::new(items));
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, spec: SocketSpec) -> Self {
        self.properties
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), spec);
        self
    }

    /// Explicit `required` flag, otherwise required iff no default exists.
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(self.default.is_none())
    }
}

/// Typed input and output declarations of a runner.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SocketSchema {
    #[serde(rename = "in", default)]
    pub inputs: BTreeMap<String, SocketSpec>,
    #[serde(rename = "out", default)]
    pub outputs: BTreeMap<String, SocketSpec>,
}

impl SocketSchema {
    pub fn with_input(mut self, name: impl Into<String>, spec: SocketSpec) -> Self {
        self.inputs.insert(name.into(), spec);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, spec: SocketSpec) -> Self {
        self.outputs.insert(name.into(), spec);
        self
    }

    /// Names of inputs a request must provide.
    pub fn required_inputs(&self) -> Vec<&str> {
        self.inputs
            .iter()
            .filter(|(_, spec)| spec.is_required())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Static description of a runner.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub meta: RunnerMeta,
    pub filter: JobFilter,
    /// Render template used by external tooling to build job requests; the
    /// node only forwards it.
    pub template: String,
    pub sockets: SocketSchema,
    /// Run fetched jobs concurrently instead of one at a time.
    pub parallel: bool,
}

impl RunnerConfig {
    pub fn new(meta: RunnerMeta) -> Self {
        Self {
            meta,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: JobFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_sockets(mut self, sockets: SocketSchema) -> Self {
        self.sockets = sockets;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// A pluggable unit of work registered with a node.
///
/// Only [`run`](Self::run) is required. Hooks are called by the runtime in
/// this order: `init` once before the first poll, `tick` on every tick of the
/// node loop regardless of job activity, and per fetched job `can_run`, then
/// `pre_run`, `run`, `post_run`.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    fn config(&self) -> &RunnerConfig;

    async fn init(&self, _node: &NodeRuntime) -> anyhow::Result<()> {
        Ok(())
    }

    async fn tick(&self, _node: &NodeRuntime) -> anyhow::Result<()> {
        Ok(())
    }

    /// Admission check. Returning `false` skips the job without accepting or
    /// locking it.
    async fn can_run(&self, _ctx: &JobContext) -> bool {
        true
    }

    async fn pre_run(&self, _ctx: &JobContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Execute the job and return its output.
    async fn run(&self, ctx: &JobContext) -> anyhow::Result<String>;

    async fn post_run(&self, _ctx: &JobContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn meta(&self) -> &RunnerMeta {
        &self.config().meta
    }

    fn is_parallel(&self) -> bool {
        self.config().parallel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_selector_sockets() -> SocketSchema {
        SocketSchema::default()
            .with_input(
                "queries",
                SocketSpec::new(SocketType::Array)
                    .with_title("Queries")
                    .with_items(SocketSpec::new(SocketType::Map).with_property(
                        "value",
                        SocketSpec::new(SocketType::String).with_title("Value"),
                    )),
            )
            .with_input(
                "context",
                SocketSpec::new(SocketType::String).with_default(json!("")),
            )
            .with_output("output", SocketSpec::new(SocketType::String))
    }

    #[test]
    fn test_meta_defaults() {
        let meta = RunnerMeta::default();
        assert_eq!(meta.kind, 5003);
        assert_eq!(meta.name, "An event template");
        assert!(meta.tags.is_empty());

        let partial: RunnerMeta = serde_json::from_value(json!({"name": "Tool Selector"})).unwrap();
        assert_eq!(partial.kind, 5003);
        assert_eq!(partial.name, "Tool Selector");
    }

    #[test]
    fn test_socket_schema_wire_shape() {
        let value = serde_json::to_value(tool_selector_sockets()).unwrap();
        assert_eq!(value["in"]["queries"]["type"], "array");
        assert_eq!(value["in"]["queries"]["items"]["properties"]["value"]["type"], "string");
        assert_eq!(value["in"]["context"]["default"], "");
        assert_eq!(value["out"]["output"]["type"], "string");
        assert!(value["in"]["context"].get("required").is_none());
    }

    #[test]
    fn test_required_inputs_follow_defaults() {
        let sockets = tool_selector_sockets();
        assert_eq!(sockets.required_inputs(), vec!["queries"]);

        let mut optional = SocketSpec::new(SocketType::String);
        optional.required = Some(false);
        assert!(!optional.is_required());
    }

    #[test]
    fn test_unknown_socket_type_tolerated() {
        let spec: SocketSpec = serde_json::from_value(json!({"type": "vector"})).unwrap();
        assert_eq!(spec.socket_type, SocketType::Unknown);
    }

    #[test]
    fn test_filter_to_request() {
        let filter = JobFilter::run_on("openagents/tool-selector");
        let request = filter.to_request(vec!["a".into()], 60_000);
        assert_eq!(request.filter_by_run_on.as_deref(), Some("openagents/tool-selector"));
        assert!(request.filter_by_kind.is_none());
        assert_eq!(request.exclude_ids, vec!["a".to_string()]);
        assert_eq!(request.wait_ms, 60_000);
    }
}
