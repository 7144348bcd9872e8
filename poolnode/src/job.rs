use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Pool-assigned job identifier.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Error,
    Success,
    PaymentRequired,
}

/// A single named parameter; values keep their submission order.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobParam {
    pub key: String,
    pub value: Vec<String>,
}

impl JobParam {
    pub fn new<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            value: values.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    pub data: String,
    #[serde(rename = "type")]
    pub input_type: String,
    #[serde(default)]
    pub marker: Option<String>,
}

impl JobInput {
    pub fn text(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            input_type: "text".to_string(),
            marker: None,
        }
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub log: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub status: JobStatus,
    #[serde(default)]
    pub logs: Vec<JobLog>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub content: String,
    /// Milliseconds since the Unix epoch; zero while no result exists.
    pub timestamp: i64,
}

/// A job as delivered by the pool.
///
/// The node only borrows jobs for the duration of one execution; the pool
/// stays authoritative for their state.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: u32,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub params: Vec<JobParam>,
    #[serde(default)]
    pub inputs: Vec<JobInput>,
    #[serde(default)]
    pub output_format: String,
    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub result: JobResult,
}

impl Job {
    /// First value of the first parameter named `key`.
    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|param| param.key == key)
            .and_then(|param| param.value.first())
            .map(String::as_str)
    }

    /// All values of the first parameter named `key`.
    pub fn param_values(&self, key: &str) -> Option<&[String]> {
        self.params
            .iter()
            .find(|param| param.key == key)
            .map(|param| param.value.as_slice())
    }

    /// First input carrying `marker`, or the first input at all when no
    /// marker is given.
    pub fn input(&self, marker: Option<&str>) -> Option<&JobInput> {
        self.inputs.iter().find(|input| input_matches(input, marker))
    }

    pub fn inputs_with(&self, marker: Option<&str>) -> Vec<&JobInput> {
        self.inputs
            .iter()
            .filter(|input| input_matches(input, marker))
            .collect()
    }

    /// Whether the pool has published a successful result.
    pub fn is_resolved(&self) -> bool {
        self.state.status == JobStatus::Success && self.result.timestamp != 0
    }
}

fn input_matches(input: &JobInput, marker: Option<&str>) -> bool {
    match marker {
        None => true,
        Some(marker) => input.marker.as_deref() == Some(marker),
    }
}
