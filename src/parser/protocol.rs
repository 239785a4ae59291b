use serde::{Deserialize, Serialize};

/// Flag the binary recognizes to run as a parser worker process.
pub const WORKER_FLAG: &str = "--parser-worker";

/// One line on the worker's stdin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParseJob {
    pub id: u64,
    pub base_url: String,
    pub document: String,
}

/// One line on the worker's stdout.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParseReply {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<ParsedDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub title: Option<String>,
    /// Absolute http(s) links, deduplicated, in document order.
    pub links: Vec<String>,
    pub forms: Vec<Form>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Form {
    pub action: String,
    pub method: String,
    pub inputs: Vec<String>,
}
