use serde::Serialize;
use serde_json::{Map, Value};

use crate::types::DeviceType;

/// Tags published in the contract; others are ignored
const SUPPORTED_TAGS: [&str; 3] = ["dut", "screencapture", "modem"];

/// What this worker offers, built once at startup
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceContract {
    #[serde(rename = "uuid")]
    pub id: String,
    pub worker_type: DeviceType,
    pub supported_features: Map<String, Value>,
}

impl DeviceContract {
    pub fn new(id: String, worker_type: DeviceType, tags: &str) -> Self {
        Self {
            id,
            worker_type,
            supported_features: parse_tags(tags),
        }
    }
}

/// Parse `name=value` pairs separated by commas.
///
/// `true`/`false` become booleans; a bare name counts as `true`.
pub fn parse_tags(tags: &str) -> Map<String, Value> {
    let mut features = Map::new();
    for pair in tags.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = match pair.split_once('=') {
            Some((name, value)) => (name.trim(), value.trim()),
            None => (pair, "true"),
        };
        if !SUPPORTED_TAGS.contains(&name) {
            continue;
        }
        let value = match value {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            other => Value::String(other.to_string()),
        };
        features.insert(name.to_string(), value);
    }
    features
}
