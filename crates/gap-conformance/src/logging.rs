use std::collections::BTreeMap;

use gap_core::ExecutionMode;
use serde::Serialize;
use serde_json::Value;

pub const STRUCTURED_LOG_SCHEMA_VERSION: &str = "gap-conformance-log-v1";

/// One machine-readable record per executed case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub schema_version: &'static str,
    pub ts_unix_ms: u128,
    pub suite_id: &'static str,
    pub fixture_id: String,
    pub case_id: String,
    pub mode: &'static str,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub outcome: &'static str,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &'static str,
        fixture_id: &str,
        case_id: &str,
        mode: ExecutionMode,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &'static str,
        reason_code: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: STRUCTURED_LOG_SCHEMA_VERSION,
            ts_unix_ms: now_unix_ms(),
            suite_id,
            fixture_id: fixture_id.to_string(),
            case_id: case_id.to_string(),
            mode: mode_label(mode),
            artifact_refs,
            replay_command,
            outcome,
            reason_code: reason_code.into(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra_fields(mut self, fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(fields);
        self
    }

    pub fn to_json_line(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|error| format!("failed to encode case log: {error}"))
    }
}

#[must_use]
pub fn mode_label(mode: ExecutionMode) -> &'static str {
    mode.label()
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
