use serde::{Deserialize, Serialize};

/// Per-file build progress surfaced to subscribers. A finished build with
/// `error` set means retries were exhausted; it is never silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildInfo {
    pub path: String,
    pub finished: bool,
    #[serde(default)]
    pub error: bool,
}

/// Snapshot sent to a subscriber that attaches to an already-active plan,
/// before any new content. Carries everything generated so far so a late
/// joiner sees a consistent view without re-requesting history.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ConnectActiveState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_prompt: Option<String>,
    #[serde(default)]
    pub init_build_only: bool,
    #[serde(default)]
    pub init_replies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_file_path: Option<String>,
}

/// Streamed event envelope. For a single subscriber events arrive in the
/// order generated; across subscribers no ordering is implied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Start,
    ConnectActive(ConnectActiveState),
    Chunk { content: String },
    BuildInfo(BuildInfo),
    Heartbeat,
    Error { message: String },
    Aborted,
    Done,
}

impl StreamMessage {
    /// Terminal events close the subscriber channel after delivery. A
    /// client can distinguish normal completion, user-requested stop, and
    /// fatal error from the tag alone.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamMessage::Done | StreamMessage::Aborted | StreamMessage::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_tags() {
        assert!(StreamMessage::Done.is_terminal());
        assert!(StreamMessage::Aborted.is_terminal());
        assert!(StreamMessage::Error {
            message: "x".to_string()
        }
        .is_terminal());
        assert!(!StreamMessage::Heartbeat.is_terminal());
        assert!(!StreamMessage::Chunk {
            content: "x".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn envelope_round_trips_with_type_tag() {
        let msg = StreamMessage::BuildInfo(BuildInfo {
            path: "src/main.rs".to_string(),
            finished: true,
            error: false,
        });
        let raw = serde_json::to_string(&msg).unwrap();
        assert!(raw.contains("\"type\":\"build_info\""));
        let back: StreamMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, msg);
    }
}
