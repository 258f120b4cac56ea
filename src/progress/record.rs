//! Progress records and the stage-update wire type

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

use crate::error::LinkError;

/// Percent at which a stage counts as finished
pub const STAGE_COMPLETE: i64 = 100;

/// A tracked long-running operation with exactly two stages
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKind {
    name: String,
    channel: String,
    stage_a: String,
    stage_b: String,
}

impl OperationKind {
    /// Create a kind whose channel is `<name>Progress`
    pub fn new(
        name: impl Into<String>,
        stage_a: impl Into<String>,
        stage_b: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            channel: format!("{}Progress", name),
            name,
            stage_a: stage_a.into(),
            stage_b: stage_b.into(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Node backup: database dump, then file archive
    pub fn backup() -> Self {
        Self::new("backup", "database", "files")
    }

    /// Node restore: database load, then file extraction
    pub fn restore() -> Self {
        Self::new("restore", "database", "files")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stage_a(&self) -> &str {
        &self.stage_a
    }

    pub fn stage_b(&self) -> &str {
        &self.stage_b
    }

    /// Map a stage tag to its stage
    pub fn stage(&self, tag: &str) -> Option<Stage> {
        if tag == self.stage_a {
            Some(Stage::A)
        } else if tag == self.stage_b {
            Some(Stage::B)
        } else {
            None
        }
    }

    pub fn tag(&self, stage: Stage) -> &str {
        match stage {
            Stage::A => &self.stage_a,
            Stage::B => &self.stage_b,
        }
    }

    /// Decode a channel payload into a stage update.
    ///
    /// The payload is a single-entry object `{ "<tag>": <percent> }`.
    pub fn decode(&self, payload: &JsonValue) -> Result<ProgressUpdate, LinkError> {
        let invalid = |reason: String| LinkError::InvalidPayload {
            channel: self.channel.clone(),
            reason,
        };

        let map = payload
            .as_object()
            .ok_or_else(|| invalid(format!("expected an object, got {}", payload)))?;

        let mut entries = map.iter();
        let (tag, value) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(invalid(format!(
                    "expected exactly one stage entry, got {}",
                    map.len()
                )))
            }
        };

        let stage = self.stage(tag).ok_or_else(|| LinkError::UnknownStage {
            channel: self.channel.clone(),
            tag: tag.clone(),
        })?;

        let percent = value
            .as_i64()
            .ok_or_else(|| invalid(format!("percent for {} is not an integer: {}", tag, value)))?;

        Ok(ProgressUpdate { stage, percent })
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// One of the two stages of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    A,
    B,
}

/// A single-stage delta as pushed by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub stage: Stage,
    pub percent: i64,
}

impl ProgressUpdate {
    pub fn new(stage: Stage, percent: i64) -> Self {
        Self { stage, percent }
    }
}

/// Latest known progress of an operation kind.
///
/// Percentages are stored as received; nothing is clamped or required to
/// increase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub stage_a: i64,
    pub stage_b: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux: Option<String>,
}

impl ProgressRecord {
    /// The zero record
    pub fn zero() -> Self {
        Self::default()
    }

    /// Record with both stages at zero and a label
    pub fn labelled(label: impl Into<String>) -> Self {
        Self {
            aux: Some(label.into()),
            ..Self::default()
        }
    }

    /// Apply a stage delta, keeping every other field
    pub fn merge(&self, update: ProgressUpdate) -> Self {
        let mut next = self.clone();
        match update.stage {
            Stage::A => next.stage_a = update.percent,
            Stage::B => next.stage_b = update.percent,
        }
        next
    }

    /// Both stages at or past 100, recomputed on every call
    pub fn is_complete(&self) -> bool {
        self.stage_a >= STAGE_COMPLETE && self.stage_b >= STAGE_COMPLETE
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            stage_a: self.stage_a,
            stage_b: self.stage_b,
            is_complete: self.is_complete(),
        }
    }
}

/// Read view of a progress record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub stage_a: i64,
    pub stage_b: i64,
    pub is_complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_kinds() {
        let backup = OperationKind::backup();
        assert_eq!(backup.channel(), "backupProgress");
        assert_eq!(backup.stage(backup.stage_a()), Some(Stage::A));
        assert_eq!(backup.stage("files"), Some(Stage::B));
        assert_eq!(backup.stage("unknown"), None);
        assert_eq!(OperationKind::restore().channel(), "restoreProgress");
    }

    #[test]
    fn test_decode_stage_update() {
        let kind = OperationKind::backup();
        assert_eq!(
            kind.decode(&json!({"database": 42})).unwrap(),
            ProgressUpdate::new(Stage::A, 42)
        );
        assert_eq!(
            kind.decode(&json!({"files": 100})).unwrap(),
            ProgressUpdate::new(Stage::B, 100)
        );
    }

    #[test]
    fn test_decode_keeps_out_of_range_values() {
        let kind = OperationKind::backup();
        assert_eq!(kind.decode(&json!({"files": 140})).unwrap().percent, 140);
        assert_eq!(kind.decode(&json!({"files": -5})).unwrap().percent, -5);
    }

    #[test]
    fn test_decode_unknown_tag() {
        let kind = OperationKind::restore();
        let err = kind.decode(&json!({"thumbnails": 10})).unwrap_err();
        assert!(matches!(err, LinkError::UnknownStage { ref tag, .. } if tag == "thumbnails"));
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        let kind = OperationKind::backup();
        for payload in [
            json!(null),
            json!(42),
            json!({}),
            json!({"database": 10, "files": 20}),
            json!({"database": "10"}),
            json!({"database": 10.5}),
        ] {
            assert!(
                matches!(kind.decode(&payload), Err(LinkError::InvalidPayload { .. })),
                "payload {} should be rejected",
                payload
            );
        }
    }

    #[test]
    fn test_merge_replaces_one_stage() {
        let record = ProgressRecord::labelled("nightly.tar");
        let next = record.merge(ProgressUpdate::new(Stage::B, 30));
        assert_eq!(next.stage_a, 0);
        assert_eq!(next.stage_b, 30);
        assert_eq!(next.aux.as_deref(), Some("nightly.tar"));
    }

    #[test]
    fn test_completion_requires_both_stages() {
        let mut record = ProgressRecord::zero();
        record.stage_a = 100;
        assert!(!record.is_complete());
        record.stage_b = 120;
        assert!(record.is_complete());
        record.stage_a = 99;
        assert!(!record.is_complete());
    }

    #[test]
    fn test_snapshot() {
        let record = ProgressRecord {
            stage_a: 100,
            stage_b: 100,
            aux: None,
        };
        assert_eq!(
            record.snapshot(),
            ProgressSnapshot {
                stage_a: 100,
                stage_b: 100,
                is_complete: true
            }
        );
    }
}
