//! Wire types shared by the handlers and [`ControlClient`](crate::ControlClient).

use nixfleet_state::{KvEntry, Operation};
use serde::{Deserialize, Serialize};

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Returned by a publish.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Desired-state bucket revision.
    pub revision: u64,
    /// Deployment stream sequence number.
    pub seq: u64,
}

/// One revision of a node's desired-state key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentUpdate {
    pub key: String,
    pub revision: u64,
    pub operation: Operation,
    /// Raw bucket value. Empty for deletions.
    #[serde(default)]
    pub value: String,
}

impl DeploymentUpdate {
    pub fn from_entry(entry: KvEntry) -> Self {
        Self {
            key: entry.key,
            revision: entry.revision,
            operation: entry.operation,
            value: String::from_utf8_lossy(&entry.value).into_owned(),
        }
    }

    /// Back to a bucket entry of `bucket`.
    pub fn into_entry(self, bucket: &str) -> KvEntry {
        KvEntry {
            bucket: bucket.to_string(),
            key: self.key,
            value: self.value.into_bytes(),
            revision: self.revision,
            operation: self.operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_omits_data() {
        let resp = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some("node not found".to_string()),
        };
        assert_eq!(
            serde_json::to_string(&resp).unwrap(),
            r#"{"success":false,"error":"node not found"}"#
        );
        let back: ApiResponse<PublishReceipt> =
            serde_json::from_str(r#"{"success":false,"error":"x"}"#).unwrap();
        assert!(back.data.is_none());
    }

    #[test]
    fn deletions_carry_no_value() {
        let update: DeploymentUpdate =
            serde_json::from_str(r#"{"key":"N1","revision":7,"operation":"delete"}"#).unwrap();
        let entry = update.into_entry("agent-deployments");
        assert_eq!(entry.operation, Operation::Delete);
        assert!(entry.value.is_empty());
        assert_eq!(entry.bucket, "agent-deployments");
    }
}
