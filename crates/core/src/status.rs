//! Source/sync status snapshots written onto the RootSync/RepoSync object.

use serde::{Deserialize, Serialize};

use crate::errors::MultiError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    pub code: String,
    pub error_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    pub commit: String,
    #[serde(default)]
    pub errors: Vec<ErrorSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub commit: String,
    #[serde(default)]
    pub errors: Vec<ErrorSummary>,
    /// RFC3339 time of the last write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

impl SyncStatus {
    /// Equal apart from `last_update`.
    pub fn same_content(&self, other: &SyncStatus) -> bool {
        self.commit == other.commit && self.errors == other.errors
    }
}

pub fn summarize(errs: &MultiError) -> Vec<ErrorSummary> {
    errs.iter().map(|e| ErrorSummary { code: e.code().to_string(), error_message: e.to_string() }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SyncError;

    #[test]
    fn sync_status_ignores_timestamp_and_serializes_camel_case() {
        let errs: MultiError = SyncError::Status { message: "x".into() }.into();
        let a = SyncStatus { commit: "abc".into(), errors: summarize(&errs), last_update: Some("t1".into()) };
        let b = SyncStatus { last_update: Some("t2".into()), ..a.clone() };
        assert!(a.same_content(&b));
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["lastUpdate"], "t1");
        assert_eq!(v["errors"][0]["code"], "DL2014");
        assert!(v["errors"][0]["errorMessage"].as_str().unwrap().contains("x"));
    }
}
