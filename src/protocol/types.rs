//! Wire types exchanged with the control plane (camelCase JSON)

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::network::NetworkPolicy;

/// A queued job as returned by poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub run_id: String,
    pub prompt: String,
    pub agent_version_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_names: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

/// Agent CLI flavor the guest runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CliAgentType {
    #[default]
    ClaudeCode,
    Codex,
}

impl CliAgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CliAgentType::ClaudeCode => "claude-code",
            CliAgentType::Codex => "codex",
        }
    }
}

/// One archive to unpack into the guest before launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEntry {
    pub mount_path: String,
    /// Presigned download URL; `None` means an empty mount
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageManifest {
    #[serde(default)]
    pub entries: Vec<StorageEntry>,
}

/// Prior conversation to continue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSession {
    pub session_id: String,
    /// JSONL transcript as produced by the agent CLI
    pub transcript: String,
    /// Directory the agent CLI reads sessions from
    pub mount_path: String,
}

/// Everything one run needs; returned by a successful claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub run_id: String,
    pub prompt: String,
    /// Bearer credential valid for this run only
    pub sandbox_token: String,
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_manifest: Option<StorageManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session: Option<ResumeSession>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub cli_agent_type: CliAgentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<NetworkPolicy>,
}

impl ExecutionContext {
    /// Policy that actually applies: `Some` only when enabled
    pub fn active_policy(&self) -> Option<&NetworkPolicy> {
        self.network_policy.as_ref().filter(|p| p.enabled)
    }

    /// Secret values, for redaction
    pub fn secret_values(&self) -> Vec<String> {
        self.secrets.values().cloned().collect()
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PollRequest<'a> {
    pub group: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PollResponse {
    #[serde(default)]
    pub job: Option<Job>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CompleteRequest<'a> {
    pub run_id: &'a str,
    pub exit_code: i32,
    pub error: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TelemetryRequest<'a> {
    pub run_id: &'a str,
    pub network_logs: &'a [serde_json::Value],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_minimal_payload() {
        let ctx: ExecutionContext = serde_json::from_str(
            r#"{"runId":"r1","prompt":"hi","sandboxToken":"tok","workingDir":"/home/user/workspace"}"#,
        )
        .unwrap();
        assert_eq!(ctx.cli_agent_type, CliAgentType::ClaudeCode);
        assert!(ctx.secrets.is_empty());
        assert!(ctx.active_policy().is_none());
    }

    #[test]
    fn test_context_full_payload() {
        let ctx: ExecutionContext = serde_json::from_str(
            r#"{
                "runId": "r1", "prompt": "fix it", "sandboxToken": "tok", "workingDir": "/w",
                "storageManifest": {"entries": [{"mountPath": "/w", "archiveUrl": "https://s3/a.tgz"}, {"mountPath": "/data"}]},
                "resumeSession": {"sessionId": "s1", "transcript": "{}\n", "mountPath": "/root/.claude/projects/w"},
                "secrets": {"API_KEY": "sk"},
                "vars": {"MODE": "fast"},
                "cliAgentType": "codex",
                "networkPolicy": {"enabled": false}
            }"#,
        )
        .unwrap();
        let manifest = ctx.storage_manifest.as_ref().unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert!(manifest.entries[1].archive_url.is_none());
        assert_eq!(ctx.cli_agent_type, CliAgentType::Codex);
        assert_eq!(ctx.secret_values(), vec!["sk".to_string()]);
        // Declared but disabled
        assert!(ctx.active_policy().is_none());
    }

    #[test]
    fn test_job_optional_fields() {
        let job: Job = serde_json::from_str(
            r#"{"runId":"r1","prompt":"p","agentVersionId":"v1","checkpointId":"c9"}"#,
        )
        .unwrap();
        assert_eq!(job.checkpoint_id.as_deref(), Some("c9"));
        assert!(job.vars.is_none());
    }

    #[test]
    fn test_complete_body_shape() {
        let body = serde_json::to_value(CompleteRequest {
            run_id: "r1",
            exit_code: 1,
            error: Some("timeout"),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"runId": "r1", "exitCode": 1, "error": "timeout"}));
    }
}
