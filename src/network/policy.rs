//! Per-run network policy and its evaluation
//!
//! A policy is declared by the control plane in the execution context. The
//! proxy add-on evaluates it per connection using the hostname (SNI in
//! SNI-only mode, the decrypted Host in deep inspection mode); the same rules
//! are implemented here so the runner and its tests agree on the semantics.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Rule verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

/// Outcome of evaluating a connection against the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// One ordered rule; exactly one of `domain` / `ip` is set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    pub action: Action,
}

impl PolicyRule {
    pub fn domain(pattern: impl Into<String>, action: Action) -> Self {
        Self {
            domain: Some(pattern.into()),
            ip: None,
            action,
        }
    }

    pub fn ip(ip: IpAddr, action: Action) -> Self {
        Self {
            domain: None,
            ip: Some(ip),
            action,
        }
    }

    fn matches(&self, host: &str) -> bool {
        if let Some(ip) = self.ip {
            return host.parse::<IpAddr>().map(|h| h == ip).unwrap_or(false);
        }
        match &self.domain {
            Some(pattern) => domain_matches(pattern, host),
            None => false,
        }
    }
}

/// Network policy of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicy {
    /// Route the VM's traffic through the proxy at all
    #[serde(default)]
    pub enabled: bool,
    /// Ordered allow/deny rules; `None` means observe-only (allow all)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<PolicyRule>>,
    /// Verdict when no rule matches
    #[serde(default = "default_action")]
    pub default: Action,
    /// Decrypt TLS via a CA installed in the guest
    #[serde(default)]
    pub deep_inspection: bool,
    /// Scrub known secret values from captured traffic
    #[serde(default)]
    pub redact_secrets: bool,
}

fn default_action() -> Action {
    Action::Deny
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            rules: None,
            default: Action::Deny,
            deep_inspection: false,
            redact_secrets: false,
        }
    }
}

impl NetworkPolicy {
    /// Observe-only policy: traffic routed through the proxy, nothing blocked
    pub fn monitor() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// First matching rule wins; otherwise the default action
    pub fn evaluate(&self, host: &str) -> Decision {
        let rules = match &self.rules {
            Some(rules) => rules,
            None => return Decision::Allow,
        };

        let host = normalize_host(host);
        let action = rules
            .iter()
            .find(|rule| rule.matches(&host))
            .map(|rule| rule.action)
            .unwrap_or(self.default);

        match action {
            Action::Allow => Decision::Allow,
            Action::Deny => Decision::Deny {
                reason: format!("{} blocked by network policy", host),
            },
        }
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// `*.example.com` matches any subdomain (not the apex); anything else is exact
pub fn domain_matches(pattern: &str, host: &str) -> bool {
    let pattern = normalize_host(pattern);
    let host = normalize_host(host);
    match pattern.strip_prefix("*.") {
        Some(suffix) => host.len() > suffix.len() && host.ends_with(&format!(".{}", suffix)),
        None => pattern == host,
    }
}

/// Replace every occurrence of each secret value with `***`
///
/// Longer secrets are replaced first so a secret containing another secret is
/// scrubbed whole. Empty values are ignored.
pub fn redact_secrets(text: &str, secrets: &[String]) -> String {
    let mut ordered: Vec<&String> = secrets.iter().filter(|s| !s.is_empty()).collect();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.len()));

    let mut out = text.to_string();
    for secret in ordered {
        if out.contains(secret.as_str()) {
            out = out.replace(secret.as_str(), "***");
        }
    }
    out
}

/// Scrub secrets from every string inside a parsed log entry
///
/// Secrets are matched against decoded string values, so a secret containing
/// quotes or backslashes is found even though its JSON text is escaped.
/// Object keys are scrubbed too.
pub fn redact_json(value: &mut serde_json::Value, secrets: &[String]) {
    use serde_json::Value;

    match value {
        Value::String(text) => *text = redact_secrets(text, secrets),
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_json(item, secrets);
            }
        }
        Value::Object(map) => {
            let entries = std::mem::take(map);
            for (key, mut item) in entries {
                redact_json(&mut item, secrets);
                map.insert(redact_secrets(&key, secrets), item);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}
