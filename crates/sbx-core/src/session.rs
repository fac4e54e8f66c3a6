use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::not_valid;

/// Path of the session environment script inside the guest.
pub const SESSION_ENV_PATH: &str = "/etc/sbx/session-env.sh";

/// File mode for the installed script.
pub const SESSION_ENV_MODE: &str = "644";

/// What outbound traffic a sandbox may originate. Consumed by the nftables
/// rule writer; the proxy itself is an external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EgressAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressPolicy {
    pub default_action: EgressAction,
    /// CIDR exceptions to the default action.
    #[serde(default)]
    pub allow: Vec<String>,
}

/// Per-session configuration, replaced on every start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Environment injected into the guest. Kept sorted so rendering is
    /// deterministic regardless of input order.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub egress: Option<EgressPolicy>,
}

/// Validate environment keys: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_env_keys<'a>(keys: impl Iterator<Item = &'a str>) -> Result<()> {
    for key in keys {
        let mut chars = key.chars();
        let head_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !head_ok || !tail_ok {
            return Err(not_valid(format!(
                "invalid environment variable name: {:?}",
                key
            )));
        }
    }
    Ok(())
}

/// Quote a value for a POSIX `export KEY='VALUE'` line. Single quotes inside
/// the value become the four-character sequence `'"'"'`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

/// Render the session environment script.
///
/// The output is byte-stable: header, then one export line per pair sorted
/// by key, LF endings throughout. This file is the sole host↔guest contract
/// for session env; guest shells are expected to source it.
pub fn render_env_script(env: &BTreeMap<String, String>) -> String {
    let mut script = String::from("#!/bin/sh\n# Managed by sbx.\n");
    for (key, value) in env {
        script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_sorted_and_escaped() {
        let rendered = render_env_script(&env(&[("B", "2"), ("A", "o'clock")]));
        assert_eq!(
            rendered,
            "#!/bin/sh\n# Managed by sbx.\nexport A='o'\"'\"'clock'\nexport B='2'\n"
        );
    }

    #[test]
    fn test_render_empty_env_is_header_only() {
        let rendered = render_env_script(&BTreeMap::new());
        assert_eq!(rendered, "#!/bin/sh\n# Managed by sbx.\n");
    }

    #[test]
    fn test_render_is_insensitive_to_insertion_order() {
        let a = render_env_script(&env(&[("PATH", "/bin"), ("HOME", "/root"), ("A", "1")]));
        let b = render_env_script(&env(&[("A", "1"), ("HOME", "/root"), ("PATH", "/bin")]));
        assert_eq!(a, b);
        let lines: Vec<&str> = a.lines().collect();
        assert_eq!(lines[2], "export A='1'");
        assert_eq!(lines[3], "export HOME='/root'");
        assert_eq!(lines[4], "export PATH='/bin'");
    }

    #[test]
    fn test_quote_plain_value() {
        assert_eq!(shell_quote("hello world"), "'hello world'");
    }

    #[test]
    fn test_quote_embedded_single_quotes() {
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn test_validate_env_keys_accepts_valid() {
        assert!(validate_env_keys(["PATH", "_private", "A1_B2"].into_iter()).is_ok());
    }

    #[test]
    fn test_validate_env_keys_rejects_invalid() {
        for bad in ["", "1ABC", "WITH-DASH", "WITH SPACE", "ÜMLAUT"] {
            let err = validate_env_keys([bad].into_iter()).unwrap_err();
            assert!(crate::error::is_not_valid(&err), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_session_config_serde_roundtrip() {
        let session = SessionConfig {
            env: env(&[("KEY", "value")]),
            egress: Some(EgressPolicy {
                default_action: EgressAction::Deny,
                allow: vec!["10.0.0.0/8".into()],
            }),
        };
        let json = serde_json::to_string(&session).unwrap();
        let parsed: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, session);
    }
}
