use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Catalog entry for a rootfs artifact: either a snapshot taken from a
/// stopped sandbox or a release pulled from the registry. Referenced by
/// name (optionally `name:version`) or by ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRelease {
    pub id: String,
    pub name: String,
    pub version: String,
    pub rootfs_path: String,
    pub kernel_image_path: Option<String>,
    /// Set when the image was produced by snapshotting a sandbox.
    pub source_sandbox_id: Option<String>,
    pub virtual_size_bytes: Option<i64>,
    pub allocated_size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Split an image reference into name and optional version.
///
/// `"alpine:3.20"` → `("alpine", Some("3.20"))`; `"alpine"` → `("alpine", None)`.
pub fn split_image_ref(reference: &str) -> (&str, Option<&str>) {
    match reference.split_once(':') {
        Some((name, version)) if !version.is_empty() => (name, Some(version)),
        _ => (reference, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_versioned_ref() {
        assert_eq!(split_image_ref("alpine:3.20"), ("alpine", Some("3.20")));
    }

    #[test]
    fn test_split_bare_name() {
        assert_eq!(split_image_ref("alpine"), ("alpine", None));
    }

    #[test]
    fn test_split_trailing_colon_is_bare_name() {
        assert_eq!(split_image_ref("alpine:"), ("alpine:", None));
    }
}
