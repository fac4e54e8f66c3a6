use anyhow::Result;

use crate::error::not_valid;

/// Validate a user-chosen sandbox name.
///
/// Names share a namespace with IDs during resolution and appear on the
/// left of the `NAME:PATH` copy grammar, so colons, slashes, and whitespace
/// are rejected outright.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(not_valid(format!(
            "sandbox name must be 1-63 characters, got {}",
            name.len()
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, ':' | '/') || c.is_control())
    {
        return Err(not_valid(format!(
            "sandbox name {:?} contains forbidden character {:?}",
            name, bad
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_not_valid;

    #[test]
    fn test_accepts_typical_names() {
        for name in ["web", "my-sandbox", "build_42", "Sandbox.v2", "01ARZ3NDEKTSV4RRFFQ69G5FAV"] {
            assert!(validate_name(name).is_ok(), "{:?} should be accepted", name);
        }
    }

    #[test]
    fn test_rejects_empty_and_oversized() {
        assert!(is_not_valid(&validate_name("").unwrap_err()));
        assert!(is_not_valid(&validate_name(&"a".repeat(64)).unwrap_err()));
        assert!(validate_name(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_rejects_copy_grammar_breakers() {
        // A colon in a name would make NAME:PATH ambiguous.
        assert!(is_not_valid(&validate_name("bad:name").unwrap_err()));
        assert!(is_not_valid(&validate_name("bad/name").unwrap_err()));
        assert!(is_not_valid(&validate_name("bad name").unwrap_err()));
        assert!(is_not_valid(&validate_name("bad\tname").unwrap_err()));
    }
}
