//! Secret reference resolution
//!
//! Credentials are configured as references rather than literals so that
//! deployment documents can be committed without secrets in them.
//! Supported forms:
//!
//! - `env:NAME` - value of the `NAME` environment variable
//! - `file:/path` - trimmed contents of the file at `/path`
//! - anything else - used verbatim (for local development only)

use crate::error::ProfileError;

/// Resolve a secret reference to its value
pub fn resolve_secret(reference: &str) -> Result<String, ProfileError> {
    if let Some(name) = reference.strip_prefix("env:") {
        return std::env::var(name).map_err(|_| {
            ProfileError::Secret(format!("environment variable {} is not set", name))
        });
    }
    if let Some(path) = reference.strip_prefix("file:") {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProfileError::Secret(format!("cannot read {}: {}", path, e)))?;
        return Ok(text.trim_end_matches(['\n', '\r']).to_string());
    }
    Ok(reference.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_env_references() {
        // Unique name to avoid cross-test interference
        unsafe { std::env::set_var("VMOPS_SECRET_TEST_VAR", "hunter2") };
        assert_eq!(resolve_secret("env:VMOPS_SECRET_TEST_VAR").unwrap(), "hunter2");
    }

    #[test]
    fn missing_env_reference_fails() {
        assert!(matches!(
            resolve_secret("env:VMOPS_SECRET_TEST_UNSET"),
            Err(ProfileError::Secret(_))
        ));
    }

    #[test]
    fn literal_passes_through() {
        assert_eq!(resolve_secret("plain-password").unwrap(), "plain-password");
    }
}
