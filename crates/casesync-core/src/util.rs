//! Shared utility functions used across multiple modules.

use crate::error::{Error, Result};

/// Longest domain or owner id accepted by the cleanliness table.
pub const MAX_ID_LENGTH: usize = 100;

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Validate a domain name, returning the trimmed value.
pub fn validate_domain(domain: &str) -> Result<&str> {
    validate_id("domain", domain)
}

/// Validate an owner id, returning the trimmed value.
pub fn validate_owner_id(owner_id: &str) -> Result<&str> {
    validate_id("owner id", owner_id)
}

fn validate_id<'a>(label: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::InvalidInput(format!("{label} cannot be empty")));
    }
    if value.chars().count() > MAX_ID_LENGTH {
        return Err(Error::InvalidInput(format!(
            "{label} must be at most {MAX_ID_LENGTH} characters"
        )));
    }
    Ok(value)
}

/// Current Unix timestamp in milliseconds.
pub fn unix_timestamp_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
    }

    #[test]
    fn normalize_text_option_trims_value() {
        assert_eq!(
            normalize_text_option(Some(" owner-1 ".to_string())),
            Some("owner-1".to_string())
        );
    }

    #[test]
    fn validate_domain_rejects_empty_and_long_values() {
        assert!(validate_domain("").is_err());
        assert!(validate_domain("   ").is_err());
        assert!(validate_domain(&"something-too-long".repeat(10)).is_err());
        assert_eq!(validate_domain(" clinic ").unwrap(), "clinic");
    }

    #[test]
    fn validate_owner_id_accepts_max_length() {
        let owner = "o".repeat(MAX_ID_LENGTH);
        assert_eq!(validate_owner_id(&owner).unwrap(), owner);
        assert!(validate_owner_id(&"o".repeat(MAX_ID_LENGTH + 1)).is_err());
    }
}
