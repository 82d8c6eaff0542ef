//! Object key validation.
//!
//! Every object key eventually becomes a file name inside the artifact
//! directory, and later a primary key in the catalog. The sync pipeline
//! treats the bucket as a flat namespace, so a key must be usable as a
//! single path component: no separators, no traversal, no null bytes.

use crate::error::{ErrorKind, Result};

/// Validates that an object key can safely become a local file name.
///
/// Returns the key unchanged if valid, or
/// [`InvalidKey`](crate::error::ErrorKind::InvalidKey) if not.
///
/// # Examples
///
/// ```
/// use quarry_store::validate_key;
/// assert!(validate_key("sample.bin").is_ok());
/// assert!(validate_key("a-b_c.0.exe").is_ok());
/// assert!(validate_key("nested/key").is_err());
/// assert!(validate_key("..").is_err());
/// assert!(validate_key("").is_err());
/// ```
pub fn validate(key: &str) -> Result<&str> {
    if key.is_empty() {
        exn::bail!(ErrorKind::InvalidKey(key.to_string()));
    }
    // Null bytes survive Rust strings but truncate C-based syscalls.
    if key.bytes().any(|byte| byte == 0) {
        exn::bail!(ErrorKind::InvalidKey(key.to_string()));
    }
    // Separators would escape the flat artifact directory; so would the
    // dot directories. Backslash is a separator on Windows and a menace
    // everywhere else.
    if key.contains(['/', '\\']) || key == "." || key == ".." {
        exn::bail!(ErrorKind::InvalidKey(key.to_string()));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("sample.bin")]
    #[case("malware-2024.07.exe")]
    #[case("a")]
    #[case("..hidden-ish")]
    fn test_valid_keys(#[case] key: &str) {
        assert_eq!(validate(key).unwrap(), key);
    }

    #[rstest]
    #[case("")]
    #[case(".")]
    #[case("..")]
    #[case("dir/file.bin")]
    #[case("dir\\file.bin")]
    #[case("nul\0byte")]
    fn test_invalid_keys(#[case] key: &str) {
        let err = validate(key).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidKey(_)));
    }
}
