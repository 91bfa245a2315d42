//! Bucket and key naming rules, matching the S3 bucket-name syntax.

use crate::{Error, Result};

/// Buckets match `[a-z0-9][a-z0-9.\-]{1,61}[a-z0-9]`, must not start with
/// `xn--`, and must not contain uppercase characters or `/`.
pub fn validate_bucket_name(bucket: &str) -> Result<()> {
    let bytes = bucket.as_bytes();
    if bytes.len() < 3 || bytes.len() > 63 {
        return Err(Error::InvalidArgument(format!(
            "bucket name '{bucket}' must be between 3 and 63 characters"
        )));
    }
    if bucket.starts_with("xn--") {
        return Err(Error::InvalidArgument(format!(
            "bucket name '{bucket}' must not start with 'xn--'"
        )));
    }
    let edge = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !edge(bytes[0]) || !edge(bytes[bytes.len() - 1]) {
        return Err(Error::InvalidArgument(format!(
            "bucket name '{bucket}' must start and end with a lowercase letter or digit"
        )));
    }
    for &b in bytes {
        if !(edge(b) || b == b'.' || b == b'-') {
            return Err(Error::InvalidArgument(format!(
                "bucket name '{bucket}' contains invalid character '{}'",
                b as char
            )));
        }
    }
    Ok(())
}

/// Keys are non-empty, are not `.`/`..`, and have no leading `/` or `./`
/// segments. Parent references are rejected everywhere since keys map onto
/// local storage paths.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("key must not be empty".to_string()));
    }
    if key.starts_with('/') || key.starts_with("./") {
        return Err(Error::InvalidArgument(format!(
            "key '{key}' must not start with '/' or './'"
        )));
    }
    if key.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(Error::InvalidArgument(format!(
            "key '{key}' must not contain '.' or '..' segments"
        )));
    }
    Ok(())
}

pub fn validate_object_name(bucket: &str, key: &str) -> Result<()> {
    validate_bucket_name(bucket)?;
    validate_key(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_s3_style_bucket_names() {
        for name in ["geds-test", "a1b", "my.bucket-01", "123456"] {
            assert!(validate_bucket_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_invalid_bucket_names() {
        for name in [
            "ab",
            "Geds",
            "xn--bucket",
            "-leading",
            "trailing-",
            "under_score",
            "slash/inside",
            &"a".repeat(64),
        ] {
            assert!(validate_bucket_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn accepts_reasonable_keys() {
        for key in ["a", "a/1", "unit/msg", "deep/nested/path.txt", "a..b"] {
            assert!(validate_key(key).is_ok(), "{key}");
        }
    }

    #[test]
    fn rejects_invalid_keys() {
        for key in ["", ".", "..", "/abs", "./rel", "a/../b", "a/./b"] {
            assert!(validate_key(key).is_err(), "{key}");
        }
    }
}
