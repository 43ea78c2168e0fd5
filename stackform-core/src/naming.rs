//! Names for generated resources.
//!
//! Volumes, bind devices and cloud-init profiles get names derived from the
//! stack, service and logical name. Derivation is pure: the same inputs give the
//! same name on every run, which is what makes re-running `up` idempotent.
//!
//! Names longer than [`MAX_NAME_LEN`] are replaced by the first 16 bytes of the
//! SHA-256 digest of the slug, hex encoded (32 characters). Two different inputs
//! can only collide through a digest collision; that residual risk is accepted.

use chrono::{DateTime, TimeZone};
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Longest name the control plane accepts for volumes and devices.
pub const MAX_NAME_LEN: usize = 64;

/// Length of a collapsed (hashed) name.
pub const HASHED_NAME_LEN: usize = 32;

/// Timestamp layout shared by snapshot and export names.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Lowercase URL/DNS-safe slug: ASCII alphanumerics kept, every other run of
/// characters becomes a single `-`, no leading or trailing `-`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Slug `input`, hashing it down when it exceeds [`MAX_NAME_LEN`].
pub fn bounded(input: &str) -> String {
    let slug = slugify(input);
    if slug.len() <= MAX_NAME_LEN {
        return slug;
    }
    let digest = Sha256::digest(slug.as_bytes());
    digest[..HASHED_NAME_LEN / 2].iter().fold(String::with_capacity(HASHED_NAME_LEN), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// Generated name of a custom volume: `{stack}-{service}-{logical}`, bounded.
pub fn derive_name(stack: &str, service: &str, logical: &str) -> String {
    bounded(&format!("{}-{}-{}", stack, service, logical))
}

/// Stable device name for a bind mount, keyed on the host source path.
pub fn bind_device_name(source: &str) -> String {
    bounded(source)
}

/// Name of the generated cloud-init profile of a service.
pub fn cloud_init_profile_name(project: &str, stack: &str, service: &str) -> String {
    bounded(&format!("{}-{}-{}-cloudinit", project, stack, service))
}

/// Device name of the secrets directory mount.
pub fn secrets_device_name(service: &str) -> String {
    bounded(&format!("secrets-{}", service))
}

/// Snapshot name: `{resource}-{YYYY-MM-DD-HH-MM-SS}`.
pub fn snapshot_name<Tz: TimeZone>(resource: &str, at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}-{}", resource, at.format(TIMESTAMP_FORMAT))
}

/// Export archive file name: `{resource}-export-{YYYY-MM-DD-HH-MM-SS}.tar.gz`.
pub fn export_file_name<Tz: TimeZone>(resource: &str, at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}-export-{}.tar.gz", resource, at.format(TIMESTAMP_FORMAT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_derive_name_short() {
        assert_eq!(derive_name("myapp", "db", "cache"), "myapp-db-cache");
        assert_eq!(derive_name("stack1", "svc1", "data"), derive_name("stack1", "svc1", "data"));
    }

    #[test]
    fn test_derive_name_slugs_input() {
        assert_eq!(derive_name("My App", "web_1", "Static Files"), "my-app-web-1-static-files");
        assert_eq!(slugify("--a__b--"), "a-b");
        assert_eq!(slugify("/srv/data/"), "srv-data");
    }

    #[test]
    fn test_derive_name_long_is_hashed() {
        let long = "x".repeat(60);
        let name = derive_name("stack", "service", &long);
        assert_eq!(name.len(), HASHED_NAME_LEN);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(name, derive_name("stack", "service", &long));
        assert_ne!(name, derive_name("stack", "other", &long));
    }

    #[test]
    fn test_exactly_max_len_is_kept() {
        let logical = "a".repeat(MAX_NAME_LEN - "s-v-".len());
        let name = derive_name("s", "v", &logical);
        assert_eq!(name.len(), MAX_NAME_LEN);
        assert!(name.starts_with("s-v-"));
    }

    #[test]
    fn test_hash_matches_sha256_prefix() {
        // sha256("a" * 65) begins with these 16 bytes.
        let input = "a".repeat(65);
        let digest = Sha256::digest(input.as_bytes());
        let expected: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(bounded(&input), expected);
    }

    #[test]
    fn test_bind_device_name() {
        assert_eq!(bind_device_name("./config/nginx"), "config-nginx");
        assert_eq!(bind_device_name(&format!("/{}", "d/".repeat(40))).len(), HASHED_NAME_LEN);
    }

    #[test]
    fn test_timestamped_names() {
        let at = Utc.with_ymd_and_hms(2024, 5, 17, 9, 3, 7).unwrap();
        assert_eq!(snapshot_name("web", &at), "web-2024-05-17-09-03-07");
        assert_eq!(export_file_name("db", &at), "db-export-2024-05-17-09-03-07.tar.gz");
    }

    #[test]
    fn test_profile_name() {
        assert_eq!(cloud_init_profile_name("default", "myapp", "web"), "default-myapp-web-cloudinit");
    }
}
