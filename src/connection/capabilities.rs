use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

lazy_static! {
    static ref VERSION_RE: Regex =
        Regex::new(r"^\s*(\d+)(?:\.(\d+))?(?:\.(\d+))?").expect("version pattern is valid");
}

/// Server version as reported by `server_version`, e.g. `16.2 (Debian 16.2-1.pgdg120+2)`.
///
/// Versions compare by number only: a missing patch level counts as zero and `raw` is ignored.
#[derive(Debug, Clone, Serialize)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
    /// The setting exactly as the server reported it.
    pub raw: String,
}

impl ServerVersion {
    /// Parse the leading numeric part of a `server_version` string.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let caps = VERSION_RE.captures(raw)?;
        let part = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<u32>().ok());
        Some(ServerVersion {
            major: part(1)?,
            minor: part(2).unwrap_or(0),
            patch: part(3),
            raw: raw.to_string(),
        })
    }

    fn key(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch.unwrap_or(0))
    }
}

impl PartialEq for ServerVersion {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ServerVersion {}

impl PartialOrd for ServerVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServerVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.patch {
            Some(patch) => write!(f, "{}.{}.{}", self.major, self.minor, patch),
            None => write!(f, "{}.{}", self.major, self.minor),
        }
    }
}

/// Feature flags resolved once when the connection is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// `server_version_num`, e.g. `160002`.
    pub server_version_num: u32,
    /// Blocking (`*_blocking`) operations are available. Requires the connection's driver
    /// to run on a multi-thread tokio runtime.
    pub blocking_calls: bool,
}

/// Live connection state fetched in a single round trip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub host: String,
    pub port: u16,
    pub user_name: Option<String>,
    pub integrated_security: bool,
    pub process_id: i32,
    pub server_version: String,
    pub timezone: String,
    pub integer_datetimes: bool,
}

/// Interpret a boolean GUC (`on`/`off`, `true`/`false`).
pub(crate) fn setting_enabled(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "on" | "true" | "yes" | "1"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_distribution_suffixed_versions() {
        let version = ServerVersion::parse("16.2 (Debian 16.2-1.pgdg120+2)").unwrap();
        assert_eq!((version.major, version.minor, version.patch), (16, 2, None));
        assert_eq!(version.to_string(), "16.2");
        assert!(version.raw.starts_with("16.2 (Debian"));
    }

    #[test]
    fn parses_three_part_and_devel_versions() {
        let old = ServerVersion::parse("9.6.24").unwrap();
        assert_eq!(old.to_string(), "9.6.24");
        let devel = ServerVersion::parse("18devel").unwrap();
        assert_eq!((devel.major, devel.minor), (18, 0));
        assert!(old < devel);
        assert!(ServerVersion::parse("devel").is_none());
    }

    #[test]
    fn missing_patch_compares_as_zero() {
        let short = ServerVersion::parse("16.2").unwrap();
        let long = ServerVersion::parse("16.2.0").unwrap();
        assert_eq!(short, long);
        assert_eq!(short.cmp(&long), std::cmp::Ordering::Equal);
        assert_eq!(
            ServerVersion::parse("16.2 (Debian 16.2-1.pgdg120+2)").unwrap(),
            ServerVersion::parse("16.2 (Ubuntu 16.2-1.pgdg22.04+1)").unwrap()
        );
        assert!(short < ServerVersion::parse("16.2.1").unwrap());
        assert!(ServerVersion::parse("9.6.24").unwrap() < short);
    }

    #[test]
    fn boolean_settings() {
        assert!(setting_enabled("on"));
        assert!(setting_enabled(" TRUE "));
        assert!(!setting_enabled("off"));
    }
}
