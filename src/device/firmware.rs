//! Firmware versions.
//!
//! Textual form is `MAJOR.MINOR.PATCH` optionally followed by
//! `-alphaN`, `-betaN` or `-rcN`. A version without suffix is a release,
//! except `0.0.0` which denotes a development build.
//!
//! Versions order by type first, then major, minor, patch and build:
//! `Dev < Alpha < Beta < Rc < Release`.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

static VERSION_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)(?:-(alpha|beta|rc)(\d+))?$").ok());

// ============================================================================
// FirmwareType
// ============================================================================

/// Firmware release channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareType {
    /// Development build.
    Dev,
    /// Alpha build.
    Alpha,
    /// Beta build.
    Beta,
    /// Release candidate.
    Rc,
    /// Release.
    Release,
}

// ============================================================================
// FirmwareVersion
// ============================================================================

/// A firmware version, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareVersion {
    /// Release channel.
    pub firmware_type: FirmwareType,
    /// Major number.
    pub major: u32,
    /// Minor number.
    pub minor: u32,
    /// Patch number.
    pub patch: u32,
    /// Build number within a non-release channel.
    pub build: u32,
}

impl FirmwareVersion {
    /// Creates a version.
    #[inline]
    #[must_use]
    pub const fn new(
        firmware_type: FirmwareType,
        major: u32,
        minor: u32,
        patch: u32,
        build: u32,
    ) -> Self {
        Self {
            firmware_type,
            major,
            minor,
            patch,
            build,
        }
    }
}

impl FromStr for FirmwareVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let re = VERSION_RE
            .as_ref()
            .ok_or_else(|| Error::protocol("firmware version pattern unavailable"))?;
        let caps = re
            .captures(s.trim())
            .ok_or_else(|| Error::invalid_argument(format!("malformed firmware version: {s:?}")))?;

        let number = |idx: usize| -> Result<u32> {
            caps.get(idx).map_or(Ok(0), |m| {
                m.as_str().parse().map_err(|_| {
                    Error::invalid_argument(format!("firmware version number out of range: {s:?}"))
                })
            })
        };

        let (major, minor, patch, build) = (number(1)?, number(2)?, number(3)?, number(5)?);
        let firmware_type = match caps.get(4).map(|m| m.as_str()) {
            Some("alpha") => FirmwareType::Alpha,
            Some("beta") => FirmwareType::Beta,
            Some("rc") => FirmwareType::Rc,
            _ if major == 0 && minor == 0 && patch == 0 => FirmwareType::Dev,
            _ => FirmwareType::Release,
        };

        Ok(Self::new(firmware_type, major, minor, patch, build))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        match self.firmware_type {
            FirmwareType::Alpha => write!(f, "-alpha{}", self.build),
            FirmwareType::Beta => write!(f, "-beta{}", self.build),
            FirmwareType::Rc => write!(f, "-rc{}", self.build),
            FirmwareType::Dev | FirmwareType::Release => Ok(()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use proptest::prelude::*;

    use super::*;

    fn firmware_type() -> impl Strategy<Value = FirmwareType> {
        prop_oneof![
            Just(FirmwareType::Dev),
            Just(FirmwareType::Alpha),
            Just(FirmwareType::Beta),
            Just(FirmwareType::Rc),
            Just(FirmwareType::Release),
        ]
    }

    fn version() -> impl Strategy<Value = FirmwareVersion> {
        (firmware_type(), 0..4_u32, 0..4_u32, 0..4_u32, 0..4_u32)
            .prop_map(|(t, a, b, c, d)| FirmwareVersion::new(t, a, b, c, d))
    }

    #[test]
    fn test_parse_release() {
        let v: FirmwareVersion = "1.6.2".parse().expect("valid");
        assert_eq!(v, FirmwareVersion::new(FirmwareType::Release, 1, 6, 2, 0));
    }

    #[test]
    fn test_parse_prerelease() {
        let v: FirmwareVersion = "7.1.0-beta3".parse().expect("valid");
        assert_eq!(v, FirmwareVersion::new(FirmwareType::Beta, 7, 1, 0, 3));
        assert_eq!(v.to_string(), "7.1.0-beta3");

        let rc: FirmwareVersion = "7.1.0-rc12".parse().expect("valid");
        assert_eq!(rc.firmware_type, FirmwareType::Rc);
        assert_eq!(rc.build, 12);
    }

    #[test]
    fn test_parse_dev() {
        let v: FirmwareVersion = "0.0.0".parse().expect("valid");
        assert_eq!(v.firmware_type, FirmwareType::Dev);
    }

    #[test]
    fn test_parse_malformed() {
        for input in ["", "1.2", "1.2.3.4", "a.b.c", "1.2.3-gamma1", "1.2.3-rc", "99999999999.0.0"] {
            assert!(input.parse::<FirmwareVersion>().is_err(), "{input:?} should fail");
        }
    }

    #[test]
    fn test_ordering_examples() {
        let a = FirmwareVersion::new(FirmwareType::Alpha, 1, 2, 3, 4);
        let b = FirmwareVersion::new(FirmwareType::Alpha, 1, 2, 3, 5);
        assert!(a < b);

        let beta = FirmwareVersion::new(FirmwareType::Beta, 0, 0, 0, 0);
        let alpha = FirmwareVersion::new(FirmwareType::Alpha, 9, 9, 9, 9);
        assert!(beta > alpha);
    }

    #[test]
    fn test_serde_roundtrip() {
        let v = FirmwareVersion::new(FirmwareType::Rc, 1, 0, 0, 2);
        let json = serde_json::to_string(&v).expect("serialize");
        assert!(json.contains(r#""firmware_type":"rc""#));
        let back: FirmwareVersion = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, v);
    }

    proptest! {
        #[test]
        fn test_compare_antisymmetric(a in version(), b in version()) {
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            prop_assert_eq!(a.cmp(&a), Ordering::Equal);
        }

        #[test]
        fn test_compare_transitive(a in version(), b in version(), c in version()) {
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
        }

        #[test]
        fn test_type_dominates(a in version(), b in version()) {
            if a.firmware_type != b.firmware_type {
                prop_assert_eq!(a.cmp(&b), a.firmware_type.cmp(&b.firmware_type));
            }
        }
    }
}
