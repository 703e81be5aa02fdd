//! Floating-point precision requirements of compiled kernels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The floating-point precision a kernel was compiled for.
///
/// Kernels request relaxed or imprecise arithmetic through pragmas. A cached
/// artifact compiled for one precision is not interchangeable with another, so
/// the cache treats a mismatch against the configured override as a miss.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloatPrecision {
    /// IEEE-754 compliant arithmetic (default).
    #[default]
    Full,
    /// Denormals may flush to zero and rounding may differ.
    Relaxed,
    /// Reduced-accuracy fast paths are allowed.
    Imprecise,
}

impl FloatPrecision {
    /// Pragma key requesting [`FloatPrecision::Relaxed`].
    pub const RELAXED_PRAGMA: &'static str = "fp_relaxed";
    /// Pragma key requesting [`FloatPrecision::Imprecise`].
    pub const IMPRECISE_PRAGMA: &'static str = "fp_imprecise";

    /// The pragma key that requests this precision; `Full` needs none.
    pub fn pragma_key(self) -> Option<&'static str> {
        match self {
            FloatPrecision::Full => None,
            FloatPrecision::Relaxed => Some(Self::RELAXED_PRAGMA),
            FloatPrecision::Imprecise => Some(Self::IMPRECISE_PRAGMA),
        }
    }

    /// Derives the precision requirement from a sequence of pragma keys.
    ///
    /// `fp_imprecise` takes priority over `fp_relaxed`; with neither present
    /// the requirement is [`FloatPrecision::Full`].
    pub fn from_pragma_keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        let mut relaxed = false;
        for key in keys {
            if key == Self::IMPRECISE_PRAGMA {
                return FloatPrecision::Imprecise;
            }
            if key == Self::RELAXED_PRAGMA {
                relaxed = true;
            }
        }
        if relaxed {
            FloatPrecision::Relaxed
        } else {
            FloatPrecision::Full
        }
    }
}

impl fmt::Display for FloatPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FloatPrecision::Full => f.pad("full"),
            FloatPrecision::Relaxed => f.pad("relaxed"),
            FloatPrecision::Imprecise => f.pad("imprecise"),
        }
    }
}

/// Error returned when parsing an unknown precision name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown float precision '{0}' (expected full, relaxed or imprecise)")]
pub struct ParsePrecisionError(pub String);

impl FromStr for FloatPrecision {
    type Err = ParsePrecisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(FloatPrecision::Full),
            "relaxed" => Ok(FloatPrecision::Relaxed),
            "imprecise" => Ok(FloatPrecision::Imprecise),
            _ => Err(ParsePrecisionError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_pragmas_is_full() {
        assert_eq!(
            FloatPrecision::from_pragma_keys(["version", "java_package_name"]),
            FloatPrecision::Full
        );
    }

    #[test]
    fn relaxed_pragma() {
        assert_eq!(
            FloatPrecision::from_pragma_keys(["fp_relaxed"]),
            FloatPrecision::Relaxed
        );
    }

    #[test]
    fn imprecise_beats_relaxed() {
        assert_eq!(
            FloatPrecision::from_pragma_keys(["fp_relaxed", "fp_imprecise"]),
            FloatPrecision::Imprecise
        );
        assert_eq!(
            FloatPrecision::from_pragma_keys(["fp_imprecise", "fp_relaxed"]),
            FloatPrecision::Imprecise
        );
    }

    #[test]
    fn pragma_key_roundtrips() {
        for p in [FloatPrecision::Full, FloatPrecision::Relaxed, FloatPrecision::Imprecise] {
            assert_eq!(FloatPrecision::from_pragma_keys(p.pragma_key()), p);
        }
    }

    #[test]
    fn parse_names() {
        assert_eq!("full".parse::<FloatPrecision>(), Ok(FloatPrecision::Full));
        assert_eq!(" Relaxed ".parse::<FloatPrecision>(), Ok(FloatPrecision::Relaxed));
        assert_eq!("IMPRECISE".parse::<FloatPrecision>(), Ok(FloatPrecision::Imprecise));
        assert!("double".parse::<FloatPrecision>().is_err());
    }

    #[test]
    fn display_honours_width() {
        assert_eq!(format!("{:<9}|", FloatPrecision::Full), "full     |");
        assert_eq!(format!("{:>9}", FloatPrecision::Relaxed), "  relaxed");
    }

    #[test]
    fn display_roundtrips_through_parse() {
        for p in [FloatPrecision::Full, FloatPrecision::Relaxed, FloatPrecision::Imprecise] {
            assert_eq!(p.to_string().parse::<FloatPrecision>(), Ok(p));
        }
    }
}
