//! Module and capability versions.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A `major.minor.micro[.qualifier]` version.
///
/// Missing numeric segments default to zero, so `"1"` and `"1.0.0"` are equal.
/// Qualifiers compare lexically and an empty qualifier sorts first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub micro: u64,
    pub qualifier: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid version '{input}': {reason}")]
pub struct VersionError {
    pub input: String,
    pub reason: &'static str,
}

impl Version {
    pub const fn new(major: u64, minor: u64, micro: u64) -> Self {
        Self {
            major,
            minor,
            micro,
            qualifier: String::new(),
        }
    }

    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = qualifier.into();
        self
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let err = |reason| VersionError {
            input: s.to_string(),
            reason,
        };
        if input.is_empty() {
            return Err(err("empty version"));
        }

        let mut parts = input.splitn(4, '.');
        let mut numbers = [0u64; 3];
        for slot in numbers.iter_mut() {
            match parts.next() {
                Some(p) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => {
                    *slot = p.parse().map_err(|_| err("numeric segment out of range"))?;
                }
                Some(_) => return Err(err("numeric segment expected")),
                None => break,
            }
        }

        let qualifier = parts.next().unwrap_or_default();
        if !qualifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(err("qualifier may only contain [A-Za-z0-9_-]"));
        }
        if qualifier.is_empty() && input.matches('.').count() >= 3 {
            return Err(err("empty qualifier"));
        }

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            micro: numbers[2],
            qualifier: qualifier.to_string(),
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.micro.cmp(&other.micro))
            .then_with(|| self.qualifier.cmp(&other.qualifier))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)?;
        if !self.qualifier.is_empty() {
            write!(f, ".{}", self.qualifier)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_forms_pad_with_zero() {
        assert_eq!("1".parse::<Version>().unwrap(), Version::new(1, 0, 0));
        assert_eq!("1.2".parse::<Version>().unwrap(), Version::new(1, 2, 0));
        assert_eq!(
            "1.2.3.beta".parse::<Version>().unwrap(),
            Version::new(1, 2, 3).with_qualifier("beta")
        );
    }

    #[test]
    fn ordering_is_numeric_then_qualifier() {
        let v = |s: &str| s.parse::<Version>().unwrap();
        assert!(v("1.10") > v("1.9"));
        assert!(v("1.0.0.a") > v("1.0.0"));
        assert!(v("2") > v("1.99.99"));
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Version>().is_err());
        assert!("1.x".parse::<Version>().is_err());
        assert!("1.2.3.".parse::<Version>().is_err());
        assert!("1.2.3.a b".parse::<Version>().is_err());
    }

    #[test]
    fn display_round_trips_canonical_form() {
        assert_eq!(Version::new(1, 2, 0).to_string(), "1.2.0");
        assert_eq!(Version::default().to_string(), "0.0.0");
    }
}
