//! Version descriptors and their ordering.
//!
//! A version string such as `1.2.0-SNAPSHOT` or `2_1-rc` is split on `.`, `_`
//! and `-` into integer and string tokens. Trailing zero integers are dropped,
//! so `1.0.0` and `1` describe the same version, and the `SNAPSHOT` marker is
//! remembered as a flag without taking part in comparisons.
//!
//! # Ordering
//!
//! Tokens are compared pairwise:
//! - integers compare numerically, strings case-insensitively
//! - an integer is always greater than a string at the same position
//!   (`1.0` > `1.0-rc`)
//! - a missing token behaves like the integer `0`, so a dangling string
//!   suffix makes a version smaller (`1.0-alpha` < `1.0`) while a dangling
//!   non-zero integer makes it greater (`1.0.1` > `1.0`)

use crate::common::{SNAPSHOT_MARKER, VERSION_SEPARATORS};
use crate::errors::{DarwinError, DarwinResult, ErrorKind};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A single component of a version.
#[derive(Debug, Clone)]
pub enum VersionToken {
    Number(u64),
    Text(String),
}

impl VersionToken {
    pub fn is_number(&self) -> bool {
        matches!(self, VersionToken::Number(_))
    }

    fn compare(&self, other: &VersionToken) -> Ordering {
        match (self, other) {
            (VersionToken::Number(a), VersionToken::Number(b)) => a.cmp(b),
            (VersionToken::Number(_), VersionToken::Text(_)) => Ordering::Greater,
            (VersionToken::Text(_), VersionToken::Number(_)) => Ordering::Less,
            (VersionToken::Text(a), VersionToken::Text(b)) => a
                .chars()
                .flat_map(char::to_lowercase)
                .cmp(b.chars().flat_map(char::to_lowercase)),
        }
    }
}

impl Display for VersionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionToken::Number(n) => write!(f, "{}", n),
            VersionToken::Text(s) => write!(f, "{}", s),
        }
    }
}

const ZERO: VersionToken = VersionToken::Number(0);

/// A parsed, immutable version.
///
/// Equality and ordering only look at the token sequence; the original text and
/// the pre-release flag are kept for display and storage.
///
/// # Examples
///
/// ```rust
/// use darwin::version::VersionDescriptor;
///
/// let a = VersionDescriptor::parse("1.0.0-SNAPSHOT").unwrap();
/// let b = VersionDescriptor::parse("1").unwrap();
/// assert_eq!(a, b);
/// assert!(a.is_prerelease());
/// ```
#[derive(Debug, Clone)]
pub struct VersionDescriptor {
    original: String,
    tokens: SmallVec<[VersionToken; 4]>,
    prerelease: bool,
}

impl VersionDescriptor {
    /// Parses a version string.
    ///
    /// # Errors
    ///
    /// Returns a `PatchFormat` error when the text contains no tokens.
    pub fn parse(text: &str) -> DarwinResult<VersionDescriptor> {
        let original = text.trim();
        let mut tokens: SmallVec<[VersionToken; 4]> = SmallVec::new();
        let mut prerelease = false;

        for part in original.split(&VERSION_SEPARATORS[..]) {
            if part.is_empty() {
                continue;
            }
            if let Ok(number) = part.parse::<u64>() {
                tokens.push(VersionToken::Number(number));
            } else if part.eq_ignore_ascii_case(SNAPSHOT_MARKER) {
                prerelease = true;
            } else {
                tokens.push(VersionToken::Text(part.to_string()));
            }
        }

        if tokens.is_empty() {
            log::error!("Cannot parse version from '{}'", text);
            return Err(DarwinError::new(
                &format!("Invalid version '{}': no version tokens found", text),
                ErrorKind::PatchFormat,
            ));
        }

        Ok(VersionDescriptor {
            original: original.to_string(),
            tokens: truncate_trailing_zeros(tokens),
            prerelease,
        })
    }

    /// The text this descriptor was parsed from.
    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn tokens(&self) -> &[VersionToken] {
        &self.tokens
    }

    pub fn is_prerelease(&self) -> bool {
        self.prerelease
    }

    /// Compares two versions, see the module documentation for the rules.
    pub fn compare(&self, other: &VersionDescriptor) -> Ordering {
        let length = self.tokens.len().max(other.tokens.len());
        for index in 0..length {
            // missing tokens are the integer 0, also after a string token:
            // "1.a" > "1.a.b" and "1.a.b" < "1.a"
            let mine = self.tokens.get(index).unwrap_or(&ZERO);
            let theirs = other.tokens.get(index).unwrap_or(&ZERO);
            let result = mine.compare(theirs);
            if result != Ordering::Equal {
                return result;
            }
        }
        Ordering::Equal
    }

    /// Compares optional versions where an absent version is the smallest one.
    ///
    /// # Errors
    ///
    /// Comparing a present version against an absent one is a contract
    /// violation and returns an `InvalidOperation` error.
    pub fn compare_optional(
        left: Option<&VersionDescriptor>,
        right: Option<&VersionDescriptor>,
    ) -> DarwinResult<Ordering> {
        match (left, right) {
            (None, None) => Ok(Ordering::Equal),
            (None, Some(_)) => Ok(Ordering::Less),
            (Some(version), None) => Err(DarwinError::new(
                &format!("Cannot compare version {} against a missing version", version),
                ErrorKind::InvalidOperation,
            )),
            (Some(left), Some(right)) => Ok(left.compare(right)),
        }
    }
}

// Integer tokens after the last non-zero integer are dropped, string tokens are
// always kept. When there is no non-zero integer the first integer survives, so
// "0" stays a valid version.
fn truncate_trailing_zeros(tokens: SmallVec<[VersionToken; 4]>) -> SmallVec<[VersionToken; 4]> {
    let keep_until = tokens
        .iter()
        .rposition(|token| matches!(token, VersionToken::Number(n) if *n != 0))
        .or_else(|| tokens.iter().position(VersionToken::is_number));

    match keep_until {
        None => tokens,
        Some(limit) => tokens
            .into_iter()
            .enumerate()
            .filter(|(index, token)| *index <= limit || !token.is_number())
            .map(|(_, token)| token)
            .collect(),
    }
}

impl PartialEq for VersionDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for VersionDescriptor {}

impl PartialOrd for VersionDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl Display for VersionDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (index, token) in self.tokens.iter().enumerate() {
            if index > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", token)?;
        }
        Ok(())
    }
}

impl FromStr for VersionDescriptor {
    type Err = DarwinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionDescriptor::parse(s)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for VersionDescriptor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.original)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for VersionDescriptor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        VersionDescriptor::parse(&text).map_err(serde::de::Error::custom)
    }
}
