use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A user identity: a mobile number in loosely E.164 shape.
///
/// This is the routing key for everything — the directory maps an `Msisdn`
/// to at most one live connection, and every signaling message addresses
/// its parties by it. The stored form is normalized (whitespace, dashes and
/// parentheses stripped), so two spellings of the same number compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Msisdn(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MsisdnError {
    #[error("mobile number is empty")]
    Empty,
    #[error("mobile number contains invalid character {0:?}")]
    InvalidCharacter(char),
    #[error("mobile number has {0} digits, expected 7 to 15")]
    BadLength(usize),
}

impl Msisdn {
    pub fn new(raw: &str) -> Result<Self, MsisdnError> {
        let mut normalized = String::with_capacity(raw.len());
        for (i, ch) in raw.trim().chars().enumerate() {
            match ch {
                '+' if i == 0 => normalized.push('+'),
                '0'..='9' => normalized.push(ch),
                ' ' | '-' | '(' | ')' => {}
                other => return Err(MsisdnError::InvalidCharacter(other)),
            }
        }
        if normalized.is_empty() {
            return Err(MsisdnError::Empty);
        }
        let digits = normalized.chars().filter(char::is_ascii_digit).count();
        if !(7..=15).contains(&digits) {
            return Err(MsisdnError::BadLength(digits));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Msisdn {
    type Err = MsisdnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Msisdn {
    type Error = MsisdnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Msisdn> for String {
    fn from(value: Msisdn) -> Self {
        value.0
    }
}

impl fmt::Display for Msisdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let m: Msisdn = "+1 (555) 010-2000".parse().unwrap();
        assert_eq!(m.as_str(), "+15550102000");
        assert_eq!(m.to_string(), "+15550102000");
    }

    #[test]
    fn test_plain_digits_accepted() {
        assert!("5550102000".parse::<Msisdn>().is_ok());
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!("".parse::<Msisdn>(), Err(MsisdnError::Empty));
        assert_eq!(
            "+1555abc".parse::<Msisdn>(),
            Err(MsisdnError::InvalidCharacter('a'))
        );
        assert_eq!("+123".parse::<Msisdn>(), Err(MsisdnError::BadLength(3)));
        // '+' not in leading position
        assert_eq!(
            "555+0102000".parse::<Msisdn>(),
            Err(MsisdnError::InvalidCharacter('+'))
        );
    }

    #[test]
    fn test_serde_round_trip_validates() {
        let m: Msisdn = serde_json::from_str("\"+15550102000\"").unwrap();
        assert_eq!(serde_json::to_string(&m).unwrap(), "\"+15550102000\"");
        assert!(serde_json::from_str::<Msisdn>("\"not-a-number\"").is_err());
    }
}
