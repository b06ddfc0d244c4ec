//! OS process identifiers.
//!
//! Attach requests may carry the process id either as a JSON integer or as
//! its decimal string form. Both normalize to the same [`ProcessId`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of an operating-system process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawProcessId", into = "u32")]
pub struct ProcessId(u32);

impl ProcessId {
    /// Creates a process id from its numeric value.
    pub const fn new(pid: u32) -> Self {
        Self(pid)
    }

    /// Returns the numeric value.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Id of the calling process.
    pub fn current() -> Self {
        Self(std::process::id())
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        Self(pid)
    }
}

impl From<ProcessId> for u32 {
    fn from(pid: ProcessId) -> Self {
        pid.0
    }
}

impl FromStr for ProcessId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let pid = trimmed
            .parse::<u32>()
            .map_err(|_| DomainError::invalid("processId", s, "a non-negative integer"))?;
        Self::try_from(u64::from(pid))
    }
}

impl TryFrom<u64> for ProcessId {
    type Error = DomainError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        // pid 0 never names a debuggable process
        match u32::try_from(value) {
            Ok(0) | Err(_) => Err(DomainError::invalid(
                "processId",
                value,
                "a positive 32-bit integer",
            )),
            Ok(pid) => Ok(Self(pid)),
        }
    }
}

/// Wire form of a process id: integer or string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawProcessId {
    Number(u64),
    Text(String),
}

impl TryFrom<RawProcessId> for ProcessId {
    type Error = DomainError;

    fn try_from(raw: RawProcessId) -> Result<Self, Self::Error> {
        match raw {
            RawProcessId::Number(n) => Self::try_from(n),
            RawProcessId::Text(s) => s.parse(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_and_string_resolve_identically() {
        let from_int: ProcessId = serde_json::from_str("4242").unwrap();
        let from_str: ProcessId = serde_json::from_str("\"4242\"").unwrap();
        assert_eq!(from_int, from_str);
        assert_eq!(from_int.as_u32(), 4242);
    }

    #[test]
    fn test_rejects_non_numeric_string() {
        assert!(serde_json::from_str::<ProcessId>("\"abc\"").is_err());
        assert!("12x".parse::<ProcessId>().is_err());
    }

    #[test]
    fn test_rejects_zero_and_negative() {
        assert!(serde_json::from_str::<ProcessId>("0").is_err());
        assert!(serde_json::from_str::<ProcessId>("-5").is_err());
        assert!(serde_json::from_str::<ProcessId>("\"0\"").is_err());
    }

    #[test]
    fn test_serializes_as_integer() {
        let json = serde_json::to_string(&ProcessId::new(17)).unwrap();
        assert_eq!(json, "17");
    }

    #[test]
    fn test_from_str_trims_whitespace() {
        assert_eq!(" 99 ".parse::<ProcessId>().unwrap(), ProcessId::new(99));
    }
}
