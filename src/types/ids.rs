//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.
//! Trace ids travel end-to-end through `X-Trace-Id`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `as_str()`, Display, Serialize, Deserialize.
/// Optionally generates `new()` (UUID v4) and `Default` if `uuid` flag is passed.
macro_rules! define_id {
    ($name:ident, uuid) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(TraceId, uuid);
define_id!(JobId);

impl TraceId {
    /// Use the caller's trace id when it is usable, otherwise mint one.
    ///
    /// Caller ids are propagated unchanged; only empty or oversized values
    /// (which would blow up log lines and metric labels) are replaced.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if !v.is_empty() && v.len() <= 128 && v.is_ascii() => Self(v.to_string()),
            _ => Self::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_propagates_caller_value() {
        let id = TraceId::from_header(Some("abc-123"));
        assert_eq!(id.as_str(), "abc-123");
    }

    #[test]
    fn test_trace_id_minted_when_missing_or_blank() {
        assert!(!TraceId::from_header(None).as_str().is_empty());
        assert_ne!(TraceId::from_header(Some("  ")).as_str(), "  ");
    }

    #[test]
    fn test_trace_id_rejects_oversized() {
        let long = "x".repeat(200);
        assert_ne!(TraceId::from_header(Some(&long)).as_str(), long);
    }

    #[test]
    fn test_empty_job_id_rejected() {
        assert!(JobId::from_string(String::new()).is_err());
    }
}
