//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix reserved for ids the engine host generates for itself (health probes).
/// Caller-assigned query ids may never start with it.
pub const RESERVED_ID_PREFIX: &str = "__";

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `as_str()`, Display, Serialize, and a Deserialize that
/// goes through the type's own `from_string()` validation.
macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Test helper: construct from a literal known to be valid.
            #[cfg(test)]
            #[allow(clippy::expect_used)]
            pub(crate) fn must(s: &str) -> Self {
                Self::from_string(s.to_string()).expect("valid test id")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = &'static str;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::from_string(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(QueryId);
define_id!(CallerId);

impl QueryId {
    /// Validate a caller-assigned correlation id.
    pub fn from_string(s: String) -> Result<Self, &'static str> {
        if s.is_empty() {
            return Err("QueryId cannot be empty");
        }
        if s.starts_with(RESERVED_ID_PREFIX) {
            return Err("QueryId uses the reserved \"__\" prefix");
        }
        if s.contains('\n') {
            return Err("QueryId cannot contain a newline");
        }
        Ok(Self(s))
    }

    /// Engine-assigned id for requests that arrive without one.
    pub(crate) fn generated(seq: u64) -> Self {
        Self(format!("q{}", seq))
    }

    /// Health probe id, outside the caller id space.
    pub(crate) fn probe(seq: u64) -> Self {
        Self(format!("{}probe_{}", RESERVED_ID_PREFIX, seq))
    }

    /// Rebuild an id read back from the engine's output stream. No validation:
    /// the reader only uses it to look up an entry it registered itself.
    pub(crate) fn from_wire(s: String) -> Self {
        Self(s)
    }

    /// Whether this id belongs to the reserved probe space.
    pub fn is_reserved(&self) -> bool {
        self.0.starts_with(RESERVED_ID_PREFIX)
    }
}

impl CallerId {
    pub fn from_string(s: String) -> Result<Self, &'static str> {
        if s.is_empty() {
            return Err("CallerId cannot be empty");
        }
        Ok(Self(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_id_rejects_reserved_prefix() {
        assert!(QueryId::from_string("__probe_1".to_string()).is_err());
        assert!(QueryId::from_string(String::new()).is_err());
        assert!(QueryId::from_string("a\nb".to_string()).is_err());
        assert!(QueryId::from_string("q1".to_string()).is_ok());
    }

    #[test]
    fn test_generated_and_probe_ids_do_not_collide() {
        let generated = QueryId::generated(3);
        let probe = QueryId::probe(3);
        assert_eq!(generated.as_str(), "q3");
        assert_eq!(probe.as_str(), "__probe_3");
        assert!(!generated.is_reserved());
        assert!(probe.is_reserved());
        assert_ne!(generated, probe);
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let caller = CallerId::must("client-1");
        assert_eq!(serde_json::to_string(&caller).unwrap(), "\"client-1\"");
        let back: CallerId = serde_json::from_str("\"client-1\"").unwrap();
        assert_eq!(back, caller);
    }

    #[test]
    fn test_deserialize_validates() {
        let query: QueryId = serde_json::from_str("\"q12\"").unwrap();
        assert_eq!(query.as_str(), "q12");

        assert!(serde_json::from_str::<QueryId>("\"__probe_1\"").is_err());
        assert!(serde_json::from_str::<QueryId>("\"\"").is_err());
        assert!(serde_json::from_str::<CallerId>("\"\"").is_err());

        // Probe ids still serialize; they only cannot come back in.
        assert_eq!(serde_json::to_string(&QueryId::probe(1)).unwrap(), "\"__probe_1\"");
    }
}
