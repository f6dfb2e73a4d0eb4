// File: src/history/core/ids.rs

//! Identifier types for the conversation history.
//!
//! Topics and message pairs are keyed by UUID newtypes so a pair id can never
//! be passed where a topic id is expected. Both serialize as plain UUID
//! strings, which is also the primary key format used by the storage adapters.
//!
//! ## Cargo features used by this module
//! - `uuid_v7`: enables `UUIDv7` generation via `uuid/v7`.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate an ID intended to have good DB insert locality.
///
/// With feature `uuid_v7` enabled, this uses `Uuid::now_v7()`.
/// Otherwise it falls back to `Uuid::new_v4()`.
#[inline]
#[must_use]
fn uuid_time_ordered() -> Uuid {
    #[cfg(feature = "uuid_v7")]
    {
        Uuid::now_v7()
    }
    #[cfg(not(feature = "uuid_v7"))]
    {
        Uuid::new_v4()
    }
}

/// Declare a UUID newtype with a consistent API.
macro_rules! define_uuid_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[repr(transparent)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl Default for $name {
            #[inline]
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            /// Create a new identifier.
            #[inline]
            #[must_use]
            pub fn new() -> Self {
                Self(uuid_time_ordered())
            }

            /// Wrap an existing UUID.
            #[inline]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Borrow the underlying UUID.
            #[inline]
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            #[inline]
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            #[inline]
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

define_uuid_id!(
    /// Identifier of a topic in the classification tree.
    TopicId
);

impl TopicId {
    /// Identifier of the root topic.
    ///
    /// Fixed across sessions: persisted children keep pointing at the same root
    /// after a restart.
    pub const ROOT: Self = Self(Uuid::from_u128(0x0000_0000_0000_4000_8000_0000_0000_0001));

    /// Whether this is the root topic id.
    #[inline]
    #[must_use]
    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

define_uuid_id!(
    /// Identifier of a message pair (one user/assistant exchange).
    PairId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_id_is_stable() {
        let parsed: TopicId = "00000000-0000-4000-8000-000000000001".parse().unwrap();
        assert_eq!(parsed, TopicId::ROOT);
        assert!(parsed.is_root());
        assert!(!TopicId::new().is_root());
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = PairId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: PairId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
