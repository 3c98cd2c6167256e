//! Common types used across the protocol.

use rkyv::{Archive, Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
            PartialOrd, Ord,
        )]
        #[rkyv(compare(PartialEq))]
        pub struct $name(pub u64);

        impl $name {
            /// Wraps a raw identifier value.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw identifier value.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

id_type! {
    /// Identifier of a registered worker.
    ///
    /// Allocated by the scheduler, monotonically increasing, never reused
    /// within a cluster lifetime.
    WorkerId
}

id_type! {
    /// Identifier of a registered object store.
    ObjStoreId
}

id_type! {
    /// Reference to a logical object whose payload may or may not yet exist
    /// in any object store.
    ObjRef
}

id_type! {
    /// Identifier of a submitted task.
    OperationId
}

/// Correlation ID for request/response matching.
///
/// Uses ULID format (128-bit, lexicographically sortable, monotonic).
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[rkyv(compare(PartialEq))]
pub struct CorrelationId(pub [u8; 16]);

impl CorrelationId {
    /// Creates a new correlation ID from the current timestamp.
    #[must_use]
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_bytes())
    }

    /// Creates a correlation ID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes of this correlation ID.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Converts to a ULID for display purposes.
    #[must_use]
    pub fn to_ulid(&self) -> ulid::Ulid {
        ulid::Ulid::from_bytes(self.0)
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_ulid())
    }
}
