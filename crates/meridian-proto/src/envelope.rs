//! Envelope types for protocol messages.

use rkyv::{Archive, Deserialize, Serialize};

use crate::types::CorrelationId;

/// A protocol envelope containing header metadata and a typed payload.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Envelope<T> {
    /// Envelope header with metadata.
    pub header: EnvelopeHeader,

    /// The message payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Creates a new envelope with the given payload.
    ///
    /// Uses the current protocol version and generates a new correlation ID.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            header: EnvelopeHeader::new(),
            payload,
        }
    }

    /// Creates a response envelope echoing the request's correlation ID.
    #[must_use]
    pub fn response_to(request_header: &EnvelopeHeader, payload: T) -> Self {
        Self {
            header: EnvelopeHeader::response_to(request_header),
            payload,
        }
    }
}

/// Header metadata for all protocol envelopes.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Protocol version.
    ///
    /// Receivers should reject messages with unsupported versions.
    pub version: u16,

    /// Correlation ID for request/response matching.
    ///
    /// Responses must echo the correlation ID from the request. Every chunk
    /// of a streamed response echoes the correlation ID of the request that
    /// opened the stream.
    pub correlation_id: CorrelationId,

    /// Message timestamp in nanoseconds since Unix epoch.
    pub timestamp_ns: u64,
}

impl EnvelopeHeader {
    /// Creates a new header with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: crate::version::CURRENT,
            correlation_id: CorrelationId::new(),
            timestamp_ns: current_timestamp_ns(),
        }
    }

    /// Creates a response header echoing the request's correlation ID.
    #[must_use]
    pub fn response_to(request: &Self) -> Self {
        Self {
            version: crate::version::CURRENT,
            correlation_id: request.correlation_id,
            timestamp_ns: current_timestamp_ns(),
        }
    }

    /// Checks if this message version is compatible.
    #[must_use]
    pub const fn is_compatible(&self) -> bool {
        self.version >= crate::version::MIN_SUPPORTED && self.version <= crate::version::CURRENT
    }
}

impl Default for EnvelopeHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the current timestamp in nanoseconds since Unix epoch.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn current_timestamp_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
