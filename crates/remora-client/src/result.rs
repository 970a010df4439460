//! Operation outcomes.

use bytes::Bytes;

/// The outcome of one cache operation.
///
/// Expected server answers and expected infrastructure trouble are both
/// values of this enum; `Err` is reserved for protocol violations. In
/// particular [`OperationResult::WrongVBucket`] is its own variant so a
/// caller can refresh topology and resubmit — the client itself never
/// retries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// The operation succeeded. `data` is empty for mutations.
    Success {
        /// CAS token of the affected item.
        cas: u64,
        /// Stored flags (get-style operations).
        flags: u32,
        /// Decoded value bytes.
        data: Bytes,
    },
    /// Counter operation succeeded; the new counter value.
    Counter(u64),
    /// The key does not exist.
    Miss,
    /// A conditional store's condition was not met (exists/absent/CAS).
    NotStored,
    /// The addressed server no longer owns the key's vbucket; routing
    /// is stale.
    WrongVBucket,
    /// No live node could be found for the key.
    NoNode,
    /// The operation failed: connect/receive trouble, pool exhaustion,
    /// or an unexpected server status.
    Failed(String),
}

impl OperationResult {
    /// True for [`OperationResult::Success`] and
    /// [`OperationResult::Counter`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Counter(_))
    }

    /// The value bytes of a successful get, if any.
    pub fn data(&self) -> Option<&Bytes> {
        match self {
            Self::Success { data, .. } => Some(data),
            _ => None,
        }
    }

    /// The CAS token of a successful operation, if any.
    pub fn cas(&self) -> Option<u64> {
        match self {
            Self::Success { cas, .. } => Some(*cas),
            _ => None,
        }
    }
}
