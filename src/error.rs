//! Error taxonomy for the resource manager core.
//!
//! Every component boundary returns one of these variants rather than
//! unwinding; the RPC layer maps them to an explicit wire status instead of
//! propagating exceptions.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RtrmError {
    /// A request exceeds a resource's `total - reserved`.
    #[error("resource capacity exceeded for {path}: requested {requested}, available {available}")]
    ResourceCapacityExceeded {
        path: String,
        requested: u64,
        available: u64,
    },

    /// A composite Acquire could not satisfy a whole request and was rolled back.
    #[error("accounting over-commit on view {view}: {path} short by {short}")]
    AccountingOverCommit {
        view: u64,
        path: String,
        short: u64,
    },

    /// A lifecycle transition was requested from an illegal state.
    #[error("illegal lifecycle transition for exc {uid}: {from:?} -> {to:?}")]
    Lifecycle {
        uid: u64,
        from: String,
        to: String,
    },

    /// The EXC did not acknowledge a sync phase within its timeout.
    #[error("sync timeout for exc {uid} at phase {phase}")]
    SyncTimeout { uid: u64, phase: String },

    /// The EXC replied FAILED at SyncChange or PostChange.
    #[error("sync failed for exc {uid} at phase {phase}")]
    SyncFailed { uid: u64, phase: String },

    /// The platform proxy refused to enforce a decision.
    #[error("platform proxy refused to enforce for exc {uid}: {reason}")]
    PlatformFatal { uid: u64, reason: String },

    /// An RPC to a peer timed out or the connection failed.
    #[error("peer {id} unreachable: {reason}")]
    PeerUnreachable { id: u32, reason: String },

    /// Configuration was invalid at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A resource path was malformed or violated the path invariants.
    #[error("invalid resource path {0:?}")]
    InvalidPath(String),

    /// Lookup of a resource, view, EXC, or peer that does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, RtrmError>;
