//! Recipe/AWM model (C3), EXC lifecycle, and the
//! Application Registry (C4).

pub mod exc;
pub mod recipe;
pub mod registry;

pub use exc::{make_uid, Exc, ExcFlags, ExcState, SyncState};
pub use recipe::{Awm, BoundRequest, Constraints, Recipe};
pub use registry::{ApplicationRegistry, SharedRegistry};
