//! Internal plumbing between the Resource Manager loop and the rest of the
//! process (C17).

pub mod event;

pub use event::{EventBroadcaster, ManagerEvent, ManagerNotification, UserCommand};
