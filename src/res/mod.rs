//! Resource Tree (C1) and Resource Accounter (C2).

pub mod accounter;
pub mod path;
pub mod tree;

pub use accounter::{ResourceAccounter, COMMITTED_VIEW};
pub use path::{PathSegment, ResourceId, ResourcePath, ResourceType};
pub use tree::{ResourceNode, ResourceTree};
