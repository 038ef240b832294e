//! Concrete `Policy` implementations. Pluggable: the Scheduler Driver only
//! ever depends on the `Policy` trait.

pub mod greedy;
