//! statig state machines.

pub mod lifecycle_sm;
