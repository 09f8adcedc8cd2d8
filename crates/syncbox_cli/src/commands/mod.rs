//! CLI command implementations.

pub mod decode;
pub mod inspect;
pub mod purge;
pub mod requeue;
pub mod simulate;
pub mod sweep;
pub mod tables;
