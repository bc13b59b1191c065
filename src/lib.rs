//! Scalable concurrent size tracking for striped hash tables.
//!
//! # tally::Tally
//! A striped counter that lets many threads record signed size deltas without contending on a
//! single memory location, while readers obtain an approximate, eventually-consistent total.
//!
//! # tally::ResizeCoordinator
//! A lock-free state machine arbitrating which thread begins a structural resize, which threads
//! assist it, and which one completes the generation, with disjoint migration ranges handed out
//! through a shared claim cursor.
//!
//! # tally::SizeControl
//! The two combined behind the boundary a concurrent hash table consumes: record a delta after
//! every insert or remove, read the approximate size, and obtain a resize directive.
//!
//! ## Features
//!
//! - `serde`: `Serialize`/`Deserialize` implementations for [`Tally`].

mod exit_guard;

pub mod resize;
pub use resize::{Directive, ResizeCoordinator};

pub mod size_control;
pub use size_control::SizeControl;

pub mod tally;
pub use tally::Tally;

#[cfg(feature = "serde")]
mod serde;
