//! The collector: mark phase, victim selection, and relocation, wired
//! together into a single collection cycle.

pub mod collector;
pub mod marker;
pub mod relocate;
pub mod safepoint;
pub mod worklist;

pub use collector::{CollectInfo, Collector};
pub use marker::RootProvider;
