//! Sieve's reachability engine
//!
//! [`symbolic`] gives EVM instructions a bit-precise meaning over z3 bitvectors, and
//! [`reachability`] replays every recorded path to an `INVALID` block through it to decide
//! whether the block can ever execute.

pub mod reachability;
pub mod result;
pub mod symbolic;

pub use reachability::{
    InvalidStatus, InvalidVerdict, PathOutcome, ReachabilityConfig, ReachabilityReport,
    analyze_reachability, check_path,
};
pub use result::{Error, Result};
pub use symbolic::{StackItem, SymbolicExecutor, SymbolicState};
