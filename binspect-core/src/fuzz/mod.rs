//! Fuzzing: mutating a binary at the points the analyzer found interesting
//! (`spec.md` §4.H, §4.I).

pub mod fuzzer;
pub mod generators;

pub use fuzzer::{fuzz, FuzzError, FuzzOptions, FuzzReport};
