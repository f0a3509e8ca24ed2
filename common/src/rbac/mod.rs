// Role-based authorization: an immutable policy snapshot and the evaluator
// that answers allow/deny questions against it

pub mod matching;
pub mod snapshot;

pub use snapshot::{BuildReport, PolicySnapshot};
