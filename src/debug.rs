//! Compile-time switches for diagnostic output.

/// Print a line for every collection cycle with cell statistics.
pub const LOG_GC: bool = false;

/// Run a full collection before every allocation.
pub const STRESS_GC: bool = false;

/// Print every executed instruction along with the data stack.
pub const TRACE_EXECUTION: bool = false;
