//! Precise tracing heap: cells, weak handles, roots and the visitation
//! contract that ties them together.

mod heap;
mod ptr;
mod root;
mod trace;

pub use heap::Heap;
pub use ptr::Ptr;
pub use root::Root;
pub use trace::{Trace, Tracer};
