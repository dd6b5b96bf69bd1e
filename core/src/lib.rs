#![deny(unsafe_op_in_unsafe_fn)]

/// Implementation of emulated memories.
pub mod mem;
/// Address map of the shared bus.
pub mod dev;

/// Implementation of an abstract system bus.
pub mod bus;
