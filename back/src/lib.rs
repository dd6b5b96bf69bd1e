#![deny(unsafe_op_in_unsafe_fn)]

pub mod back;
pub mod engine;
pub mod registry;
pub mod sync;
pub mod tlmu;

pub mod harness;
pub mod script;
