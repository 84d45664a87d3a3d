//! Domain module for task transactions
//!
//! Identities, lifecycle state, results and errors.

pub mod errors;
pub mod value_objects;

pub use errors::*;
pub use value_objects::*;
