//! BMS Types - Core data model for the field device polling core
//!
//! This crate contains the pure data structures shared by the runtime and the
//! binary: devices, points, cached values, write commands and the error
//! taxonomy. It performs no I/O.

mod candidate;
mod command;
mod device;
mod error;
mod point;
mod priority;
mod value;

pub use candidate::*;
pub use command::*;
pub use device::*;
pub use error::*;
pub use point::*;
pub use priority::*;
pub use value::*;
