//! BMS Field Service
//!
//! Site configuration loading for the `bms` binary.

pub mod site;
