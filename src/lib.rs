#![allow(
    clippy::upper_case_acronyms,
    non_camel_case_types,
    clippy::too_many_arguments,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]
// #![allow(warnings)]

pub mod builder;
pub mod bus;
pub mod cache;
pub mod config;
pub mod event;
pub mod fifo;
pub mod mem_obj;
pub mod memory;
pub mod mshr;
pub mod port;
pub mod request;
pub mod router;
pub mod sim;
pub mod stats;
pub mod sync;
pub mod tag_array;
pub mod trace;

#[cfg(test)]
pub mod testing;

pub type address = u64;

/// Simulated time in clock cycles.
pub type Cycle = u64;

pub use builder::{build, Hierarchy};
pub use config::Config;
pub use sim::Simulator;
