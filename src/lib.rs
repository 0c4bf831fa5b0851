#![doc = include_str!("../README.md")]

mod core;
pub use self::core::*;

extern crate alloc;
extern crate color_eyre;
extern crate tracing;
extern crate tracing_subscriber;
