//! Siemens S7 protocol adapter

mod adapter;

pub use adapter::S7Adapter;
