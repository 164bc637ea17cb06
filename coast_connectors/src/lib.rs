//! Connectors for remote gridded ocean data providers

pub mod griddap;

pub use griddap::Griddap;
