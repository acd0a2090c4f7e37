//! Application module
//!
//! Wiring of the lifecycle services and the daemon lifecycle.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::ApplicationServices;
