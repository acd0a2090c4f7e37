//! Helpers shared by the controller binaries: logging setup and build version.

pub mod logging;
pub mod version;
