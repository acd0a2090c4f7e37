pub mod cli;
pub mod commands;
pub mod controller;
pub mod daemon;
pub mod models;

pub use cli::*;
pub use commands::*;
pub use controller::*;
pub use daemon::*;
pub use models::*;
