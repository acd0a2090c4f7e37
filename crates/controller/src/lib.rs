pub mod app;
pub mod cmd;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export main modules
pub use domain::allocator;
pub use domain::orchestrator;
pub use domain::registry;
pub use domain::supervisor;
pub use infrastructure::logging;
