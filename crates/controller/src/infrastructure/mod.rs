pub mod gpu_init;
pub mod health_probe;
pub mod launcher;
pub mod logging;
pub mod process_table;
pub mod telemetry;
