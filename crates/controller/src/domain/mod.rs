pub mod allocator;
pub mod error;
pub mod instance;
pub mod mock;
pub mod occupancy;
pub mod orchestrator;
pub mod registry;
pub mod supervisor;
pub mod traits;
pub mod types;

pub use allocator::Allocator;
pub use allocator::GpuSet;
pub use allocator::PortPolicy;
pub use error::LifecycleError;
pub use occupancy::OccupancyPolicy;
pub use orchestrator::LifecycleOrchestrator;
pub use registry::ProcessRegistry;
pub use supervisor::ProcessSupervisor;
pub use supervisor::RestartPolicy;
pub use supervisor::SupervisorSettings;
