/// Builder wiring a node from configuration, transport and runners.
pub mod builder;
/// Node runtime: announcement, tick, scheduler and poll loops plus the job
/// lifecycle.
pub mod supervisor;

pub use builder::NodeRuntimeBuilder;
pub use supervisor::{NodeRuntime, RunnerId, ShutdownToken};
