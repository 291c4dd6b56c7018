pub mod clock;
pub mod config;
pub mod errors;
pub mod lock;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod telemetry;
