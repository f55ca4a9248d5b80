pub mod clock;
pub mod config;
pub mod database;
pub mod logging;
pub mod models;
pub mod repository;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FleetConfig;
pub use database::{init_database, MySqlSandboxRepository, MySqlTaskRepository};
pub use repository::{SandboxRepository, TaskRepository};
