// Home Medic
// Monitoring-and-healing control loop for a fleet of Home Assistant instances

pub mod cascade;
pub mod cli;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod error;
pub mod healing;
pub mod ingest;
pub mod monitor;
pub mod network;
pub mod notify;
pub mod observability;
pub mod signals;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod testing;

pub use error::{MedicError, MedicResult};
pub use supervisor::Supervisor;
