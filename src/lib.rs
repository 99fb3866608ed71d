//! toolpool - pooled, fault-tolerant connections to external tool servers

pub mod catalog;
pub mod config;
pub mod facade;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod transport;

pub use config::Config;
pub use facade::PooledToolFacade;
pub use manager::ConnectionManager;
pub use pool::PoolError;
