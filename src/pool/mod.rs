//! Connection pooling with circuit breaking.
//!
//! One [`ConnectionPool`] exists per tool server. Each pool owns its
//! connections, a [`CircuitBreaker`], and background loops for health checks
//! and idle eviction.

pub mod circuit;
pub mod connection;

pub use circuit::{BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitStats};
pub use connection::{
    ConnectionId, ConnectionLease, ConnectionPool, ConnectionState, PoolConfig, PoolCounts,
    PoolError, PooledConnection,
};
