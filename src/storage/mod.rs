//! Durable catalog storage and the connection pool in front of it.

pub mod pool;
pub mod sqlite;

pub use pool::{ConnectionManager, ConnectionPool, PoolStats, PooledConnection};
pub use sqlite::{ApplyReport, CatalogStore, SqliteManager};
