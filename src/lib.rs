pub mod auth;
pub mod backup;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod tasks;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
