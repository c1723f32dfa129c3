//! Room-booking service: per-(room, date) conflict resolution behind a
//! PostgreSQL-wire front end, with WAL-backed durability.

mod auth;
mod compactor;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod tenant;
pub mod tls;
mod wal;
pub mod wire;
