//! `custodian-memory` – Durable agent state.
//!
//! Everything the agent must remember across restarts (the enforced
//! allow-list, the kiosk package, capability grants, geofence containment)
//! lives in one local SQLite database.
//!
//! # Modules
//!
//! - [`state_db`] – [`StateDb`][state_db::StateDb]: a key/value store of JSON
//!   documents implementing [`custodian_types::StateStore`].

pub mod state_db;

pub use state_db::{StateDb, StateDbError};
