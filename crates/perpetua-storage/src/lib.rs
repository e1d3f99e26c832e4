//! Postgres-backed stores for the Perpetua engine.
//!
//! `PgStores` implements the core store traits over sqlx; `SecretCipher`
//! provides envelope encryption for provider API keys. The in-memory
//! reference backend lives in `perpetua_core::memory`.

pub mod encryption;
pub mod models;
pub mod repositories;
pub mod stores;

pub use encryption::{generate_secret_key, SecretCipher};
pub use repositories::Database;
pub use stores::PgStores;
