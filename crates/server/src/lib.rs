//! Kinship server: presence tracking and real-time delivery for the kinship
//! social backend.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod realtime;
pub mod routes;
pub mod state;
pub mod store;
pub mod ws;

pub use config::ServerConfig;
pub use state::AppState;
