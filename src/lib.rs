pub mod actions;
pub mod analysis;
pub mod config;
#[cfg(unix)]
pub mod daemon;
pub mod error;
pub mod feedback;
pub mod index;
pub mod ingest;
pub mod kb;
pub mod output;
pub mod registry;
pub mod search;
pub mod server;
pub mod store;
pub mod transcribe;
