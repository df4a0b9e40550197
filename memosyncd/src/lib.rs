pub mod config;
pub mod daemon;
pub mod provider;
pub mod sync;
pub mod vault;
