pub mod cache;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod indexes;
pub mod manager;
pub mod model;
pub mod queue;
pub mod registry;
pub mod store;
pub mod sync;
pub mod template;
pub mod time_sync;
pub mod utils;
pub mod vector;

pub use error::{PromptError, Result};
pub use manager::PromptManager;

/// Loads a `.env` file from the working directory if present, silently
/// ignoring its absence. Environment variables set some other way always
/// win — `Config::load` applies env overrides after this.
pub fn load_env() {
    let _ = dotenvy::dotenv();
}
