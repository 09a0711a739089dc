pub mod cache;
pub mod config;
pub mod deps;
pub mod postcodes;

pub use cache::{CacheLayer, ttl};
pub use config::AppConfig;
pub use deps::ServerDeps;
pub use postcodes::{PostcodeClient, PostcodeIndex};
