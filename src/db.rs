pub use self::error::DatabaseError;
pub use self::manager::DatabaseManager;
pub use self::models::{ChannelCrawlState, CrawlPhase, EmoteMetadata, UsageEvent, UsageFilter};
pub use self::stores::{CrawlStateStore, EmoteStore, GuildStore, UsageStore};

pub mod error;
pub mod manager;
pub mod models;
mod rows;
pub mod schema;
pub mod stores;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;
