pub use self::parser::{
    Config, DatabaseConfig, DbType, DiscordConfig, LoggingConfig, ReportsConfig, TrackerConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
