pub mod duration;
pub mod logging;
pub mod snowflake;
