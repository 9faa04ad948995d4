use thiserror::Error;

use crate::db::DatabaseError;

pub mod engine;
pub mod filters;
pub mod render;

pub use self::engine::{AggregationEngine, Report, ReportOptions, ReportRow};
pub use self::filters::{FilterError, FilterLimits, FilterSpec, GroupBy, Invocation, Visibility};
pub use self::render::render_report;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error(transparent)]
    Validation(#[from] FilterError),
    #[error("failed to query emote usage: {0}")]
    Store(#[from] DatabaseError),
}
