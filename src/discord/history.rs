use async_trait::async_trait;
use thiserror::Error;

/// Largest page the history endpoint serves.
pub const MAX_PAGE_SIZE: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub id: u64,
    pub author_id: u64,
    pub author_bot: bool,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Missing access or unknown channel. The channel will not become readable
    /// by retrying.
    #[error("channel {0} is unavailable")]
    ChannelUnavailable(u64),
    #[error("failed to fetch channel history: {0}")]
    Transient(String),
}

/// Paged access to past messages.
///
/// Pages are newest-first with strictly descending ids, every id is below
/// `before`, and an empty page means the history is exhausted.
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        channel_id: u64,
        before: u64,
        limit: u8,
    ) -> Result<Vec<HistoryMessage>, FetchError>;
}
