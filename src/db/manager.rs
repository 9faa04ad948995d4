use crate::config::{DatabaseConfig as ConfigDatabaseConfig, DbType as ConfigDbType};
use crate::db::{CrawlStateStore, DatabaseError, EmoteStore, GuildStore, UsageStore};
use std::sync::Arc;
use tracing::info;

#[cfg(feature = "postgres")]
use crate::db::postgres::{
    PostgresCrawlStateStore, PostgresEmoteStore, PostgresGuildStore, PostgresUsageStore,
};
#[cfg(feature = "postgres")]
use diesel::RunQueryDsl;
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{
    SqliteCrawlStateStore, SqliteEmoteStore, SqliteGuildStore, SqliteUsageStore,
    establish_connection,
};

const POSTGRES_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS emote_usages (
        guild_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        emote_id TEXT NOT NULL,
        sent_at BIGINT NOT NULL,
        usages INTEGER NOT NULL,
        PRIMARY KEY (guild_id, user_id, sent_at, emote_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS custom_emote_metadata (
        id BIGINT PRIMARY KEY,
        name TEXT NOT NULL,
        animated BOOLEAN NOT NULL DEFAULT FALSE,
        guild_id BIGINT
    )
    "#,
    "CREATE TABLE IF NOT EXISTS guilds (id BIGINT PRIMARY KEY)",
    r#"
    CREATE TABLE IF NOT EXISTS channels (
        channel_id BIGINT PRIMARY KEY,
        guild_id BIGINT NOT NULL,
        latest_parsed_id BIGINT,
        earliest_parsed_id BIGINT,
        latest_unparsed_id BIGINT,
        catch_up_newest_id BIGINT,
        phase TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_emote_usages_user ON emote_usages(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_emote_usages_emote ON emote_usages(emote_id)",
    "CREATE INDEX IF NOT EXISTS idx_emote_usages_sent_at ON emote_usages(sent_at)",
    "CREATE INDEX IF NOT EXISTS idx_custom_emote_metadata_guild ON custom_emote_metadata(guild_id)",
];

// Usage rows are clustered on the natural key; secondary indexes serve the
// user, emote and time predicates of report queries.
const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS emote_usages (
        guild_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        emote_id TEXT NOT NULL,
        sent_at INTEGER NOT NULL,
        usages INTEGER NOT NULL,
        PRIMARY KEY (guild_id, user_id, sent_at, emote_id)
    ) WITHOUT ROWID
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS custom_emote_metadata (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        animated INTEGER NOT NULL DEFAULT 0,
        guild_id INTEGER
    )
    "#,
    "CREATE TABLE IF NOT EXISTS guilds (id INTEGER PRIMARY KEY)",
    r#"
    CREATE TABLE IF NOT EXISTS channels (
        channel_id INTEGER PRIMARY KEY,
        guild_id INTEGER NOT NULL,
        latest_parsed_id INTEGER,
        earliest_parsed_id INTEGER,
        latest_unparsed_id INTEGER,
        catch_up_newest_id INTEGER,
        phase TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_emote_usages_user ON emote_usages(user_id)",
    "CREATE INDEX IF NOT EXISTS idx_emote_usages_emote ON emote_usages(emote_id)",
    "CREATE INDEX IF NOT EXISTS idx_emote_usages_sent_at ON emote_usages(sent_at)",
    "CREATE INDEX IF NOT EXISTS idx_custom_emote_metadata_guild ON custom_emote_metadata(guild_id)",
];

const DROP_TABLES: &[&str] = &[
    "DROP TABLE IF EXISTS emote_usages",
    "DROP TABLE IF EXISTS custom_emote_metadata",
    "DROP TABLE IF EXISTS guilds",
    "DROP TABLE IF EXISTS channels",
];

const WIPE_DATA: &[&str] = &[
    "DELETE FROM emote_usages",
    "DELETE FROM custom_emote_metadata",
    "DELETE FROM guilds",
    "DELETE FROM channels",
];

const RESET_CRAWL_STATE: &[&str] = &["DELETE FROM channels"];

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    usage_store: Arc<dyn UsageStore>,
    emote_store: Arc<dyn EmoteStore>,
    crawl_state_store: Arc<dyn CrawlStateStore>,
    guild_store: Arc<dyn GuildStore>,
    db_type: DbType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

impl From<ConfigDbType> for DbType {
    fn from(value: ConfigDbType) -> Self {
        match value {
            ConfigDbType::Postgres => DbType::Postgres,
            ConfigDbType::Sqlite => DbType::Sqlite,
        }
    }
}

impl DatabaseManager {
    pub async fn new(config: &ConfigDatabaseConfig) -> Result<Self, DatabaseError> {
        let db_type = DbType::from(config.db_type());

        match db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let connection_string = config.connection_string();
                let max_connections = config.max_connections();
                let min_connections = config.min_connections();

                let manager = ConnectionManager::<PgConnection>::new(connection_string);

                let builder = r2d2::Pool::builder()
                    .max_size(max_connections.unwrap_or(10))
                    .min_idle(Some(min_connections.unwrap_or(1)));

                let pool = builder
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                Ok(Self {
                    usage_store: Arc::new(PostgresUsageStore::new(pool.clone())),
                    emote_store: Arc::new(PostgresEmoteStore::new(pool.clone())),
                    crawl_state_store: Arc::new(PostgresCrawlStateStore::new(pool.clone())),
                    guild_store: Arc::new(PostgresGuildStore::new(pool.clone())),
                    postgres_pool: Some(pool),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    db_type,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config.sqlite_path().ok_or_else(|| {
                    DatabaseError::Connection("sqlite database path is missing".to_string())
                })?;
                let path_arc = Arc::new(path.clone());

                Ok(Self {
                    #[cfg(feature = "postgres")]
                    postgres_pool: None,
                    usage_store: Arc::new(SqliteUsageStore::new(path_arc.clone())),
                    emote_store: Arc::new(SqliteEmoteStore::new(path_arc.clone())),
                    crawl_state_store: Arc::new(SqliteCrawlStateStore::new(path_arc.clone())),
                    guild_store: Arc::new(SqliteGuildStore::new(path_arc)),
                    sqlite_path: Some(path),
                    db_type,
                })
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        let statements = match self.db_type {
            DbType::Postgres => POSTGRES_SCHEMA,
            DbType::Sqlite => SQLITE_SCHEMA,
        };
        self.execute_statements(statements, DatabaseError::Migration)
            .await?;
        info!("database schema is up to date db_type={:?}", self.db_type);
        Ok(())
    }

    pub async fn drop_tables(&self) -> Result<(), DatabaseError> {
        self.execute_statements(DROP_TABLES, DatabaseError::Migration)
            .await?;
        info!("dropped all tables");
        Ok(())
    }

    pub async fn wipe_data(&self) -> Result<(), DatabaseError> {
        self.execute_statements(WIPE_DATA, DatabaseError::Query)
            .await?;
        info!("wiped all stored data");
        Ok(())
    }

    /// Forgets every crawl cursor so channels are backfilled from scratch.
    pub async fn reset_crawl_state(&self) -> Result<(), DatabaseError> {
        self.execute_statements(RESET_CRAWL_STATE, DatabaseError::Query)
            .await?;
        info!("reset crawl state for all channels");
        Ok(())
    }

    async fn execute_statements(
        &self,
        statements: &'static [&'static str],
        on_error: fn(String) -> DatabaseError,
    ) -> Result<(), DatabaseError> {
        match self.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let pool = self.postgres_pool.clone().ok_or_else(|| {
                    DatabaseError::Connection("postgres pool is not initialized".to_string())
                })?;
                tokio::task::spawn_blocking(move || {
                    let mut conn = pool
                        .get()
                        .map_err(|e| DatabaseError::Connection(e.to_string()))?;
                    for statement in statements {
                        diesel::sql_query(*statement)
                            .execute(&mut conn)
                            .map_err(|e| on_error(e.to_string()))?;
                    }
                    Ok(())
                })
                .await
                .map_err(|e| on_error(format!("database task failed: {e}")))?
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = self.sqlite_path.clone().ok_or_else(|| {
                    DatabaseError::Connection("sqlite path is not initialized".to_string())
                })?;
                tokio::task::spawn_blocking(move || {
                    use diesel::RunQueryDsl;

                    let mut conn = establish_connection(&path)?;
                    for statement in statements {
                        diesel::sql_query(*statement)
                            .execute(&mut conn)
                            .map_err(|e| on_error(e.to_string()))?;
                    }
                    Ok(())
                })
                .await
                .map_err(|e| on_error(format!("database task failed: {e}")))?
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(on_error("PostgreSQL feature not enabled".to_string())),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(on_error("SQLite feature not enabled".to_string())),
        }
    }

    pub fn usage_store(&self) -> Arc<dyn UsageStore> {
        self.usage_store.clone()
    }

    pub fn emote_store(&self) -> Arc<dyn EmoteStore> {
        self.emote_store.clone()
    }

    pub fn crawl_state_store(&self) -> Arc<dyn CrawlStateStore> {
        self.crawl_state_store.clone()
    }

    pub fn guild_store(&self) -> Arc<dyn GuildStore> {
        self.guild_store.clone()
    }
}

#[cfg(all(test, feature = "sqlite"))]
pub(crate) mod tests {
    use tempfile::NamedTempFile;

    use super::DatabaseManager;
    use crate::config::DatabaseConfig;
    use crate::db::{ChannelCrawlState, CrawlPhase, EmoteMetadata, UsageEvent, UsageFilter};

    pub(crate) fn sqlite_config(file: &NamedTempFile) -> DatabaseConfig {
        DatabaseConfig {
            url: None,
            conn_string: None,
            filename: Some(file.path().to_string_lossy().to_string()),
            max_connections: Some(1),
            min_connections: Some(1),
        }
    }

    pub(crate) async fn sqlite_manager(file: &NamedTempFile) -> DatabaseManager {
        let manager = DatabaseManager::new(&sqlite_config(file))
            .await
            .expect("db manager");
        manager.migrate().await.expect("migrate");
        manager
    }

    fn usage(guild_id: u64, user_id: u64, emote_id: &str, sent_at: i64, usages: u32) -> UsageEvent {
        UsageEvent {
            guild_id,
            user_id,
            emote_id: emote_id.to_string(),
            sent_at,
            usages,
        }
    }

    #[tokio::test]
    async fn sqlite_usage_upsert_is_idempotent_and_survives_reopen() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let store = manager.usage_store();

        let events = vec![usage(1, 2, "🤔", 1_000, 2), usage(1, 2, "👌", 1_000, 1)];
        store.upsert_usages(&events).await.expect("first upsert");
        store.upsert_usages(&events).await.expect("second upsert");

        let rows = store
            .fetch_filtered(&UsageFilter::default())
            .await
            .expect("fetch");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().map(|row| row.usages).sum::<u32>(), 3);

        store
            .upsert_usages(&[usage(1, 2, "🤔", 1_000, 5)])
            .await
            .expect("overwrite");

        let reopened = DatabaseManager::new(&sqlite_config(&file))
            .await
            .expect("db manager reopened");
        reopened.migrate().await.expect("migrate reopened");
        let thinking = reopened
            .usage_store()
            .fetch_filtered(&UsageFilter {
                emote_ids: Some(vec!["🤔".to_string()]),
                ..UsageFilter::default()
            })
            .await
            .expect("fetch after reopen");
        assert_eq!(thinking, vec![usage(1, 2, "🤔", 1_000, 5)]);
    }

    #[tokio::test]
    async fn sqlite_filtered_fetch_and_delete() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let store = manager.usage_store();

        store
            .upsert_usages(&[
                usage(1, 10, "🤔", 100, 1),
                usage(1, 11, "🤔", 200, 1),
                usage(2, 10, "👌", 300, 1),
                usage(2, 10, "🤔", 300, 4),
            ])
            .await
            .expect("upsert");

        let guild_two = store
            .fetch_filtered(&UsageFilter {
                guild_ids: Some(vec![2]),
                since: Some(150),
                ..UsageFilter::default()
            })
            .await
            .expect("guild filter");
        assert_eq!(guild_two.len(), 2);

        let user_ten_recent = store
            .fetch_filtered(&UsageFilter {
                user_ids: Some(vec![10]),
                since: Some(100),
                ..UsageFilter::default()
            })
            .await
            .expect("user filter");
        assert!(user_ten_recent.iter().all(|row| row.sent_at == 300));

        let removed = store
            .delete_usages(2, 10, 300, Some("👌"))
            .await
            .expect("delete single emote");
        assert_eq!(removed, 1);
        let removed = store
            .delete_usages(2, 10, 300, None)
            .await
            .expect("delete message");
        assert_eq!(removed, 1);

        let remaining = store
            .fetch_filtered(&UsageFilter::default())
            .await
            .expect("fetch remaining");
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn sqlite_emote_metadata_guild_association() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let store = manager.emote_store();

        store
            .record_emote_metadata(&[
                EmoteMetadata {
                    id: 5,
                    name: "pog".to_string(),
                    animated: false,
                    guild_id: Some(100),
                },
                EmoteMetadata {
                    id: 6,
                    name: "dance".to_string(),
                    animated: true,
                    guild_id: Some(100),
                },
            ])
            .await
            .expect("record");

        let mut ids = store.fetch_guild_emote_ids(100).await.expect("guild emotes");
        ids.sort_unstable();
        assert_eq!(ids, vec![5, 6]);

        store.unset_emote_guild(5).await.expect("unset");
        store
            .update_emotes_guild(200, &[6, 7])
            .await
            .expect("update guild");

        let metadata = store
            .fetch_emote_metadata(&[5, 6, 7])
            .await
            .expect("fetch metadata");
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata[&5].guild_id, None);
        assert_eq!(metadata[&6].guild_id, Some(200));
        assert!(metadata[&6].animated);
        assert!(store.fetch_guild_emote_ids(100).await.expect("empty").is_empty());
    }

    #[tokio::test]
    async fn sqlite_crawl_state_upsert_clears_cursors() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let store = manager.crawl_state_store();

        let mut state = ChannelCrawlState::new(42, 7, 9_000);
        state.catch_up_newest_id = Some(8_000);
        store.upsert_crawl_state(&state).await.expect("insert");

        state.catch_up_newest_id = None;
        state.latest_parsed_id = Some(8_000);
        state.phase = CrawlPhase::Backfilling;
        store.upsert_crawl_state(&state).await.expect("update");

        let states = store.fetch_crawl_states(&[42]).await.expect("fetch");
        assert_eq!(states, vec![state.clone()]);
        assert_eq!(store.fetch_crawl_states(&[]).await.expect("all").len(), 1);

        manager.reset_crawl_state().await.expect("reset");
        assert!(store.fetch_crawl_states(&[]).await.expect("none").is_empty());
    }

    #[tokio::test]
    async fn sqlite_guild_registry_and_maintenance() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = sqlite_manager(&file).await;
        let guilds = manager.guild_store();

        guilds.record_guilds(&[3, 1, 3]).await.expect("record");
        guilds.record_guilds(&[1]).await.expect("record again");
        assert_eq!(guilds.fetch_guilds().await.expect("fetch"), vec![1, 3]);

        guilds.remove_guilds(&[3]).await.expect("remove");
        assert_eq!(guilds.fetch_guilds().await.expect("fetch"), vec![1]);

        manager.wipe_data().await.expect("wipe");
        assert!(guilds.fetch_guilds().await.expect("fetch").is_empty());

        manager.drop_tables().await.expect("drop");
        assert!(guilds.fetch_guilds().await.is_err());
        manager.migrate().await.expect("recreate");
        assert!(guilds.fetch_guilds().await.expect("fetch").is_empty());
    }
}
