use crate::models::Conversation;
use anyhow::{Context, Result};
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};

// Define the database schema using CREATE TABLE IF NOT EXISTS statements.
// The store is a plain key-value slot table; the conversation list lives
// under a single key as one JSON blob.
const MIGRATIONS_SQL: &str = "
CREATE TABLE IF NOT EXISTS slots (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

// The one named slot the chat client owns.
const CONVERSATIONS_SLOT: &str = "chat_conversations";

#[derive(Debug)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    /// Default database location under the platform-local data directory.
    /// Overridable with STREAMCHAT_DB_PATH.
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("STREAMCHAT_DB_PATH") {
            return Ok(PathBuf::from(path));
        }
        let base = dirs::data_local_dir().context("Failed to resolve local data directory")?;
        Ok(base.join("streamchat").join("streamchat.sqlite"))
    }

    /// Opens (creating if necessary) the database and runs migrations.
    pub async fn open(db_path: &Path) -> Result<Self> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        log::info!("Connecting to database: {}", db_url);

        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(&db_url)
                .await
                .context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    /// Loads the persisted conversation list. A missing slot is an empty
    /// history; a malformed slot is logged, deleted, and also treated as
    /// empty rather than failing the session.
    pub async fn load(&self) -> Result<Vec<Conversation>> {
        log::debug!("Loading conversation list from slot '{}'", CONVERSATIONS_SLOT);

        let row = sqlx::query("SELECT value FROM slots WHERE key = ?")
            .bind(CONVERSATIONS_SLOT)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read conversation slot from database")?;

        let Some(row) = row else {
            log::info!("No stored conversations found");
            return Ok(Vec::new());
        };

        let raw: String = row
            .try_get("value")
            .context("Failed to read conversation slot value")?;

        match serde_json::from_str::<Vec<Conversation>>(&raw) {
            Ok(conversations) => {
                log::info!("Loaded {} stored conversations", conversations.len());
                Ok(conversations)
            }
            Err(e) => {
                log::error!("Failed to parse stored conversations, discarding slot: {}", e);
                self.delete_slot(CONVERSATIONS_SLOT).await?;
                Ok(Vec::new())
            }
        }
    }

    /// Persists the entire conversation list as a single JSON blob,
    /// overwriting any prior value.
    pub async fn save(&self, conversations: &[Conversation]) -> Result<()> {
        log::debug!("Saving {} conversations to slot '{}'", conversations.len(), CONVERSATIONS_SLOT);

        let blob =
            serde_json::to_string(conversations).context("Failed to serialize conversations")?;

        sqlx::query(
            r#"
            INSERT INTO slots (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(CONVERSATIONS_SLOT)
        .bind(blob)
        .execute(&self.pool)
        .await
        .context("Failed to write conversation slot to database")?;

        log::info!("Saved {} conversations", conversations.len());
        Ok(())
    }

    async fn delete_slot(&self, key: &str) -> Result<()> {
        log::warn!("Deleting slot '{}'", key);
        sqlx::query("DELETE FROM slots WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .context("Failed to delete slot from database")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, Role};

    async fn temp_store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConversationStore::open(&dir.path().join("test.sqlite"))
            .await
            .expect("open store");
        (dir, store)
    }

    fn sample_conversation(id: &str, title: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            title: title.to_string(),
            messages: vec![Message::user("hello"), Message::model_placeholder()],
            created_at: chrono::Utc::now(),
            last_updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_slot_loads_as_empty_history() {
        let (_dir, store) = temp_store().await;
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_overwrites_the_previous_value() {
        let (_dir, store) = temp_store().await;

        store.save(&[sample_conversation("1", "first")]).await.unwrap();
        store
            .save(&[
                sample_conversation("1", "first"),
                sample_conversation("2", "second"),
            ])
            .await
            .unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "1");
        assert_eq!(loaded[1].id, "2");
        assert_eq!(loaded[1].messages.len(), 2);
        assert_eq!(loaded[1].messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn malformed_slot_is_discarded_and_removed() {
        let (_dir, store) = temp_store().await;

        sqlx::query("INSERT INTO slots (key, value) VALUES (?, ?)")
            .bind(CONVERSATIONS_SLOT)
            .bind("{ this is not json")
            .execute(&store.pool)
            .await
            .unwrap();

        // Startup completes with an empty list...
        assert!(store.load().await.unwrap().is_empty());

        // ...and the invalid slot is gone.
        let row = sqlx::query("SELECT value FROM slots WHERE key = ?")
            .bind(CONVERSATIONS_SLOT)
            .fetch_optional(&store.pool)
            .await
            .unwrap();
        assert!(row.is_none());
    }
}
