//! SQLite persistence for the catalog

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::{info, instrument};

use super::{new_id, normalize_address, CreateUserInput, CreateVideoInput, UserRecord, VideoRecord};
use crate::error::{Error, Result};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    walletAddress TEXT NOT NULL PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS videos (
    id TEXT NOT NULL PRIMARY KEY,
    title TEXT NOT NULL,
    duration INTEGER NOT NULL DEFAULT 0,
    description TEXT NOT NULL,
    likes INTEGER NOT NULL DEFAULT 0,
    dislikes INTEGER NOT NULL DEFAULT 0,
    uploaded_at TEXT NOT NULL,
    views INTEGER NOT NULL DEFAULT 0,
    walletAddress TEXT NOT NULL REFERENCES users(walletAddress) ON DELETE CASCADE,
    videoCommp TEXT NOT NULL,
    thumbnailCommp TEXT NOT NULL,
    category TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_videos_uploaded_at ON videos(uploaded_at);
CREATE INDEX IF NOT EXISTS idx_videos_wallet ON videos(walletAddress);
"#;

const VIDEO_COLUMNS: &str = "id, title, description, videoCommp, thumbnailCommp, walletAddress, \
     category, uploaded_at, views, likes, dislikes, duration";

pub struct CatalogStore {
    pool: Pool<Sqlite>,
}

impl CatalogStore {
    /// Open (creating if missing) the database at `url` and apply the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection: SQLite serializes writers anyway, and `sqlite::memory:`
        // is private to a connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("Catalog database ready at {}", url);
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Register a wallet; registering it again is a no-op
    #[instrument(skip(self, input))]
    pub async fn create_user(&self, input: CreateUserInput) -> Result<UserRecord> {
        let input = input.normalized()?;
        sqlx::query("INSERT INTO users (walletAddress) VALUES (?) ON CONFLICT(walletAddress) DO NOTHING")
            .bind(&input.wallet_address)
            .execute(&self.pool)
            .await?;
        Ok(UserRecord {
            wallet_address: input.wallet_address,
        })
    }

    /// Insert a video, registering its author first when needed
    pub async fn create_video(&self, input: CreateVideoInput) -> Result<VideoRecord> {
        self.insert_video_at(input, Utc::now()).await
    }

    #[instrument(skip(self, input), fields(title = %input.title))]
    pub(crate) async fn insert_video_at(
        &self,
        input: CreateVideoInput,
        uploaded_at: DateTime<Utc>,
    ) -> Result<VideoRecord> {
        let input = input.normalized()?;
        let record = VideoRecord {
            id: new_id(),
            title: input.title,
            description: input.description.unwrap_or_default(),
            video_commp: input.video_commp,
            thumbnail_commp: input.thumbnail_commp,
            wallet_address: input.author_address,
            category: input.category,
            uploaded_at: uploaded_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            views: 0,
            likes: 0,
            dislikes: 0,
            duration: 0,
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO users (walletAddress) VALUES (?) ON CONFLICT(walletAddress) DO NOTHING")
            .bind(&record.wallet_address)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO videos (id, title, description, videoCommp, thumbnailCommp, walletAddress, \
             category, uploaded_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.video_commp)
        .bind(&record.thumbnail_commp)
        .bind(&record.wallet_address)
        .bind(&record.category)
        .bind(&record.uploaded_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!("Published video {}", record.id);
        Ok(record)
    }

    /// Every video, newest first
    pub async fn list_videos(&self) -> Result<Vec<VideoRecord>> {
        let sql = format!("SELECT {VIDEO_COLUMNS} FROM videos ORDER BY uploaded_at DESC, rowid DESC");
        Ok(sqlx::query_as::<_, VideoRecord>(&sql)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn get_video(&self, id: &str) -> Result<VideoRecord> {
        let sql = format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE id = ?");
        sqlx::query_as::<_, VideoRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFoundError(format!("video {id}")))
    }

    pub async fn videos_by_author(&self, wallet_address: &str) -> Result<Vec<VideoRecord>> {
        let sql = format!(
            "SELECT {VIDEO_COLUMNS} FROM videos WHERE walletAddress = ? \
             ORDER BY uploaded_at DESC, rowid DESC"
        );
        Ok(sqlx::query_as::<_, VideoRecord>(&sql)
            .bind(normalize_address(wallet_address))
            .fetch_all(&self.pool)
            .await?)
    }

    /// Remove a user and, through the foreign key, all of their videos.
    /// Returns false when the user did not exist.
    #[instrument(skip(self))]
    pub async fn delete_user(&self, wallet_address: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE walletAddress = ?")
            .bind(normalize_address(wallet_address))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_users(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
