use {
    anyhow::Result,
    async_trait::async_trait,
    sqlx::{Sqlite, SqlitePool, Transaction},
};

use guildrelay_relay::{DeliveryMapping, DeliveryStore, LogicalMessage};

/// Internal row type for sqlx mapping.
#[derive(sqlx::FromRow)]
struct MappingRow {
    guild_id: String,
    channel_id: String,
    local_message_id: String,
    remote_message_id: String,
    endpoint_url: String,
    correlation_token: String,
}

impl From<MappingRow> for DeliveryMapping {
    fn from(r: MappingRow) -> Self {
        Self {
            guild_id: r.guild_id,
            channel_id: r.channel_id,
            local_message_id: r.local_message_id,
            remote_message_id: r.remote_message_id,
            endpoint_url: r.endpoint_url,
            correlation_token: r.correlation_token,
        }
    }
}

const MAPPING_COLUMNS: &str = "guild_id, channel_id, local_message_id, remote_message_id, \
                               endpoint_url, correlation_token";

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// SQLite-backed delivery store.
///
/// Each operation runs in its own transaction; dropping one before commit
/// rolls it back.
pub struct SqliteDeliveryStore {
    pool: SqlitePool,
}

impl SqliteDeliveryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the store's tables if they do not exist yet.
    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS delivery_mappings (
                guild_id          TEXT    NOT NULL,
                channel_id        TEXT    NOT NULL,
                local_message_id  TEXT    NOT NULL,
                remote_message_id TEXT    NOT NULL UNIQUE,
                endpoint_url      TEXT    NOT NULL DEFAULT '',
                correlation_token TEXT    NOT NULL,
                updated_at        INTEGER NOT NULL,
                PRIMARY KEY (guild_id, channel_id, correlation_token)
            )"#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_delivery_mappings_local
               ON delivery_mappings (channel_id, local_message_id)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS channel_endpoints (
                channel_id   TEXT    PRIMARY KEY,
                endpoint_url TEXT    NOT NULL,
                updated_at   INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS relay_messages (
                channel_id TEXT    NOT NULL,
                local_id   TEXT    NOT NULL,
                body       TEXT    NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (channel_id, local_id)
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    async fn fetch_mapping(&self, filter: &str, binds: &[&str]) -> Result<Option<DeliveryMapping>> {
        let sql = format!("SELECT {MAPPING_COLUMNS} FROM delivery_mappings WHERE {filter}");
        let mut query = sqlx::query_as::<_, MappingRow>(&sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        let row = query.fetch_optional(&self.pool).await?;
        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl DeliveryStore for SqliteDeliveryStore {
    async fn upsert_delivery_mapping(&self, mapping: &DeliveryMapping) -> Result<()> {
        let mut tx = self.begin().await?;
        // A remote id belongs to exactly one mapping.
        sqlx::query(
            "DELETE FROM delivery_mappings
              WHERE remote_message_id = ?
                AND NOT (guild_id = ? AND channel_id = ? AND correlation_token = ?)",
        )
        .bind(&mapping.remote_message_id)
        .bind(&mapping.guild_id)
        .bind(&mapping.channel_id)
        .bind(&mapping.correlation_token)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"INSERT INTO delivery_mappings
                 (guild_id, channel_id, local_message_id, remote_message_id,
                  endpoint_url, correlation_token, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(guild_id, channel_id, correlation_token) DO UPDATE SET
                 local_message_id = excluded.local_message_id,
                 remote_message_id = excluded.remote_message_id,
                 endpoint_url = excluded.endpoint_url,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&mapping.guild_id)
        .bind(&mapping.channel_id)
        .bind(&mapping.local_message_id)
        .bind(&mapping.remote_message_id)
        .bind(&mapping.endpoint_url)
        .bind(&mapping.correlation_token)
        .bind(now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mapping_by_token(
        &self,
        guild_id: &str,
        channel_id: &str,
        token: &str,
    ) -> Result<Option<DeliveryMapping>> {
        self.fetch_mapping(
            "guild_id = ? AND channel_id = ? AND correlation_token = ?",
            &[guild_id, channel_id, token],
        )
        .await
    }

    async fn mapping_by_local_id(
        &self,
        channel_id: &str,
        local_message_id: &str,
    ) -> Result<Option<DeliveryMapping>> {
        self.fetch_mapping("channel_id = ? AND local_message_id = ?", &[
            channel_id,
            local_message_id,
        ])
        .await
    }

    async fn mapping_by_remote_id(
        &self,
        remote_message_id: &str,
    ) -> Result<Option<DeliveryMapping>> {
        self.fetch_mapping("remote_message_id = ?", &[remote_message_id])
            .await
    }

    async fn delete_delivery_mapping(
        &self,
        channel_id: &str,
        local_message_id: &str,
    ) -> Result<bool> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            "DELETE FROM delivery_mappings WHERE channel_id = ? AND local_message_id = ?",
        )
        .bind(channel_id)
        .bind(local_message_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_endpoint(&self, channel_id: &str) -> Result<Option<String>> {
        let url: Option<String> =
            sqlx::query_scalar("SELECT endpoint_url FROM channel_endpoints WHERE channel_id = ?")
                .bind(channel_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(url)
    }

    async fn save_endpoint(&self, channel_id: &str, url: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query(
            r#"INSERT INTO channel_endpoints (channel_id, endpoint_url, updated_at)
               VALUES (?, ?, ?)
               ON CONFLICT(channel_id) DO UPDATE SET
                 endpoint_url = excluded.endpoint_url,
                 updated_at = excluded.updated_at"#,
        )
        .bind(channel_id)
        .bind(url)
        .bind(now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn clear_endpoint(&self, channel_id: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM channel_endpoints WHERE channel_id = ?")
            .bind(channel_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_message(&self, message: &LogicalMessage) -> Result<()> {
        let body = serde_json::to_string(message)?;
        let mut tx = self.begin().await?;
        sqlx::query(
            r#"INSERT INTO relay_messages (channel_id, local_id, body, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(channel_id, local_id) DO UPDATE SET
                 body = excluded.body,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&message.channel_id)
        .bind(&message.local_id)
        .bind(&body)
        .bind(now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_message(
        &self,
        channel_id: &str,
        local_id: &str,
    ) -> Result<Option<LogicalMessage>> {
        let body: Option<String> = sqlx::query_scalar(
            "SELECT body FROM relay_messages WHERE channel_id = ? AND local_id = ?",
        )
        .bind(channel_id)
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(body.map(|b| serde_json::from_str::<LogicalMessage>(&b)).transpose()?)
    }

    async fn delete_message(&self, channel_id: &str, local_id: &str) -> Result<bool> {
        let mut tx = self.begin().await?;
        let result = sqlx::query("DELETE FROM relay_messages WHERE channel_id = ? AND local_id = ?")
            .bind(channel_id)
            .bind(local_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
