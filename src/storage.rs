use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}, Row};
use uuid::Uuid;

use crate::delivery::{DeadLetter, DeadLetterSink};
use crate::recommendation::{normalize_name, PoiDetail};
use crate::session::{Message, MessageKind, Role, Session, SessionStatus};

/// One call to the generation service, kept for auditing and POI provenance.
#[derive(Debug, Clone)]
pub struct InteractionRecord {
    pub session_id: Option<Uuid>,
    pub user_id: Uuid,
    pub task: String,
    pub prompt: String,
    pub response: String,
    pub model_name: String,
    pub latency_ms: i64,
    pub city_name: Option<String>,
}

#[async_trait]
pub trait TravelRepository: Send + Sync {
    async fn save_interaction(&self, record: &InteractionRecord) -> anyhow::Result<Uuid>;
    async fn find_or_create_city(&self, name: &str, country: &str) -> anyhow::Result<Uuid>;
    async fn poi_exists(&self, city_id: Uuid, name: &str) -> anyhow::Result<bool>;
    /// Returns false when the city already has a POI with that name.
    async fn upsert_poi(&self, poi: &PoiDetail, city_id: Uuid) -> anyhow::Result<bool>;
    async fn save_personalized_pois(
        &self,
        user_id: Uuid,
        city_id: Uuid,
        interaction_id: Option<Uuid>,
        pois: &[PoiDetail],
    ) -> anyhow::Result<usize>;
    async fn save_session(&self, session: &Session) -> anyhow::Result<()>;
    async fn load_session(&self, id: Uuid) -> anyhow::Result<Option<Session>>;
    async fn append_history_message(&self, session_id: Uuid, msg: &Message) -> anyhow::Result<()>;
    async fn record_dead_letter(&self, entry: &DeadLetter) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct SqliteRepository {
    pool: Pool<Sqlite>,
}

impl SqliteRepository {
    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        // busy_timeout via PRAGMA
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }

    async fn load_history(&self, session_id: Uuid) -> anyhow::Result<Vec<Message>> {
        let rows = sqlx::query("SELECT id, role, kind, content, created_at FROM session_messages WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC")
            .bind(session_id.to_string())
            .fetch_all(&self.pool).await?;
        rows.into_iter().map(|m| -> anyhow::Result<Message> {
            let id: String = m.get("id");
            let role: String = m.get("role");
            let kind: String = m.get("kind");
            let created_at: String = m.get("created_at");
            Ok(Message {
                id: Uuid::parse_str(&id)?,
                role: serde_json::from_value::<Role>(serde_json::Value::String(role))?,
                kind: serde_json::from_value::<MessageKind>(serde_json::Value::String(kind))?,
                content: m.get("content"),
                created_at: parse_ts(&created_at)?,
            })
        }).collect()
    }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("travel_relay");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("travel.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn kind_str(kind: MessageKind) -> String {
    serde_json::to_value(kind).ok().and_then(|v| v.as_str().map(String::from)).unwrap_or_default()
}

#[async_trait]
impl TravelRepository for SqliteRepository {
    async fn save_interaction(&self, record: &InteractionRecord) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO llm_interactions (id, session_id, user_id, task, prompt, response, model_name, latency_ms, city_name, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)")
            .bind(id.to_string())
            .bind(record.session_id.map(|s| s.to_string()))
            .bind(record.user_id.to_string())
            .bind(&record.task)
            .bind(&record.prompt)
            .bind(&record.response)
            .bind(&record.model_name)
            .bind(record.latency_ms)
            .bind(&record.city_name)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool).await?;
        Ok(id)
    }

    async fn find_or_create_city(&self, name: &str, country: &str) -> anyhow::Result<Uuid> {
        let (name_key, country_key) = (normalize_name(name), normalize_name(country));
        if name_key.is_empty() {
            anyhow::bail!("city name is empty");
        }
        sqlx::query("INSERT INTO cities (id, name, country, name_key, country_key, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6) ON CONFLICT(name_key, country_key) DO NOTHING")
            .bind(Uuid::new_v4().to_string())
            .bind(name.trim())
            .bind(country.trim())
            .bind(&name_key)
            .bind(&country_key)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool).await?;
        let row = sqlx::query("SELECT id FROM cities WHERE name_key = ?1 AND country_key = ?2")
            .bind(&name_key)
            .bind(&country_key)
            .fetch_one(&self.pool).await?;
        let id: String = row.get("id");
        Ok(Uuid::parse_str(&id)?)
    }

    async fn poi_exists(&self, city_id: Uuid, name: &str) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT count(*) as c FROM pois WHERE city_id = ?1 AND name_key = ?2")
            .bind(city_id.to_string())
            .bind(normalize_name(name))
            .fetch_one(&self.pool).await?;
        Ok(row.get::<i64, _>("c") > 0)
    }

    async fn upsert_poi(&self, poi: &PoiDetail, city_id: Uuid) -> anyhow::Result<bool> {
        let res = sqlx::query("INSERT INTO pois (id, city_id, name, name_key, category, description, latitude, longitude, interaction_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) ON CONFLICT(city_id, name_key) DO NOTHING")
            .bind(poi.id.to_string())
            .bind(city_id.to_string())
            .bind(&poi.name)
            .bind(normalize_name(&poi.name))
            .bind(&poi.category)
            .bind(&poi.description)
            .bind(poi.latitude)
            .bind(poi.longitude)
            .bind(poi.interaction_id.map(|i| i.to_string()))
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool).await?;
        Ok(res.rows_affected() > 0)
    }

    async fn save_personalized_pois(
        &self,
        user_id: Uuid,
        city_id: Uuid,
        interaction_id: Option<Uuid>,
        pois: &[PoiDetail],
    ) -> anyhow::Result<usize> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();
        for (position, poi) in pois.iter().enumerate() {
            sqlx::query("INSERT INTO personalized_pois (id, user_id, city_id, interaction_id, position, name, category, description, latitude, longitude, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)")
                .bind(Uuid::new_v4().to_string())
                .bind(user_id.to_string())
                .bind(city_id.to_string())
                .bind(interaction_id.map(|i| i.to_string()))
                .bind(position as i64)
                .bind(&poi.name)
                .bind(&poi.category)
                .bind(&poi.description)
                .bind(poi.latitude)
                .bind(poi.longitude)
                .bind(&now)
                .execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(pois.len())
    }

    async fn save_session(&self, session: &Session) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO sessions (id, user_id, status, current_result_json, context_json, settings_json, created_at, updated_at, expires_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(id) DO UPDATE SET status = excluded.status, current_result_json = excluded.current_result_json, context_json = excluded.context_json, settings_json = excluded.settings_json, updated_at = excluded.updated_at, expires_at = excluded.expires_at")
            .bind(session.id.to_string())
            .bind(session.user_id.to_string())
            .bind(session.status.as_str())
            .bind(serde_json::to_string(&session.current_result)?)
            .bind(serde_json::to_string(&session.context)?)
            .bind(serde_json::to_string(&session.settings)?)
            .bind(session.created_at.to_rfc3339())
            .bind(session.updated_at.to_rfc3339())
            .bind(session.expires_at.to_rfc3339())
            .execute(&mut *tx).await?;
        for msg in &session.history {
            sqlx::query("INSERT OR IGNORE INTO session_messages (id, session_id, role, kind, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)")
                .bind(msg.id.to_string())
                .bind(session.id.to_string())
                .bind(msg.role.as_str())
                .bind(kind_str(msg.kind))
                .bind(&msg.content)
                .bind(msg.created_at.to_rfc3339())
                .execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_session(&self, id: Uuid) -> anyhow::Result<Option<Session>> {
        let row = sqlx::query("SELECT id, user_id, status, current_result_json, context_json, settings_json, created_at, updated_at, expires_at FROM sessions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(r) = row else { return Ok(None) };
        let user_id: String = r.get("user_id");
        let status: String = r.get("status");
        let current_result: String = r.get("current_result_json");
        let context: String = r.get("context_json");
        let settings: String = r.get("settings_json");
        let created_at: String = r.get("created_at");
        let updated_at: String = r.get("updated_at");
        let expires_at: String = r.get("expires_at");
        let session = Session {
            id,
            user_id: Uuid::parse_str(&user_id)?,
            status: SessionStatus::parse(&status).ok_or_else(|| anyhow::anyhow!("unknown session status {status}"))?,
            current_result: serde_json::from_str(&current_result)?,
            history: self.load_history(id).await?,
            context: serde_json::from_str(&context)?,
            settings: serde_json::from_str(&settings)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
            expires_at: parse_ts(&expires_at)?,
        };
        Ok(Some(session))
    }

    async fn append_history_message(&self, session_id: Uuid, msg: &Message) -> anyhow::Result<()> {
        sqlx::query("INSERT OR IGNORE INTO session_messages (id, session_id, role, kind, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)")
            .bind(msg.id.to_string())
            .bind(session_id.to_string())
            .bind(msg.role.as_str())
            .bind(kind_str(msg.kind))
            .bind(&msg.content)
            .bind(msg.created_at.to_rfc3339())
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn record_dead_letter(&self, entry: &DeadLetter) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO dead_letters (id, session_id, event_id, event_type, reason, attempts, payload_json, failed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)")
            .bind(Uuid::new_v4().to_string())
            .bind(entry.session_id.map(|s| s.to_string()))
            .bind(&entry.event.id)
            .bind(entry.event.event_type.as_str())
            .bind(entry.reason.as_str())
            .bind(entry.attempts as i64)
            .bind(serde_json::to_string(&entry.event)?)
            .bind(entry.failed_at.to_rfc3339())
            .execute(&self.pool).await?;
        Ok(())
    }
}

/// Dead-letter sink persisting entries through a repository.
pub struct RepositorySink(pub Arc<dyn TravelRepository>);

#[async_trait]
impl DeadLetterSink for RepositorySink {
    async fn record(&self, entry: &DeadLetter) -> anyhow::Result<()> {
        self.0.record_dead_letter(entry).await
    }
}

#[cfg(test)]
pub async fn test_repository() -> (SqliteRepository, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    let url = format!("sqlite://{}", path.to_string_lossy());
    let repo = SqliteRepository::initialize(Some(url)).await.unwrap();
    (repo, dir)
}
