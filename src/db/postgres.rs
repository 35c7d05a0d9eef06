//! PostgreSQL store.

use std::path::PathBuf;

use async_trait::async_trait;
use deadpool_postgres::{Config, Pool, Runtime};
use secrecy::{ExposeSecret, SecretString};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::cooldown::{Attempt, CooldownChange, CooldownRecord};
use crate::db::{Database, EventFilter};
use crate::error::DatabaseError;
use crate::event::Event;
use crate::memory::{Memory, MemoryChange, MemoryFilter, ScopeFilter};
use crate::session::{Session, SessionOutcome, Tier};

mod embedded {
    refinery::embed_migrations!("migrations");
}

const SESSION_COLUMNS: &str = "id, tier, model, status, started_at, ended_at, exit_code, \
     trigger, prompt, log_path, response, cost_usd, num_turns, duration_ms, parent_id, summary";

const MEMORY_COLUMNS: &str = "id, service, category, observation, confidence, active, \
     created_at, updated_at, session_id, tier, stale_weeks_applied";

/// PostgreSQL-backed [`Database`].
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create a new store and connect to the database.
    pub async fn new(url: &SecretString, pool_size: usize) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(url.expose_secret().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Apply embedded migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        let report = embedded::migrations::runner()
            .run_async(&mut **conn)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        for migration in report.applied_migrations() {
            tracing::info!(
                version = migration.version(),
                name = migration.name(),
                "Applied migration"
            );
        }
        Ok(())
    }

    /// Get a connection from the pool.
    pub async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }
}

// ==================== Row mapping ====================

fn parse_column<T: std::str::FromStr>(row: &Row, column: &str) -> Result<T, DatabaseError>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(column);
    raw.parse()
        .map_err(|e: T::Err| DatabaseError::Serialization(format!("{}: {}", column, e)))
}

fn row_to_session(row: &Row) -> Result<Session, DatabaseError> {
    let tier: i16 = row.get("tier");
    let tier = u8::try_from(tier)
        .ok()
        .and_then(|t| Tier::new(t).ok())
        .ok_or_else(|| DatabaseError::Serialization(format!("tier: {} out of range", tier)))?;
    let log_path: String = row.get("log_path");

    Ok(Session {
        id: row.get("id"),
        tier,
        model: row.get("model"),
        status: parse_column(row, "status")?,
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        exit_code: row.get("exit_code"),
        trigger: parse_column(row, "trigger")?,
        prompt: row.get("prompt"),
        log_path: PathBuf::from(log_path),
        response: row.get("response"),
        cost_usd: row.get("cost_usd"),
        num_turns: row
            .get::<_, Option<i32>>("num_turns")
            .map(|n| column_int(n, "num_turns"))
            .transpose()?,
        duration_ms: row
            .get::<_, Option<i64>>("duration_ms")
            .map(|n| column_int(n, "duration_ms"))
            .transpose()?,
        parent_id: row.get("parent_id"),
        summary: row.get("summary"),
    })
}

/// Checked integer conversion between a field and its column type.
fn column_int<T, U>(value: T, column: &str) -> Result<U, DatabaseError>
where
    T: Copy + std::fmt::Display,
    U: TryFrom<T>,
{
    U::try_from(value).map_err(|_| {
        DatabaseError::Serialization(format!("{} out of range for {}", value, column))
    })
}

fn row_to_event(row: &Row) -> Result<Event, DatabaseError> {
    Ok(Event {
        id: row.get("id"),
        session_id: row.get("session_id"),
        level: parse_column(row, "level")?,
        service: row.get("service"),
        message: row.get("message"),
        created_at: row.get("created_at"),
    })
}

fn row_to_memory(row: &Row) -> Result<Memory, DatabaseError> {
    Ok(Memory {
        id: row.get("id"),
        service: row.get("service"),
        category: parse_column(row, "category")?,
        observation: row.get("observation"),
        confidence: row.get("confidence"),
        active: row.get("active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        session_id: row.get("session_id"),
        tier: row
            .get::<_, Option<i16>>("tier")
            .and_then(|t| u8::try_from(t).ok()),
        stale_weeks_applied: column_int(
            row.get::<_, i32>("stale_weeks_applied"),
            "stale_weeks_applied",
        )?,
    })
}

fn row_to_cooldown(row: &Row) -> Result<CooldownRecord, DatabaseError> {
    let restarts: serde_json::Value = row.get("restarts");
    let redeploys: serde_json::Value = row.get("redeploys");
    Ok(CooldownRecord {
        service: row.get("service"),
        restarts: serde_json::from_value::<Vec<Attempt>>(restarts)?,
        redeploys: serde_json::from_value::<Vec<Attempt>>(redeploys)?,
        consecutive_healthy: column_int(
            row.get::<_, i32>("consecutive_healthy"),
            "consecutive_healthy",
        )?,
    })
}

fn session_not_found(id: Uuid) -> DatabaseError {
    DatabaseError::NotFound {
        entity: "session",
        id: id.to_string(),
    }
}

#[async_trait]
impl Database for PgStore {
    // ==================== Sessions ====================

    async fn create_session(&self, session: &Session) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let tier = i16::from(session.tier.get());
        let log_path = session.log_path.to_string_lossy().to_string();
        let num_turns: Option<i32> = session
            .num_turns
            .map(|n| column_int(n, "num_turns"))
            .transpose()?;
        let duration_ms: Option<i64> = session
            .duration_ms
            .map(|n| column_int(n, "duration_ms"))
            .transpose()?;

        conn.execute(
            r#"
            INSERT INTO sessions (
                id, tier, model, status, started_at, ended_at, exit_code, trigger,
                prompt, log_path, response, cost_usd, num_turns, duration_ms, parent_id, summary
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
            &[
                &session.id,
                &tier,
                &session.model,
                &session.status.as_str(),
                &session.started_at,
                &session.ended_at,
                &session.exit_code,
                &session.trigger.as_str(),
                &session.prompt,
                &log_path,
                &session.response,
                &session.cost_usd,
                &num_turns,
                &duration_ms,
                &session.parent_id,
                &session.summary,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!("SELECT {} FROM sessions WHERE id = $1", SESSION_COLUMNS);
        conn.query_opt(&query, &[&id])
            .await?
            .map(|row| row_to_session(&row))
            .transpose()
    }

    async fn list_sessions(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!(
            "SELECT {} FROM sessions ORDER BY started_at DESC LIMIT $1 OFFSET $2",
            SESSION_COLUMNS
        );
        let rows = conn
            .query(
                &query,
                &[
                    &column_int::<_, i64>(limit, "limit")?,
                    &column_int::<_, i64>(offset, "offset")?,
                ],
            )
            .await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn finish_session(
        &self,
        id: Uuid,
        outcome: &SessionOutcome,
    ) -> Result<Session, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let query = format!(
            "SELECT {} FROM sessions WHERE id = $1 FOR UPDATE",
            SESSION_COLUMNS
        );
        let row = tx
            .query_opt(&query, &[&id])
            .await?
            .ok_or_else(|| session_not_found(id))?;
        let mut session = row_to_session(&row)?;
        if !session.finish(outcome) {
            return Err(DatabaseError::Conflict(format!(
                "session {} is already {}",
                id, session.status
            )));
        }

        let num_turns: Option<i32> = session
            .num_turns
            .map(|n| column_int(n, "num_turns"))
            .transpose()?;
        let duration_ms: Option<i64> = session
            .duration_ms
            .map(|n| column_int(n, "duration_ms"))
            .transpose()?;
        tx.execute(
            r#"
            UPDATE sessions
            SET status = $2, ended_at = $3, exit_code = $4, response = $5,
                cost_usd = $6, num_turns = $7, duration_ms = $8
            WHERE id = $1
            "#,
            &[
                &id,
                &session.status.as_str(),
                &session.ended_at,
                &session.exit_code,
                &session.response,
                &session.cost_usd,
                &num_turns,
                &duration_ms,
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(session)
    }

    async fn set_session_summary(&self, id: Uuid, summary: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE sessions SET summary = $2 WHERE id = $1",
                &[&id, &summary],
            )
            .await?;
        if updated == 0 {
            return Err(session_not_found(id));
        }
        Ok(())
    }

    async fn list_running_sessions(&self) -> Result<Vec<Session>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!(
            "SELECT {} FROM sessions WHERE status = 'running' ORDER BY started_at",
            SESSION_COLUMNS
        );
        let rows = conn.query(&query, &[]).await?;
        rows.iter().map(row_to_session).collect()
    }

    // ==================== Events ====================

    async fn insert_event(&self, event: &Event) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO events (id, session_id, level, service, message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            &[
                &event.id,
                &event.session_id,
                &event.level.as_str(),
                &event.service,
                &event.message,
                &event.created_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>, DatabaseError> {
        let conn = self.conn().await?;
        let level = filter.level.map(|l| l.as_str());
        let limit = filter
            .limit
            .map(|l| column_int::<_, i64>(l, "limit"))
            .transpose()?;
        let rows = conn
            .query(
                r#"
                SELECT id, session_id, level, service, message, created_at
                FROM events
                WHERE ($1::TEXT IS NULL OR level = $1)
                  AND ($2::TEXT IS NULL OR service = $2)
                  AND ($3::UUID IS NULL OR session_id = $3)
                ORDER BY created_at DESC
                LIMIT $4
                "#,
                &[&level, &filter.service, &filter.session_id, &limit],
            )
            .await?;
        rows.iter().map(row_to_event).collect()
    }

    // ==================== Memories ====================

    async fn insert_memory(&self, memory: &Memory) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let tier = memory.tier.map(i16::from);
        let stale: i32 = column_int(memory.stale_weeks_applied, "stale_weeks_applied")?;
        conn.execute(
            r#"
            INSERT INTO memories (
                id, service, category, observation, confidence, active,
                created_at, updated_at, session_id, tier, stale_weeks_applied
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
            &[
                &memory.id,
                &memory.service,
                &memory.category.as_str(),
                &memory.observation,
                &memory.confidence,
                &memory.active,
                &memory.created_at,
                &memory.updated_at,
                &memory.session_id,
                &tier,
                &stale,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_memory(&self, id: Uuid) -> Result<Option<Memory>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!("SELECT {} FROM memories WHERE id = $1", MEMORY_COLUMNS);
        conn.query_opt(&query, &[&id])
            .await?
            .map(|row| row_to_memory(&row))
            .transpose()
    }

    async fn list_memories(&self, filter: &MemoryFilter) -> Result<Vec<Memory>, DatabaseError> {
        let conn = self.conn().await?;
        let (scope, service) = match &filter.scope {
            ScopeFilter::Any => ("any", None),
            ScopeFilter::General => ("general", None),
            ScopeFilter::Service(s) => ("service", Some(s.as_str())),
        };
        let category = filter.category.map(|c| c.as_str());
        let query = format!(
            r#"
            SELECT {}
            FROM memories
            WHERE ($1::BOOLEAN = FALSE OR active)
              AND ($2::TEXT IS NULL OR category = $2)
              AND CASE $3::TEXT
                    WHEN 'general' THEN service IS NULL
                    WHEN 'service' THEN service = $4
                    ELSE TRUE
                  END
            ORDER BY confidence DESC, updated_at DESC
            "#,
            MEMORY_COLUMNS
        );
        let rows = conn
            .query(&query, &[&filter.active_only, &category, &scope, &service])
            .await?;
        rows.iter().map(row_to_memory).collect()
    }

    async fn modify_memory(
        &self,
        id: Uuid,
        change: &MemoryChange,
    ) -> Result<Memory, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let query = format!(
            "SELECT {} FROM memories WHERE id = $1 FOR UPDATE",
            MEMORY_COLUMNS
        );
        let row = tx
            .query_opt(&query, &[&id])
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "memory",
                id: id.to_string(),
            })?;
        let mut memory = row_to_memory(&row)?;
        memory.apply(change);

        let stale: i32 = column_int(memory.stale_weeks_applied, "stale_weeks_applied")?;
        tx.execute(
            r#"
            UPDATE memories
            SET service = $2, category = $3, observation = $4, confidence = $5,
                active = $6, updated_at = $7, stale_weeks_applied = $8
            WHERE id = $1
            "#,
            &[
                &id,
                &memory.service,
                &memory.category.as_str(),
                &memory.observation,
                &memory.confidence,
                &memory.active,
                &memory.updated_at,
                &stale,
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(memory)
    }

    async fn delete_memory(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute("DELETE FROM memories WHERE id = $1", &[&id])
            .await?;
        Ok(deleted > 0)
    }

    // ==================== Cooldowns ====================

    async fn get_cooldown(&self, service: &str) -> Result<CooldownRecord, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT service, restarts, redeploys, consecutive_healthy FROM cooldowns WHERE service = $1",
                &[&service],
            )
            .await?;
        match row {
            Some(row) => row_to_cooldown(&row),
            None => Ok(CooldownRecord::empty(service)),
        }
    }

    async fn modify_cooldown(
        &self,
        service: &str,
        change: &CooldownChange,
    ) -> Result<CooldownRecord, DatabaseError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            "INSERT INTO cooldowns (service) VALUES ($1) ON CONFLICT (service) DO NOTHING",
            &[&service],
        )
        .await?;
        let row = tx
            .query_one(
                "SELECT service, restarts, redeploys, consecutive_healthy FROM cooldowns WHERE service = $1 FOR UPDATE",
                &[&service],
            )
            .await?;
        let mut record = row_to_cooldown(&row)?;
        record.apply(change);

        let restarts = serde_json::to_value(&record.restarts)?;
        let redeploys = serde_json::to_value(&record.redeploys)?;
        let healthy: i32 = column_int(record.consecutive_healthy, "consecutive_healthy")?;
        tx.execute(
            r#"
            UPDATE cooldowns
            SET restarts = $2, redeploys = $3, consecutive_healthy = $4
            WHERE service = $1
            "#,
            &[&service, &restarts, &redeploys, &healthy],
        )
        .await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn list_cooldowns(&self) -> Result<Vec<CooldownRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT service, restarts, redeploys, consecutive_healthy FROM cooldowns ORDER BY service",
                &[],
            )
            .await?;
        rows.iter().map(row_to_cooldown).collect()
    }
}
