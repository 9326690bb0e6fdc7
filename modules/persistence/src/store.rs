use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use flowkit::{JsonMap, Module, ModuleCtx};

use auth::{User, UserStore};
use state_machine::{InstanceSnapshot, InstanceStore, TransitionRecord};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistenceConfig {
    /// SQLite DSN, e.g. `sqlite://flowd.db` or `sqlite::memory:`.
    pub dsn: String,
    /// Write the optional transition log table.
    #[serde(default = "default_log_transitions", rename = "logTransitions")]
    pub log_transitions: bool,
}

fn default_log_transitions() -> bool {
    true
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS workflow_instances (
        id TEXT PRIMARY KEY,
        definition TEXT NOT NULL,
        state TEXT NOT NULL,
        data_json TEXT NOT NULL,
        counter INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS users (
        email TEXT PRIMARY KEY,
        password_hash TEXT NOT NULL,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS transitions_log (
        instance_id TEXT NOT NULL,
        counter INTEGER NOT NULL,
        from_state TEXT NOT NULL,
        to_state TEXT NOT NULL,
        transition TEXT NOT NULL,
        at TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        PRIMARY KEY (instance_id, counter)
    )",
];

async fn connect(dsn: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(dsn)?.create_if_missing(true);
    // A shared in-memory database must stay on one connection or every
    // checkout sees a fresh empty database.
    let max_connections = if dsn.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    for statement in SCHEMA {
        sqlx::query(statement).execute(&pool).await?;
    }
    Ok(pool)
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Instance persistence over `workflow_instances` (+ `transitions_log`).
pub struct SqlInstanceStore {
    pool: SqlitePool,
    log_transitions: bool,
}

impl SqlInstanceStore {
    pub async fn connect(dsn: &str, log_transitions: bool) -> anyhow::Result<Self> {
        Ok(Self {
            pool: connect(dsn).await?,
            log_transitions,
        })
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl InstanceStore for SqlInstanceStore {
    async fn save(&self, instance: &InstanceSnapshot) -> anyhow::Result<()> {
        let data_json = serde_json::to_string(&instance.data)?;
        sqlx::query(
            "INSERT INTO workflow_instances
                 (id, definition, state, data_json, counter, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 state = excluded.state,
                 data_json = excluded.data_json,
                 counter = excluded.counter,
                 updated_at = excluded.updated_at",
        )
        .bind(&instance.id)
        .bind(&instance.definition)
        .bind(&instance.state)
        .bind(data_json)
        .bind(instance.counter as i64)
        .bind(instance.created_at.to_rfc3339())
        .bind(instance.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> anyhow::Result<Option<InstanceSnapshot>> {
        let row = sqlx::query(
            "SELECT id, definition, state, data_json, counter, created_at, updated_at
             FROM workflow_instances WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let data: JsonMap = serde_json::from_str(&row.try_get::<String, _>("data_json")?)?;
        Ok(Some(InstanceSnapshot {
            id: row.try_get("id")?,
            definition: row.try_get("definition")?,
            state: row.try_get("state")?,
            data,
            counter: row.try_get::<i64, _>("counter")? as u64,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?),
            updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?),
            history: Vec::new(),
        }))
    }

    async fn list(&self, definition: Option<&str>) -> anyhow::Result<Vec<String>> {
        let rows = match definition {
            Some(definition) => {
                sqlx::query(
                    "SELECT id FROM workflow_instances WHERE definition = ?1 ORDER BY id",
                )
                .bind(definition)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT id FROM workflow_instances ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("id").map_err(Into::into))
            .collect()
    }

    async fn record_transition(
        &self,
        instance_id: &str,
        record: &TransitionRecord,
        payload: &JsonMap,
    ) -> anyhow::Result<()> {
        if !self.log_transitions {
            return Ok(());
        }
        sqlx::query(
            "INSERT OR IGNORE INTO transitions_log
                 (instance_id, counter, from_state, to_state, transition, at, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(instance_id)
        .bind(record.counter as i64)
        .bind(&record.from)
        .bind(&record.to)
        .bind(&record.transition)
        .bind(record.at.to_rfc3339())
        .bind(serde_json::to_string(payload)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// User persistence over `users`.
pub struct SqlUserStore {
    pool: SqlitePool,
}

#[async_trait]
impl UserStore for SqlUserStore {
    async fn create(&self, user: &User) -> anyhow::Result<()> {
        let result = sqlx::query(
            "INSERT INTO users (email, password_hash, name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.name)
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                anyhow::bail!("user '{}' already exists", user.email)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let row = sqlx::query(
            "SELECT email, password_hash, name, created_at FROM users WHERE email = ?1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(User {
                email: row.try_get("email")?,
                password_hash: row.try_get("password_hash")?,
                name: row.try_get("name")?,
                created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?),
            }),
            None => None,
        })
    }
}

/// The `persistence.store` module: publishes the instance store under the
/// module name and the user store under `<name>.users`.
pub struct PersistenceStoreModule {
    name: String,
}

impl PersistenceStoreModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Module for PersistenceStoreModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()> {
        let cfg: PersistenceConfig = ctx.config()?;

        let instance_store = SqlInstanceStore::connect(&cfg.dsn, cfg.log_transitions)
            .await
            .map_err(|e| {
                warn!(module = %self.name, error = %e, "Store connection failed");
                e
            })?;
        let user_store = SqlUserStore {
            pool: instance_store.pool().clone(),
        };

        ctx.registry().register(
            self.name.clone(),
            Arc::new(instance_store) as Arc<dyn InstanceStore>,
        )?;
        ctx.registry().register(
            format!("{}.users", self.name),
            Arc::new(user_store) as Arc<dyn UserStore>,
        )?;

        info!(module = %self.name, "Persistence store ready");
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqlInstanceStore {
        SqlInstanceStore::connect("sqlite::memory:", true)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn instance_save_load_round_trip() {
        let store = memory_store().await;

        let mut data = JsonMap::new();
        data.insert("total".to_string(), serde_json::json!(42));
        let mut instance = InstanceSnapshot::new("i-1", "order", "new", data);
        store.save(&instance).await.unwrap();

        // Upsert on transition.
        instance.state = "paid".to_string();
        instance.counter = 1;
        store.save(&instance).await.unwrap();

        let loaded = store.load("i-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, "paid");
        assert_eq!(loaded.counter, 1);
        assert_eq!(loaded.data["total"], 42);
        assert_eq!(loaded.definition, "order");

        assert_eq!(store.list(None).await.unwrap(), vec!["i-1"]);
        assert_eq!(store.list(Some("order")).await.unwrap(), vec!["i-1"]);
        assert!(store.list(Some("other")).await.unwrap().is_empty());
        assert!(store.load("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transition_log_is_idempotent_per_counter() {
        let store = memory_store().await;
        let record = TransitionRecord {
            counter: 1,
            transition: "pay".into(),
            from: "new".into(),
            to: "paid".into(),
            at: Utc::now(),
        };
        store
            .record_transition("i-1", &record, &JsonMap::new())
            .await
            .unwrap();
        // A replayed write for the same counter is ignored.
        store
            .record_transition("i-1", &record, &JsonMap::new())
            .await
            .unwrap();

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM transitions_log")
            .fetch_one(store.pool())
            .await
            .unwrap()
            .try_get("n")
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn user_store_enforces_unique_email() {
        let instance_store = memory_store().await;
        let users = SqlUserStore {
            pool: instance_store.pool().clone(),
        };

        let user = User::new("ada@example.com", "pw", "Ada").unwrap();
        users.create(&user).await.unwrap();

        let err = users.create(&user).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let found = users.find_by_email("ada@example.com").await.unwrap().unwrap();
        assert_eq!(found.name, "Ada");
        assert!(found.verify_password("pw"));
    }

    #[tokio::test]
    async fn works_as_engine_attached_store() {
        use flowkit::{EventBus, ServiceRegistry};
        use state_machine::StateMachineEngine;

        let store = Arc::new(memory_store().await) as Arc<dyn InstanceStore>;
        let engine = StateMachineEngine::new(Arc::new(ServiceRegistry::new()), EventBus::new());
        engine.attach_store(store.clone());
        engine
            .register_definition(
                serde_json::from_value(serde_json::json!({
                    "name": "order",
                    "initialState": "new",
                    "states": { "new": {}, "paid": {} },
                    "transitions": { "pay": { "from": "new", "to": "paid" } }
                }))
                .unwrap(),
            )
            .unwrap();

        let id = engine.new_instance("order", JsonMap::new()).await.unwrap();
        engine.trigger(&id, "pay", JsonMap::new()).await.unwrap();
        assert!(!engine.persistence_degraded());

        let persisted = store.load(&id).await.unwrap().unwrap();
        assert_eq!(persisted.state, "paid");
        assert_eq!(persisted.counter, 1);
    }
}
