use async_trait::async_trait;
use chrono::Utc;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, MySqlPool, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::shared::models::constants::*;
use crate::shared::models::{
    DatabaseError, ExecutionResult, HealthStatus, MachineType, NewSandbox, Sandbox, SandboxRow,
    SandboxStatus, SandboxUpdate, Task, TaskRow, TaskStatus,
};
use crate::shared::repository::{SandboxRepository, StuckCursor, TaskRepository};

const SANDBOX_COLUMNS: &str = r#"
    id, name, environment, machine_type, instance_id, public_ip, private_ip,
    session_handle, status, health_status, last_health_check, capacity,
    current_load, auto_stop_enabled, idle_minutes_before_stop, backing_state,
    created_at, updated_at
"#;

/// Connect to MySQL and apply pending migrations.
pub async fn init_database(
    database_url: &str,
    acquire_timeout: Duration,
) -> Result<MySqlPool, DatabaseError> {
    let pool = MySqlPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied");

    Ok(pool)
}

/// Convert fetched rows, logging and dropping any that do not parse so one
/// bad record cannot stall a whole control loop.
fn readable_rows<R, T>(rows: Vec<R>, kind: &str) -> Vec<T>
where
    T: TryFrom<R, Error = DatabaseError>,
{
    rows.into_iter()
        .filter_map(|row| match T::try_from(row) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Skipping unreadable {} row: {}", kind, e);
                None
            }
        })
        .collect()
}

/// Appends `status NOT IN (...)` over the terminal task statuses.
fn push_non_terminal(qb: &mut QueryBuilder<'_, MySql>) {
    qb.push("status NOT IN (");
    let mut list = qb.separated(", ");
    for status in TERMINAL_TASK_STATUSES {
        list.push_bind(status);
    }
    qb.push(")");
}

#[derive(Clone)]
pub struct MySqlSandboxRepository {
    pool: MySqlPool,
}

impl MySqlSandboxRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, sql: &str, bind: Option<&str>) -> Result<Vec<Sandbox>, DatabaseError> {
        let mut query = sqlx::query_as::<_, SandboxRow>(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(readable_rows(rows, "sandbox"))
    }
}

#[async_trait]
impl SandboxRepository for MySqlSandboxRepository {
    async fn find_by_machine_type(
        &self,
        machine_type: MachineType,
    ) -> Result<Vec<Sandbox>, DatabaseError> {
        // Rows predating the column have no machine type and belong to the cloud VM provider.
        let type_filter = if machine_type == MachineType::CloudVm {
            "(machine_type = ? OR machine_type IS NULL OR machine_type = '')"
        } else {
            "machine_type = ?"
        };
        let sql = format!(
            "SELECT {} FROM sandboxes WHERE {} AND status <> '{}' ORDER BY created_at",
            SANDBOX_COLUMNS, type_filter, SANDBOX_STATUS_TERMINATED
        );
        self.fetch(&sql, Some(machine_type.as_str())).await
    }

    async fn find_auto_stop_candidates(&self) -> Result<Vec<Sandbox>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM sandboxes WHERE auto_stop_enabled = TRUE AND status = '{}' ORDER BY updated_at ASC",
            SANDBOX_COLUMNS, SANDBOX_STATUS_ACTIVE
        );
        self.fetch(&sql, None).await
    }

    async fn find_live(&self) -> Result<Vec<Sandbox>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM sandboxes WHERE status <> '{}' ORDER BY id",
            SANDBOX_COLUMNS, SANDBOX_STATUS_TERMINATED
        );
        self.fetch(&sql, None).await
    }

    async fn create(&self, new: NewSandbox) -> Result<Sandbox, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO sandboxes (id, name, environment, machine_type, status, health_status,
                                   capacity, current_load, auto_stop_enabled,
                                   idle_minutes_before_stop, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&new.name)
        .bind(&new.environment)
        .bind(new.machine_type.as_str())
        .bind(SANDBOX_STATUS_PROVISIONING)
        .bind(HEALTH_HEALTHY)
        .bind(new.capacity)
        .bind(new.auto_stop_enabled)
        .bind(new.idle_minutes_before_stop)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Sandbox {
            id,
            name: new.name,
            environment: new.environment,
            machine_type: Some(new.machine_type),
            instance_id: None,
            public_ip: None,
            private_ip: None,
            session_handle: None,
            status: SandboxStatus::Provisioning,
            health_status: HealthStatus::Healthy,
            last_health_check: None,
            capacity: new.capacity,
            current_load: 0,
            auto_stop_enabled: new.auto_stop_enabled,
            idle_minutes_before_stop: new.idle_minutes_before_stop,
            backing_state: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update(&self, id: Uuid, fields: SandboxUpdate) -> Result<(), DatabaseError> {
        if fields.is_empty() {
            return Ok(());
        }

        // Health bookkeeping must not reset the idle clock used by auto-stop.
        let touch = fields.status.is_some()
            || fields.instance_id.is_some()
            || fields.public_ip.is_some()
            || fields.private_ip.is_some()
            || fields.session_handle.is_some();

        let mut qb: QueryBuilder<MySql> = QueryBuilder::new("UPDATE sandboxes SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(status) = fields.status {
                set.push("status = ").push_bind_unseparated(status.as_str());
            }
            if let Some(health) = fields.health_status {
                set.push("health_status = ").push_bind_unseparated(health.as_str());
            }
            if let Some(checked) = fields.last_health_check {
                set.push("last_health_check = ").push_bind_unseparated(checked);
            }
            if let Some(instance_id) = fields.instance_id {
                set.push("instance_id = ").push_bind_unseparated(instance_id);
            }
            if let Some(ip) = fields.public_ip {
                set.push("public_ip = ").push_bind_unseparated(ip);
            }
            if let Some(ip) = fields.private_ip {
                set.push("private_ip = ").push_bind_unseparated(ip);
            }
            if let Some(handle) = fields.session_handle {
                set.push("session_handle = ").push_bind_unseparated(handle);
            }
            if let Some(state) = fields.backing_state {
                set.push("backing_state = ").push_bind_unseparated(state);
            }
            if touch {
                set.push("updated_at = NOW()");
            }
        }
        qb.push(" WHERE id = ").push_bind(id.to_string());

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            debug!("Sandbox update for {} matched no rows", id);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MySqlTaskRepository {
    pool: MySqlPool,
}

impl MySqlTaskRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepository for MySqlTaskRepository {
    async fn count_queued(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status = ?")
            .bind(TASK_STATUS_QUEUED)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn find_stuck_jobs(
        &self,
        minutes_threshold: i64,
        after: Option<StuckCursor>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut qb: QueryBuilder<MySql> = QueryBuilder::new(
            "SELECT id, user_id, status, execution_ref, updated_at FROM tasks WHERE ",
        );
        push_non_terminal(&mut qb);
        qb.push(" AND TIMESTAMPADD(MINUTE, ")
            .push_bind(minutes_threshold)
            .push(", updated_at) <= NOW()");
        if let Some(cursor) = after {
            qb.push(" AND (updated_at > ")
                .push_bind(cursor.updated_at)
                .push(" OR (updated_at = ")
                .push_bind(cursor.updated_at)
                .push(" AND id > ")
                .push_bind(cursor.id.to_string())
                .push("))");
        }
        qb.push(" ORDER BY updated_at ASC, id ASC LIMIT ")
            .push_bind(limit as i64);

        let rows: Vec<TaskRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(readable_rows(rows, "task"))
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: Option<ExecutionResult>,
    ) -> Result<bool, DatabaseError> {
        let mut qb: QueryBuilder<MySql> = QueryBuilder::new("UPDATE tasks SET status = ");
        qb.push_bind(status.as_str());
        if let Some(result) = result {
            let error = result.error.map(serde_json::to_value).transpose()?;
            qb.push(", execution_ref = COALESCE(")
                .push_bind(result.reference)
                .push(", execution_ref), result = ")
                .push_bind(result.result)
                .push(", error = ")
                .push_bind(error)
                .push(", completed_at = ")
                .push_bind(result.completed_at);
        }
        qb.push(", updated_at = NOW() WHERE id = ")
            .push_bind(id.to_string())
            .push(" AND ");
        push_non_terminal(&mut qb);

        let outcome = qb.build().execute(&self.pool).await?;
        Ok(outcome.rows_affected() > 0)
    }
}
