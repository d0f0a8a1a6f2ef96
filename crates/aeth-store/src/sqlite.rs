//! SQLite-backed persistent store (C8, §4.8). Schema is created directly
//! with `CREATE TABLE IF NOT EXISTS` at startup rather than through a
//! migration framework — there is exactly one schema version to manage.

use std::collections::HashMap;
use std::str::FromStr;

use aeth_core::CoreError;
use aeth_core::model::{Execution, Secret, SecretType, Task, TaskState, TaskType, Vm, VmNet, VmStatus, Worker, WorkerMetrics, WorkerStatus, Workspace};
use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{FromRow, Row, SqlitePool};
use tracing::info;

use crate::filters::{ExecutionFilter, SecretFilter, TaskFilter, VmFilter, WorkerFilter, WorkerMetricsFilter, WorkspaceFilter};
use crate::traits::{ExecutionRepository, ResourceReservation, SecretRepository, Store, TaskRepository, VmRepository, WorkerMetricsRepository, WorkerRepository, WorkspaceRepository};

fn query_err(e: sqlx::Error) -> CoreError {
    CoreError::with_source(aeth_core::ErrorKind::Unavailable, "store query failed", e.into())
}

fn decode_err(field: &str, e: impl std::fmt::Display) -> CoreError {
    CoreError::internal(format!("malformed '{field}' column: {e}"))
}

/// A SQLite-backed implementation of [`Store`], grounded on the
/// connect-lazy + `CREATE TABLE IF NOT EXISTS` pattern used elsewhere in
/// this lineage for embedded SQL persistence.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| CoreError::with_source(aeth_core::ErrorKind::InvalidArg, "invalid database url", e.into()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_lazy_with(options);
        let store = Self { pool };
        store.initialize_tables().await?;
        info!(database_url, "store initialized");
        Ok(store)
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn initialize_tables(&self) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workspaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner_label TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL,
                address TEXT NOT NULL,
                zone TEXT NOT NULL,
                labels TEXT NOT NULL,
                capabilities TEXT NOT NULL,
                status TEXT NOT NULL,
                total_cpu_cores INTEGER NOT NULL,
                used_cpu_cores INTEGER NOT NULL,
                total_mem_mib INTEGER NOT NULL,
                used_mem_mib INTEGER NOT NULL,
                total_disk_mib INTEGER NOT NULL,
                used_disk_mib INTEGER NOT NULL,
                vm_count INTEGER NOT NULL,
                max_vms INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                last_heartbeat_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_workers_status_last_seen ON workers(status, last_heartbeat_at)")
            .execute(&self.pool)
            .await
            .map_err(query_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS worker_metrics (
                id TEXT PRIMARY KEY,
                worker_id TEXT NOT NULL REFERENCES workers(id),
                recorded_at TEXT NOT NULL,
                used_cpu_cores INTEGER NOT NULL,
                used_mem_mib INTEGER NOT NULL,
                used_disk_mib INTEGER NOT NULL,
                vm_count INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_worker_metrics_worker_id ON worker_metrics(worker_id)")
            .execute(&self.pool)
            .await
            .map_err(query_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vms (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id),
                worker_id TEXT NOT NULL REFERENCES workers(id),
                status TEXT NOT NULL,
                vcpu_count INTEGER NOT NULL,
                mem_mib INTEGER NOT NULL,
                kernel_path TEXT NOT NULL,
                rootfs_path TEXT NOT NULL,
                control_socket_path TEXT NOT NULL,
                tap_name TEXT NOT NULL,
                mac TEXT NOT NULL,
                ipv4 TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                stopped_at TEXT,
                last_activity_at TEXT,
                single_task_id TEXT,
                idle_timeout_secs INTEGER,
                metadata TEXT NOT NULL,
                UNIQUE (worker_id, tap_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_vms_worker_id ON vms(worker_id)")
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_vms_status ON vms(status)")
            .execute(&self.pool)
            .await
            .map_err(query_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                vm_id TEXT NOT NULL REFERENCES vms(id),
                cmd TEXT NOT NULL,
                args TEXT NOT NULL,
                env TEXT NOT NULL,
                exit_code INTEGER,
                stdout BLOB NOT NULL,
                stderr BLOB NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                duration_ms INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_vm_id_started_at ON executions(vm_id, started_at)")
            .execute(&self.pool)
            .await
            .map_err(query_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS secrets (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL REFERENCES workspaces(id),
                name TEXT NOT NULL,
                ciphertext BLOB NOT NULL,
                secret_type TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                priority INTEGER NOT NULL,
                deadline TEXT,
                state TEXT NOT NULL,
                result TEXT,
                error TEXT,
                worker_id TEXT,
                available_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_state_available_at ON tasks(state, available_at, priority)")
            .execute(&self.pool)
            .await
            .map_err(query_err)?;

        Ok(())
    }
}

// ---------------------------------------------------------------------
// Row DTOs
// ---------------------------------------------------------------------

#[derive(FromRow)]
struct VmRow {
    id: String,
    name: String,
    workspace_id: String,
    worker_id: String,
    #[sqlx(try_from = "String")]
    status: VmStatus,
    vcpu_count: i64,
    mem_mib: i64,
    kernel_path: String,
    rootfs_path: String,
    control_socket_path: String,
    tap_name: String,
    mac: String,
    ipv4: String,
    created_at: String,
    started_at: Option<String>,
    stopped_at: Option<String>,
    last_activity_at: Option<String>,
    single_task_id: Option<String>,
    idle_timeout_secs: Option<i64>,
    metadata: String,
}

impl TryFrom<VmRow> for Vm {
    type Error = CoreError;

    fn try_from(row: VmRow) -> Result<Self, Self::Error> {
        Ok(Vm {
            id: row.id,
            name: row.name,
            workspace_id: row.workspace_id,
            worker_id: row.worker_id,
            status: row.status,
            vcpu_count: row.vcpu_count as u32,
            mem_mib: row.mem_mib as u64,
            kernel_path: row.kernel_path,
            rootfs_path: row.rootfs_path,
            control_socket_path: row.control_socket_path,
            net: VmNet { tap_name: row.tap_name, mac: row.mac, ipv4: row.ipv4 },
            created_at: row.created_at,
            started_at: row.started_at,
            stopped_at: row.stopped_at,
            last_activity_at: row.last_activity_at,
            single_task_id: row.single_task_id,
            idle_timeout_secs: row.idle_timeout_secs.map(|v| v as u64),
            metadata: serde_json::from_str(&row.metadata).map_err(|e| decode_err("metadata", e))?,
        })
    }
}

#[derive(FromRow)]
struct ExecutionRow {
    id: String,
    vm_id: String,
    cmd: String,
    args: String,
    env: String,
    exit_code: Option<i64>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    started_at: String,
    ended_at: Option<String>,
    duration_ms: Option<i64>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = CoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(Execution {
            id: row.id,
            vm_id: row.vm_id,
            cmd: row.cmd,
            args: serde_json::from_str(&row.args).map_err(|e| decode_err("args", e))?,
            env: serde_json::from_str(&row.env).map_err(|e| decode_err("env", e))?,
            exit_code: row.exit_code.map(|v| v as i32),
            stdout: row.stdout,
            stderr: row.stderr,
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration_ms: row.duration_ms.map(|v| v as u64),
        })
    }
}

#[derive(FromRow)]
struct WorkerRow {
    id: String,
    hostname: String,
    address: String,
    zone: String,
    labels: String,
    capabilities: String,
    #[sqlx(try_from = "String")]
    status: WorkerStatus,
    total_cpu_cores: i64,
    used_cpu_cores: i64,
    total_mem_mib: i64,
    used_mem_mib: i64,
    total_disk_mib: i64,
    used_disk_mib: i64,
    vm_count: i64,
    max_vms: i64,
    started_at: String,
    last_heartbeat_at: String,
}

impl TryFrom<WorkerRow> for Worker {
    type Error = CoreError;

    fn try_from(row: WorkerRow) -> Result<Self, Self::Error> {
        Ok(Worker {
            id: row.id,
            hostname: row.hostname,
            address: row.address,
            zone: row.zone,
            labels: serde_json::from_str(&row.labels).map_err(|e| decode_err("labels", e))?,
            capabilities: serde_json::from_str(&row.capabilities).map_err(|e| decode_err("capabilities", e))?,
            status: row.status,
            total_cpu_cores: row.total_cpu_cores as u32,
            used_cpu_cores: row.used_cpu_cores as u32,
            total_mem_mib: row.total_mem_mib as u64,
            used_mem_mib: row.used_mem_mib as u64,
            total_disk_mib: row.total_disk_mib as u64,
            used_disk_mib: row.used_disk_mib as u64,
            vm_count: row.vm_count as u32,
            max_vms: row.max_vms as u32,
            started_at: row.started_at,
            last_heartbeat_at: row.last_heartbeat_at,
        })
    }
}

#[derive(FromRow)]
struct WorkerMetricsRow {
    id: String,
    worker_id: String,
    recorded_at: String,
    used_cpu_cores: i64,
    used_mem_mib: i64,
    used_disk_mib: i64,
    vm_count: i64,
}

impl From<WorkerMetricsRow> for WorkerMetrics {
    fn from(row: WorkerMetricsRow) -> Self {
        WorkerMetrics {
            id: row.id,
            worker_id: row.worker_id,
            recorded_at: row.recorded_at,
            used_cpu_cores: row.used_cpu_cores as u32,
            used_mem_mib: row.used_mem_mib as u64,
            used_disk_mib: row.used_disk_mib as u64,
            vm_count: row.vm_count as u32,
        }
    }
}

#[derive(FromRow)]
struct WorkspaceRow {
    id: String,
    name: String,
    owner_label: String,
    created_at: String,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Workspace { id: row.id, name: row.name, owner_label: row.owner_label, created_at: row.created_at }
    }
}

#[derive(FromRow)]
struct SecretRow {
    id: String,
    workspace_id: String,
    name: String,
    ciphertext: Vec<u8>,
    #[sqlx(try_from = "String")]
    secret_type: SecretType,
    created_at: String,
}

impl From<SecretRow> for Secret {
    fn from(row: SecretRow) -> Self {
        Secret { id: row.id, workspace_id: row.workspace_id, name: row.name, ciphertext: row.ciphertext, secret_type: row.secret_type, created_at: row.created_at }
    }
}

#[derive(FromRow)]
struct TaskRow {
    id: String,
    #[sqlx(try_from = "String")]
    task_type: TaskType,
    payload: String,
    retry_count: i64,
    max_retries: i64,
    priority: i64,
    deadline: Option<String>,
    #[sqlx(try_from = "String")]
    state: TaskState,
    result: Option<String>,
    error: Option<String>,
    worker_id: Option<String>,
    available_at: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = CoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: row.id,
            task_type: row.task_type,
            payload: serde_json::from_str(&row.payload).map_err(|e| decode_err("payload", e))?,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            priority: row.priority as i32,
            deadline: row.deadline,
            state: row.state,
            result: row.result.map(|r| serde_json::from_str(&r)).transpose().map_err(|e| decode_err("result", e))?,
            error: row.error,
            worker_id: row.worker_id,
            available_at: row.available_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn enum_text(v: impl serde::Serialize) -> Result<String, CoreError> {
    match serde_json::to_value(v).map_err(|e| decode_err("enum", e))? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(decode_err("enum", format!("expected string, got {other}"))),
    }
}

// ---------------------------------------------------------------------
// VmRepository
// ---------------------------------------------------------------------

#[async_trait]
impl VmRepository for SqliteStore {
    async fn create_vm(&self, vm: &Vm) -> Result<(), CoreError> {
        let status = enum_text(vm.status)?;
        let metadata = serde_json::to_string(&vm.metadata).map_err(|e| decode_err("metadata", e))?;
        sqlx::query(
            r#"
            INSERT INTO vms (id, name, workspace_id, worker_id, status, vcpu_count, mem_mib, kernel_path,
                              rootfs_path, control_socket_path, tap_name, mac, ipv4, created_at, started_at,
                              stopped_at, last_activity_at, single_task_id, idle_timeout_secs, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&vm.id)
        .bind(&vm.name)
        .bind(&vm.workspace_id)
        .bind(&vm.worker_id)
        .bind(status)
        .bind(vm.vcpu_count as i64)
        .bind(vm.mem_mib as i64)
        .bind(&vm.kernel_path)
        .bind(&vm.rootfs_path)
        .bind(&vm.control_socket_path)
        .bind(&vm.net.tap_name)
        .bind(&vm.net.mac)
        .bind(&vm.net.ipv4)
        .bind(&vm.created_at)
        .bind(&vm.started_at)
        .bind(&vm.stopped_at)
        .bind(&vm.last_activity_at)
        .bind(&vm.single_task_id)
        .bind(vm.idle_timeout_secs.map(|v| v as i64))
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.is_unique_violation() {
                    return CoreError::precondition_failed(format!("vm '{}' or its tap name already exists", vm.id));
                }
                if db_err.is_foreign_key_violation() {
                    return CoreError::precondition_failed(format!("vm '{}' references unknown worker '{}'", vm.id, vm.worker_id));
                }
            }
            query_err(e)
        })?;
        Ok(())
    }

    async fn update_vm(&self, vm: &Vm) -> Result<(), CoreError> {
        let status = enum_text(vm.status)?;
        let metadata = serde_json::to_string(&vm.metadata).map_err(|e| decode_err("metadata", e))?;
        let result = sqlx::query(
            r#"
            UPDATE vms SET name = ?, workspace_id = ?, worker_id = ?, status = ?, vcpu_count = ?, mem_mib = ?,
                           kernel_path = ?, rootfs_path = ?, control_socket_path = ?, tap_name = ?, mac = ?,
                           ipv4 = ?, started_at = ?, stopped_at = ?, last_activity_at = ?, single_task_id = ?,
                           idle_timeout_secs = ?, metadata = ?
            WHERE id = ?
            "#,
        )
        .bind(&vm.name)
        .bind(&vm.workspace_id)
        .bind(&vm.worker_id)
        .bind(status)
        .bind(vm.vcpu_count as i64)
        .bind(vm.mem_mib as i64)
        .bind(&vm.kernel_path)
        .bind(&vm.rootfs_path)
        .bind(&vm.control_socket_path)
        .bind(&vm.net.tap_name)
        .bind(&vm.net.mac)
        .bind(&vm.net.ipv4)
        .bind(&vm.started_at)
        .bind(&vm.stopped_at)
        .bind(&vm.last_activity_at)
        .bind(&vm.single_task_id)
        .bind(vm.idle_timeout_secs.map(|v| v as i64))
        .bind(metadata)
        .bind(&vm.id)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("vm '{}' not found", vm.id)));
        }
        Ok(())
    }

    async fn get_vm(&self, id: &str) -> Result<Option<Vm>, CoreError> {
        let row = sqlx::query_as::<_, VmRow>("SELECT * FROM vms WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;
        row.map(Vm::try_from).transpose()
    }

    async fn list_vms(&self, filter: &VmFilter) -> Result<Vec<Vm>, CoreError> {
        let mut sql = "SELECT * FROM vms WHERE 1=1".to_string();
        if filter.worker_id.is_some() {
            sql.push_str(" AND worker_id = ?");
        }
        if filter.workspace_id.is_some() {
            sql.push_str(" AND workspace_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }

        let mut query = sqlx::query_as::<_, VmRow>(&sql);
        if let Some(worker_id) = &filter.worker_id {
            query = query.bind(worker_id);
        }
        if let Some(workspace_id) = &filter.workspace_id {
            query = query.bind(workspace_id);
        }
        if let Some(status) = filter.status {
            query = query.bind(enum_text(status)?);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(query_err)?;
        rows.into_iter().map(Vm::try_from).collect()
    }

    async fn delete_vm(&self, id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM vms WHERE id = ?").bind(id).execute(&self.pool).await.map_err(query_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// ExecutionRepository
// ---------------------------------------------------------------------

#[async_trait]
impl ExecutionRepository for SqliteStore {
    async fn create_execution(&self, execution: &Execution) -> Result<(), CoreError> {
        let last_start: Option<String> = sqlx::query("SELECT MAX(started_at) AS m FROM executions WHERE vm_id = ?")
            .bind(&execution.vm_id)
            .fetch_one(&self.pool)
            .await
            .map_err(query_err)?
            .try_get::<Option<String>, _>("m")
            .map_err(query_err)?;
        if let Some(last) = last_start {
            if execution.started_at < last {
                return Err(CoreError::precondition_failed(format!(
                    "execution start-time {} precedes the last recorded start {} for vm '{}'",
                    execution.started_at, last, execution.vm_id
                )));
            }
        }

        let args = serde_json::to_string(&execution.args).map_err(|e| decode_err("args", e))?;
        let env = serde_json::to_string(&execution.env).map_err(|e| decode_err("env", e))?;
        sqlx::query(
            r#"
            INSERT INTO executions (id, vm_id, cmd, args, env, exit_code, stdout, stderr, started_at, ended_at, duration_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.vm_id)
        .bind(&execution.cmd)
        .bind(args)
        .bind(env)
        .bind(execution.exit_code.map(|v| v as i64))
        .bind(&execution.stdout)
        .bind(&execution.stderr)
        .bind(&execution.started_at)
        .bind(&execution.ended_at)
        .bind(execution.duration_ms.map(|v| v as i64))
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE executions SET exit_code = ?, stdout = ?, stderr = ?, ended_at = ?, duration_ms = ? WHERE id = ?")
            .bind(execution.exit_code.map(|v| v as i64))
            .bind(&execution.stdout)
            .bind(&execution.stderr)
            .bind(&execution.ended_at)
            .bind(execution.duration_ms.map(|v| v as i64))
            .bind(&execution.id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("execution '{}' not found", execution.id)));
        }
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, CoreError> {
        let row = sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;
        row.map(Execution::try_from).transpose()
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>, CoreError> {
        let rows = if let Some(vm_id) = &filter.vm_id {
            sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions WHERE vm_id = ? ORDER BY started_at")
                .bind(vm_id)
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions ORDER BY started_at").fetch_all(&self.pool).await
        }
        .map_err(query_err)?;
        rows.into_iter().map(Execution::try_from).collect()
    }
}

// ---------------------------------------------------------------------
// WorkerRepository
// ---------------------------------------------------------------------

#[async_trait]
impl WorkerRepository for SqliteStore {
    async fn create_worker(&self, worker: &Worker) -> Result<(), CoreError> {
        let status = enum_text(worker.status)?;
        let labels = serde_json::to_string(&worker.labels).map_err(|e| decode_err("labels", e))?;
        let capabilities = serde_json::to_string(&worker.capabilities).map_err(|e| decode_err("capabilities", e))?;
        sqlx::query(
            r#"
            INSERT INTO workers (id, hostname, address, zone, labels, capabilities, status, total_cpu_cores,
                                  used_cpu_cores, total_mem_mib, used_mem_mib, total_disk_mib, used_disk_mib,
                                  vm_count, max_vms, started_at, last_heartbeat_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                hostname = excluded.hostname, address = excluded.address, zone = excluded.zone,
                labels = excluded.labels, capabilities = excluded.capabilities, status = excluded.status,
                total_cpu_cores = excluded.total_cpu_cores, used_cpu_cores = excluded.used_cpu_cores,
                total_mem_mib = excluded.total_mem_mib, used_mem_mib = excluded.used_mem_mib,
                total_disk_mib = excluded.total_disk_mib, used_disk_mib = excluded.used_disk_mib,
                vm_count = excluded.vm_count, max_vms = excluded.max_vms,
                last_heartbeat_at = excluded.last_heartbeat_at
            "#,
        )
        .bind(&worker.id)
        .bind(&worker.hostname)
        .bind(&worker.address)
        .bind(&worker.zone)
        .bind(labels)
        .bind(capabilities)
        .bind(status)
        .bind(worker.total_cpu_cores as i64)
        .bind(worker.used_cpu_cores as i64)
        .bind(worker.total_mem_mib as i64)
        .bind(worker.used_mem_mib as i64)
        .bind(worker.total_disk_mib as i64)
        .bind(worker.used_disk_mib as i64)
        .bind(worker.vm_count as i64)
        .bind(worker.max_vms as i64)
        .bind(&worker.started_at)
        .bind(&worker.last_heartbeat_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn update_worker(&self, worker: &Worker) -> Result<(), CoreError> {
        let status = enum_text(worker.status)?;
        let labels = serde_json::to_string(&worker.labels).map_err(|e| decode_err("labels", e))?;
        let capabilities = serde_json::to_string(&worker.capabilities).map_err(|e| decode_err("capabilities", e))?;
        let result = sqlx::query(
            r#"
            UPDATE workers SET hostname = ?, address = ?, zone = ?, labels = ?, capabilities = ?, status = ?,
                               total_cpu_cores = ?, used_cpu_cores = ?, total_mem_mib = ?, used_mem_mib = ?,
                               total_disk_mib = ?, used_disk_mib = ?, vm_count = ?, max_vms = ?, last_heartbeat_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&worker.hostname)
        .bind(&worker.address)
        .bind(&worker.zone)
        .bind(labels)
        .bind(capabilities)
        .bind(status)
        .bind(worker.total_cpu_cores as i64)
        .bind(worker.used_cpu_cores as i64)
        .bind(worker.total_mem_mib as i64)
        .bind(worker.used_mem_mib as i64)
        .bind(worker.total_disk_mib as i64)
        .bind(worker.used_disk_mib as i64)
        .bind(worker.vm_count as i64)
        .bind(worker.max_vms as i64)
        .bind(&worker.last_heartbeat_at)
        .bind(&worker.id)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("worker '{}' not found", worker.id)));
        }
        Ok(())
    }

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>, CoreError> {
        let row = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;
        row.map(Worker::try_from).transpose()
    }

    async fn list_workers(&self, filter: &WorkerFilter) -> Result<Vec<Worker>, CoreError> {
        let mut sql = "SELECT * FROM workers WHERE 1=1".to_string();
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.zone.is_some() {
            sql.push_str(" AND zone = ?");
        }
        let mut query = sqlx::query_as::<_, WorkerRow>(&sql);
        if let Some(status) = filter.status {
            query = query.bind(enum_text(status)?);
        }
        if let Some(zone) = &filter.zone {
            query = query.bind(zone);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(query_err)?;
        rows.into_iter().map(Worker::try_from).collect()
    }

    async fn delete_worker(&self, id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM workers WHERE id = ?").bind(id).execute(&self.pool).await.map_err(query_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// WorkerMetricsRepository
// ---------------------------------------------------------------------

#[async_trait]
impl WorkerMetricsRepository for SqliteStore {
    async fn create_worker_metrics(&self, sample: &WorkerMetrics) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO worker_metrics (id, worker_id, recorded_at, used_cpu_cores, used_mem_mib, used_disk_mib, vm_count)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sample.id)
        .bind(&sample.worker_id)
        .bind(&sample.recorded_at)
        .bind(sample.used_cpu_cores as i64)
        .bind(sample.used_mem_mib as i64)
        .bind(sample.used_disk_mib as i64)
        .bind(sample.vm_count as i64)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn list_worker_metrics(&self, filter: &WorkerMetricsFilter) -> Result<Vec<WorkerMetrics>, CoreError> {
        let rows = if let Some(worker_id) = &filter.worker_id {
            sqlx::query_as::<_, WorkerMetricsRow>("SELECT * FROM worker_metrics WHERE worker_id = ? ORDER BY recorded_at")
                .bind(worker_id)
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query_as::<_, WorkerMetricsRow>("SELECT * FROM worker_metrics ORDER BY recorded_at").fetch_all(&self.pool).await
        }
        .map_err(query_err)?;
        Ok(rows.into_iter().map(WorkerMetrics::from).collect())
    }
}

// ---------------------------------------------------------------------
// WorkspaceRepository
// ---------------------------------------------------------------------

#[async_trait]
impl WorkspaceRepository for SqliteStore {
    async fn create_workspace(&self, workspace: &Workspace) -> Result<(), CoreError> {
        sqlx::query("INSERT INTO workspaces (id, name, owner_label, created_at) VALUES (?, ?, ?, ?)")
            .bind(&workspace.id)
            .bind(&workspace.name)
            .bind(&workspace.owner_label)
            .bind(&workspace.created_at)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn update_workspace(&self, workspace: &Workspace) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE workspaces SET name = ?, owner_label = ? WHERE id = ?")
            .bind(&workspace.name)
            .bind(&workspace.owner_label)
            .bind(&workspace.id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("workspace '{}' not found", workspace.id)));
        }
        Ok(())
    }

    async fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, CoreError> {
        let row = sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(row.map(Workspace::from))
    }

    async fn list_workspaces(&self, filter: &WorkspaceFilter) -> Result<Vec<Workspace>, CoreError> {
        let rows = if let Some(owner_label) = &filter.owner_label {
            sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE owner_label = ?")
                .bind(owner_label)
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces").fetch_all(&self.pool).await
        }
        .map_err(query_err)?;
        Ok(rows.into_iter().map(Workspace::from).collect())
    }

    async fn delete_workspace(&self, id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM workspaces WHERE id = ?").bind(id).execute(&self.pool).await.map_err(query_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// SecretRepository
// ---------------------------------------------------------------------

#[async_trait]
impl SecretRepository for SqliteStore {
    async fn create_secret(&self, secret: &Secret) -> Result<(), CoreError> {
        let secret_type = enum_text(secret.secret_type)?;
        sqlx::query("INSERT INTO secrets (id, workspace_id, name, ciphertext, secret_type, created_at) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(&secret.id)
            .bind(&secret.workspace_id)
            .bind(&secret.name)
            .bind(&secret.ciphertext)
            .bind(secret_type)
            .bind(&secret.created_at)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_secret(&self, id: &str) -> Result<Option<Secret>, CoreError> {
        let row = sqlx::query_as::<_, SecretRow>("SELECT * FROM secrets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(row.map(Secret::from))
    }

    async fn list_secrets(&self, filter: &SecretFilter) -> Result<Vec<Secret>, CoreError> {
        let rows = if let Some(workspace_id) = &filter.workspace_id {
            sqlx::query_as::<_, SecretRow>("SELECT * FROM secrets WHERE workspace_id = ?")
                .bind(workspace_id)
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query_as::<_, SecretRow>("SELECT * FROM secrets").fetch_all(&self.pool).await
        }
        .map_err(query_err)?;
        Ok(rows.into_iter().map(Secret::from).collect())
    }

    async fn delete_secret(&self, id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM secrets WHERE id = ?").bind(id).execute(&self.pool).await.map_err(query_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// TaskRepository
// ---------------------------------------------------------------------

#[async_trait]
impl TaskRepository for SqliteStore {
    async fn create_task(&self, task: &Task) -> Result<(), CoreError> {
        let task_type = enum_text(task.task_type)?;
        let state = enum_text(task.state)?;
        let payload = serde_json::to_string(&task.payload).map_err(|e| decode_err("payload", e))?;
        let result_json = task.result.as_ref().map(serde_json::to_string).transpose().map_err(|e| decode_err("result", e))?;
        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, payload, retry_count, max_retries, priority, deadline, state,
                                result, error, worker_id, available_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(task_type)
        .bind(payload)
        .bind(task.retry_count as i64)
        .bind(task.max_retries as i64)
        .bind(task.priority as i64)
        .bind(&task.deadline)
        .bind(state)
        .bind(result_json)
        .bind(&task.error)
        .bind(&task.worker_id)
        .bind(&task.available_at)
        .bind(&task.created_at)
        .bind(&task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), CoreError> {
        let state = enum_text(task.state)?;
        let result_json = task.result.as_ref().map(serde_json::to_string).transpose().map_err(|e| decode_err("result", e))?;
        let result = sqlx::query(
            r#"
            UPDATE tasks SET retry_count = ?, state = ?, result = ?, error = ?, worker_id = ?, available_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(task.retry_count as i64)
        .bind(state)
        .bind(result_json)
        .bind(&task.error)
        .bind(&task.worker_id)
        .bind(&task.available_at)
        .bind(&task.updated_at)
        .bind(&task.id)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("task '{}' not found", task.id)));
        }
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, CoreError> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;
        row.map(Task::try_from).transpose()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, CoreError> {
        let mut sql = "SELECT * FROM tasks WHERE 1=1".to_string();
        if filter.state.is_some() {
            sql.push_str(" AND state = ?");
        }
        if filter.task_type.is_some() {
            sql.push_str(" AND task_type = ?");
        }
        if filter.worker_id.is_some() {
            sql.push_str(" AND worker_id = ?");
        }
        sql.push_str(" ORDER BY priority, created_at");

        let mut query = sqlx::query_as::<_, TaskRow>(&sql);
        if let Some(state) = filter.state {
            query = query.bind(enum_text(state)?);
        }
        if let Some(task_type) = filter.task_type {
            query = query.bind(enum_text(task_type)?);
        }
        if let Some(worker_id) = &filter.worker_id {
            query = query.bind(worker_id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(query_err)?;
        rows.into_iter().map(Task::try_from).collect()
    }
}

// ---------------------------------------------------------------------
// Cross-aggregate transactions
// ---------------------------------------------------------------------

#[async_trait]
impl Store for SqliteStore {
    async fn create_vm_reserving_resources(&self, vm: &Vm, reservation: ResourceReservation) -> Result<(), CoreError> {
        let status = enum_text(vm.status)?;
        let metadata = serde_json::to_string(&vm.metadata).map_err(|e| decode_err("metadata", e))?;

        let mut tx = self.pool.begin().await.map_err(query_err)?;

        let worker_row: Option<(i64, i64, i64, i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT total_cpu_cores, used_cpu_cores, total_mem_mib, used_mem_mib, total_disk_mib, used_disk_mib, max_vms FROM workers WHERE id = ?",
        )
        .bind(&vm.worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_err)?;

        let (total_cpu, used_cpu, total_mem, used_mem, total_disk, used_disk, max_vms) =
            worker_row.ok_or_else(|| CoreError::precondition_failed(format!("worker '{}' not found", vm.worker_id)))?;

        let new_cpu = used_cpu + reservation.cpu_cores as i64;
        let new_mem = used_mem + reservation.mem_mib as i64;
        let new_disk = used_disk + reservation.disk_mib as i64;
        let vm_count_row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM vms WHERE worker_id = ?")
            .bind(&vm.worker_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(query_err)?;
        let new_vm_count = vm_count_row.0 + 1;

        if new_cpu > total_cpu || new_mem > total_mem || new_disk > total_disk || new_vm_count > max_vms {
            return Err(CoreError::resource_exhausted(format!("worker '{}' has no capacity for this vm", vm.worker_id)));
        }

        sqlx::query(
            r#"
            INSERT INTO vms (id, name, workspace_id, worker_id, status, vcpu_count, mem_mib, kernel_path,
                              rootfs_path, control_socket_path, tap_name, mac, ipv4, created_at, started_at,
                              stopped_at, last_activity_at, single_task_id, idle_timeout_secs, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&vm.id)
        .bind(&vm.name)
        .bind(&vm.workspace_id)
        .bind(&vm.worker_id)
        .bind(status)
        .bind(vm.vcpu_count as i64)
        .bind(vm.mem_mib as i64)
        .bind(&vm.kernel_path)
        .bind(&vm.rootfs_path)
        .bind(&vm.control_socket_path)
        .bind(&vm.net.tap_name)
        .bind(&vm.net.mac)
        .bind(&vm.net.ipv4)
        .bind(&vm.created_at)
        .bind(&vm.started_at)
        .bind(&vm.stopped_at)
        .bind(&vm.last_activity_at)
        .bind(&vm.single_task_id)
        .bind(vm.idle_timeout_secs.map(|v| v as i64))
        .bind(metadata)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.is_unique_violation() {
                    return CoreError::precondition_failed(format!("tap name '{}' already in use", vm.net.tap_name));
                }
            }
            query_err(e)
        })?;

        sqlx::query("UPDATE workers SET used_cpu_cores = ?, used_mem_mib = ?, used_disk_mib = ?, vm_count = ? WHERE id = ?")
            .bind(new_cpu)
            .bind(new_mem)
            .bind(new_disk)
            .bind(new_vm_count)
            .bind(&vm.worker_id)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn delete_vm_releasing_resources(&self, vm_id: &str, reservation: ResourceReservation) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        let worker_id: Option<(String,)> = sqlx::query_as("SELECT worker_id FROM vms WHERE id = ?")
            .bind(vm_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?;
        let Some((worker_id,)) = worker_id else {
            return Err(CoreError::not_found(format!("vm '{vm_id}' not found")));
        };

        sqlx::query("DELETE FROM vms WHERE id = ?").bind(vm_id).execute(&mut *tx).await.map_err(query_err)?;

        sqlx::query(
            r#"
            UPDATE workers SET
                used_cpu_cores = MAX(used_cpu_cores - ?, 0),
                used_mem_mib = MAX(used_mem_mib - ?, 0),
                used_disk_mib = MAX(used_disk_mib - ?, 0),
                vm_count = MAX(vm_count - 1, 0)
            WHERE id = ?
            "#,
        )
        .bind(reservation.cpu_cores as i64)
        .bind(reservation.mem_mib as i64)
        .bind(reservation.disk_mib as i64)
        .bind(&worker_id)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn claim_next_task(&self, worker_id: &str, now: &str) -> Result<Option<Task>, CoreError> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        // Atomic claim: update one matching row to `active`, then read it
        // back by id. The subquery's row selection and the UPDATE run under
        // the same statement, so two racing claimants can't pick the same row.
        let updated = sqlx::query(
            r#"
            UPDATE tasks SET state = 'active', worker_id = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM tasks
                WHERE state IN ('pending', 'retry') AND available_at <= ?
                ORDER BY priority ASC, created_at ASC
                LIMIT 1
            )
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        if updated.rows_affected() == 0 {
            tx.commit().await.map_err(query_err)?;
            return Ok(None);
        }

        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE worker_id = ? AND state = 'active' AND updated_at = ? ORDER BY priority ASC LIMIT 1")
            .bind(worker_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(Some(Task::try_from(row)?))
    }
}
