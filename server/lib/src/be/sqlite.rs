use std::collections::BTreeMap;
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{DbAbortIntent, DbAbortTask, DbCleanTask, DbOutboxEntry};
use crate::prelude::*;

const DBV_RUV: &str = "ruv";
const DBV_CLEAN_TASK: &str = "clean_task";
const DBV_ABORT_TASK: &str = "abort_task";
const DBV_ABORT_INTENT: &str = "abort_intent";

#[allow(clippy::needless_pass_by_value)] // needs to accept value from `map_err`
pub(super) fn sqlite_error(e: rusqlite::Error) -> OperationError {
    admin_error!(?e, "SQLite Error");
    OperationError::SqliteError
}

#[allow(clippy::needless_pass_by_value)] // needs to accept value from `map_err`
pub(super) fn serde_json_error(e: serde_json::Error) -> OperationError {
    admin_error!(?e, "Serde JSON Error");
    OperationError::SerdeJsonError
}

/// Durable state held in a single sqlite file. Each record is a json document keyed by
/// the task key (or base for update vectors).
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    pub fn open(path: &str) -> Result<Self, OperationError> {
        let flags = OpenFlags::default();
        let conn = Connection::open_with_flags(path, flags).map_err(sqlite_error)?;

        if path != ":memory:" {
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(sqlite_error)?;
        }

        let store = SqliteStateStore {
            conn: Mutex::new(conn),
        };
        store.setup()?;
        admin_info!(?path, "opened state database");
        Ok(store)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, OperationError>,
    ) -> Result<T, OperationError> {
        let guard = self.conn.lock().map_err(|_| {
            admin_error!("sqlite connection mutex poisoned");
            OperationError::InvalidState
        })?;
        f(&guard)
    }

    fn setup(&self) -> Result<(), OperationError> {
        self.with_conn(|conn| {
            for table in [DBV_RUV, DBV_CLEAN_TASK, DBV_ABORT_TASK, DBV_ABORT_INTENT] {
                conn.execute(
                    &format!("CREATE TABLE IF NOT EXISTS {table} (key TEXT PRIMARY KEY, data TEXT NOT NULL)"),
                    [],
                )
                .map_err(sqlite_error)?;
            }
            conn.execute(
                "CREATE TABLE IF NOT EXISTS outbox (seq INTEGER PRIMARY KEY, data TEXT NOT NULL)",
                [],
            )
            .map_err(sqlite_error)?;
            Ok(())
        })
    }

    fn get_keyed<T: DeserializeOwned>(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<T>, OperationError> {
        self.with_conn(|conn| {
            let data: Option<String> = conn
                .query_row(
                    &format!("SELECT data FROM {table} WHERE key = :key"),
                    &[(":key", key)],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sqlite_error)?;

            data.map(|d| serde_json::from_str(d.as_str()).map_err(serde_json_error))
                .transpose()
        })
    }

    fn list_keyed<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>, OperationError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT data FROM {table} ORDER BY key"))
                .map_err(sqlite_error)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(sqlite_error)?;
            rows.map(|v| {
                v.map_err(sqlite_error)
                    .and_then(|d| serde_json::from_str(d.as_str()).map_err(serde_json_error))
            })
            .collect()
        })
    }

    fn put_keyed<T: Serialize>(
        &self,
        table: &str,
        key: &str,
        value: &T,
    ) -> Result<(), OperationError> {
        let data = serde_json::to_string(value).map_err(serde_json_error)?;
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT OR REPLACE INTO {table} (key, data) VALUES(:key, :data)"),
                &[(":key", key), (":data", data.as_str())],
            )
            .map(|_| ())
            .map_err(sqlite_error)
        })
    }

    fn delete_keyed(&self, table: &str, key: &str) -> Result<(), OperationError> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("DELETE FROM {table} WHERE key = :key"),
                &[(":key", key)],
            )
            .map(|_| ())
            .map_err(sqlite_error)
        })
    }
}

impl ReplStateStore for SqliteStateStore {
    fn load_ruv(&self, base: &str) -> Result<Option<BTreeMap<ReplicaId, RuvRange>>, OperationError> {
        // Json maps need string keys, so the vector is stored as a list of pairs.
        let pairs: Option<Vec<(ReplicaId, RuvRange)>> = self.get_keyed(DBV_RUV, base)?;
        Ok(pairs.map(|p| p.into_iter().collect()))
    }

    fn write_ruv(
        &self,
        base: &str,
        ruv: &BTreeMap<ReplicaId, RuvRange>,
    ) -> Result<(), OperationError> {
        let pairs: Vec<(ReplicaId, RuvRange)> = ruv.iter().map(|(k, v)| (*k, *v)).collect();
        self.put_keyed(DBV_RUV, base, &pairs)
    }

    fn list_clean_tasks(&self) -> Result<Vec<DbCleanTask>, OperationError> {
        self.list_keyed(DBV_CLEAN_TASK)
    }

    fn write_clean_task(&self, task: &DbCleanTask) -> Result<(), OperationError> {
        self.put_keyed(DBV_CLEAN_TASK, &task.key().to_string(), task)
    }

    fn delete_clean_task(&self, key: &TaskKey) -> Result<(), OperationError> {
        self.delete_keyed(DBV_CLEAN_TASK, &key.to_string())
    }

    fn list_abort_tasks(&self) -> Result<Vec<DbAbortTask>, OperationError> {
        self.list_keyed(DBV_ABORT_TASK)
    }

    fn write_abort_task(&self, task: &DbAbortTask) -> Result<(), OperationError> {
        self.put_keyed(DBV_ABORT_TASK, &task.key().to_string(), task)
    }

    fn delete_abort_task(&self, key: &TaskKey) -> Result<(), OperationError> {
        self.delete_keyed(DBV_ABORT_TASK, &key.to_string())
    }

    fn list_abort_intents(&self) -> Result<Vec<DbAbortIntent>, OperationError> {
        self.list_keyed(DBV_ABORT_INTENT)
    }

    fn write_abort_intent(&self, intent: &DbAbortIntent) -> Result<(), OperationError> {
        self.put_keyed(DBV_ABORT_INTENT, &intent.key().to_string(), intent)
    }

    fn delete_abort_intent(&self, key: &TaskKey) -> Result<(), OperationError> {
        self.delete_keyed(DBV_ABORT_INTENT, &key.to_string())
    }

    fn list_outbox(&self) -> Result<Vec<DbOutboxEntry>, OperationError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT data FROM outbox ORDER BY seq ASC")
                .map_err(sqlite_error)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(sqlite_error)?;
            rows.map(|v| {
                v.map_err(sqlite_error)
                    .and_then(|d| serde_json::from_str(d.as_str()).map_err(serde_json_error))
            })
            .collect()
        })
    }

    fn write_outbox(&self, entry: &DbOutboxEntry) -> Result<(), OperationError> {
        let data = serde_json::to_string(entry).map_err(serde_json_error)?;
        let seq = i64::try_from(entry.seq).map_err(|_| OperationError::InvalidState)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO outbox (seq, data) VALUES(?1, ?2)",
                rusqlite::params![seq, data],
            )
            .map(|_| ())
            .map_err(sqlite_error)
        })
    }

    fn delete_outbox(&self, seq: u64) -> Result<(), OperationError> {
        let seq = i64::try_from(seq).map_err(|_| OperationError::InvalidState)?;
        self.with_conn(|conn| {
            conn.execute("DELETE FROM outbox WHERE seq = ?1", [seq])
                .map(|_| ())
                .map_err(sqlite_error)
        })
    }
}
