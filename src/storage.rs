use rusqlite::Error::InvalidParameterName;
use rusqlite::{params, Connection, Result as SqliteResult};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

/// Log IO-related DB errors for easier diagnosis (disk full, permission denied).
/// Does not change error propagation — caller still returns Err.
fn log_io_error_if_any(context: &str, e: &rusqlite::Error) {
    use rusqlite::ffi::ErrorCode;
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = e {
        match ffi_err.code {
            ErrorCode::DiskFull => {
                error!(
                    "[STORE] {}: Disk full. Free space on drive or check data directory.",
                    context
                );
            }
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                error!(
                    "[STORE] {}: Permission denied or read-only. Check data directory is writable.",
                    context
                );
            }
            ErrorCode::SystemIoFailure => {
                error!("[STORE] {}: I/O error. Check disk and permissions.", context);
            }
            _ => {}
        }
    }
}

/// Контракт долговременного key-value хранилища.
/// Очередь хранит весь свой стейт одним blob'ом под фиксированным ключом.
pub trait KeyValueStore: Send + Sync {
    /// Прочитать значение по ключу; None, если ключа нет
    fn get_item(&self, key: &str) -> Result<Option<String>, String>;
    /// Записать значение (полная перезапись, last write wins)
    fn set_item(&self, key: &str, value: &str) -> Result<(), String>;
}

/// SQLite-хранилище key-value
pub struct SqliteStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Безопасная блокировка соединения с обработкой poisoned mutex
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, rusqlite::Error> {
        self.conn.lock().map_err(|e| {
            InvalidParameterName(format!(
                "Store mutex poisoned: {}. A panic occurred while holding the lock. \
                 Please restart the application to recover.",
                e
            ))
        })
    }

    pub fn new(db_path: &str) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;

        // GUARD: Integrity check on startup — detect corruption before init
        let integrity: String = conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))
            .map_err(|e| InvalidParameterName(format!("Integrity check failed: {}", e)))?;
        if integrity.to_lowercase() != "ok" {
            return Err(InvalidParameterName(format!(
                "Store corruption detected: {}",
                integrity
            )));
        }

        // WAL mode — лучшая защита от corruption при внезапном завершении
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| {
                warn!(
                    "[STORE] Failed to enable WAL mode: {}. Continuing with default journal mode.",
                    e
                );
            })
            .ok();

        // Blob перезаписывается на каждую мутацию очереди — снижаем disk I/O (safe with WAL)
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        // Temp tables in RAM
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Current schema version (PRAGMA user_version). Bump when adding migrations.
    const SCHEMA_VERSION: i32 = 1;

    /// Versioned migrations using SQLite user_version pragma.
    fn run_migrations(&self) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        let current: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

        if current < 1 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
                [],
            )?;
        }

        conn.pragma_update(None, "user_version", Self::SCHEMA_VERSION)?;
        Ok(())
    }
}

impl KeyValueStore for SqliteStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, String> {
        let conn = self
            .lock_conn()
            .map_err(|e| format!("Failed to lock store: {}", e))?;
        let mut stmt = conn
            .prepare("SELECT value FROM kv WHERE key = ?1")
            .map_err(|e| format!("Failed to prepare read for '{}': {}", key, e))?;
        let mut rows = stmt
            .query(params![key])
            .map_err(|e| format!("Failed to read '{}': {}", key, e))?;
        match rows.next() {
            Ok(Some(row)) => row
                .get(0)
                .map(Some)
                .map_err(|e| format!("Failed to decode '{}': {}", key, e)),
            Ok(None) => Ok(None),
            Err(e) => Err(format!("Failed to read '{}': {}", key, e)),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), String> {
        let conn = self
            .lock_conn()
            .map_err(|e| format!("Failed to lock store: {}", e))?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )
        .map_err(|e| {
            log_io_error_if_any("set_item", &e);
            format!("Failed to write '{}': {}", key, e)
        })?;
        Ok(())
    }
}
