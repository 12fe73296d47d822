use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

use crate::auth::SnapshotEncryption;
use chrono::Utc;
use rusqlite::Error::InvalidParameterName;

/// Log IO-related DB errors for easier diagnosis (disk full, permission denied).
/// Does not change error propagation; caller still returns Err.
fn log_io_error_if_any(context: &str, e: &rusqlite::Error) {
    use rusqlite::ffi::ErrorCode;
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = e {
        match ffi_err.code {
            ErrorCode::DiskFull => {
                error!(
                    "[DB] {}: Disk full. Free space on drive or check app data directory.",
                    context
                );
            }
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                error!(
                    "[DB] {}: Permission denied or read-only. Check app data directory is writable.",
                    context
                );
            }
            ErrorCode::SystemIoFailure => {
                error!("[DB] {}: I/O error. Check disk and permissions.", context);
            }
            _ => {}
        }
    }
}

/// Локальное долговременное хранилище устройства (ключ → значение).
/// Снимок офлайн-очереди живёт под одним ключом в `local_store`.
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
    pub(crate) encryption: Option<Arc<SnapshotEncryption>>,
}

impl Database {
    /// Безопасная блокировка соединения с обработкой poisoned mutex
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, rusqlite::Error> {
        self.conn.lock().map_err(|e| {
            InvalidParameterName(format!(
                "Database mutex poisoned: {}. A panic occurred while holding the lock. \
                 Please restart the application to recover.",
                e
            ))
        })
    }

    pub fn new(db_path: &str) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;

        // GUARD: integrity check before migrations
        let integrity: String = conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))
            .map_err(|e| InvalidParameterName(format!("Integrity check failed: {}", e)))?;
        if integrity.to_lowercase() != "ok" {
            return Err(InvalidParameterName(format!(
                "Database corruption detected: {}",
                integrity
            )));
        }

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| {
                warn!(
                    "[DB] Failed to enable WAL mode: {}. Continuing with default journal mode.",
                    e
                );
            })
            .ok();
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");

        Self::from_connection(conn)
    }

    /// In-memory база (тесты, эфемерные сессии)
    pub fn open_in_memory() -> SqliteResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> SqliteResult<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            encryption: None,
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Включить шифрование значений `local_store`
    pub fn with_encryption(mut self, encryption: SnapshotEncryption) -> Self {
        self.encryption = Some(Arc::new(encryption));
        self
    }

    /// Current schema version (PRAGMA user_version). Bump when adding migrations.
    const SCHEMA_VERSION: i32 = 2;

    fn run_migrations(&self) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        let current: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

        if current < 1 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS local_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS app_meta (key TEXT PRIMARY KEY, value TEXT)",
                [],
            )?;
        }

        // Migration 2: updated_at (idempotent ALTER)
        if current < 2 {
            let _ = conn.execute(
                "ALTER TABLE local_store ADD COLUMN updated_at INTEGER NOT NULL DEFAULT 0",
                [],
            );
        }

        conn.pragma_update(None, "user_version", Self::SCHEMA_VERSION)?;
        Ok(())
    }

    fn seal(&self, plaintext: &str) -> SqliteResult<String> {
        match &self.encryption {
            Some(enc) => enc.encrypt(plaintext).map_err(|e| {
                error!("[DB] Encryption failed for stored value: {}", e);
                InvalidParameterName(format!("Encryption error: {}", e))
            }),
            None => Ok(plaintext.to_string()),
        }
    }

    fn open_sealed(&self, key: &str, stored: String) -> SqliteResult<String> {
        match &self.encryption {
            Some(enc) => {
                let (plaintext, needs_migration) =
                    enc.decrypt_with_legacy_fallback(&stored).map_err(|e| {
                        error!("[DB] Failed to decrypt value for key {}: {}", key, e);
                        InvalidParameterName(format!("Decryption error: {}", e))
                    })?;
                if needs_migration {
                    warn!(
                        "[DB] Key {} holds a plaintext value; it will be encrypted on next write",
                        key
                    );
                }
                Ok(plaintext)
            }
            None => Ok(stored),
        }
    }

    fn read_raw(conn: &Connection, key: &str) -> SqliteResult<Option<String>> {
        conn.query_row(
            "SELECT value FROM local_store WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
    }

    fn write_raw(conn: &Connection, key: &str, value: Option<&str>) -> SqliteResult<()> {
        match value {
            Some(value) => {
                conn.execute(
                    "INSERT INTO local_store (key, value, updated_at) VALUES (?1, ?2, ?3)
     ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                    params![key, value, Utc::now().timestamp()],
                )?;
            }
            None => {
                conn.execute("DELETE FROM local_store WHERE key = ?1", params![key])?;
            }
        }
        Ok(())
    }

    /// Прочитать значение по ключу (расшифрованное)
    pub fn get_value(&self, key: &str) -> SqliteResult<Option<String>> {
        let stored = {
            let conn = self.lock_conn()?;
            Self::read_raw(&conn, key)?
        };
        stored.map(|s| self.open_sealed(key, s)).transpose()
    }

    /// Записать значение по ключу (перезапись целиком)
    pub fn set_value(&self, key: &str, value: &str) -> SqliteResult<()> {
        let sealed = self.seal(value)?;
        let conn = self.lock_conn()?;
        Self::write_raw(&conn, key, Some(&sealed)).map_err(|e| {
            log_io_error_if_any("set_value", &e);
            e
        })
    }

    /// Удалить ключ; отсутствие ключа не ошибка
    pub fn remove_value(&self, key: &str) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        Self::write_raw(&conn, key, None)
    }

    /// Атомарный read-modify-write одного ключа.
    /// `f` получает текущее значение и возвращает новое (None = удалить ключ).
    /// Соединение заблокировано на всё время вызова; запись идёт в транзакции.
    pub fn update_value<T, F>(&self, key: &str, f: F) -> SqliteResult<T>
    where
        F: FnOnce(Option<String>) -> SqliteResult<(Option<String>, T)>,
    {
        let conn = self.lock_conn()?;

        let current = Self::read_raw(&conn, key)?
            .map(|s| self.open_sealed(key, s))
            .transpose()?;
        let (next, output) = f(current)?;
        let sealed = next.as_deref().map(|v| self.seal(v)).transpose()?;

        conn.execute("BEGIN IMMEDIATE TRANSACTION", []).map_err(|e| {
            log_io_error_if_any("update_value begin", &e);
            error!("[DB] Failed to begin transaction: {}", e);
            e
        })?;

        match Self::write_raw(&conn, key, sealed.as_deref()) {
            Ok(()) => {
                conn.execute("COMMIT", []).map_err(|e| {
                    log_io_error_if_any("update_value commit", &e);
                    error!("[DB] Failed to commit transaction: {}", e);
                    let _ = conn.execute("ROLLBACK", []);
                    e
                })?;
                Ok(output)
            }
            Err(e) => {
                log_io_error_if_any("update_value", &e);
                error!("[DB] Failed to write key {}: {}. Rolling back.", key, e);
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Получить значение из app_meta
    pub fn get_app_meta(&self, key: &str) -> SqliteResult<Option<String>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT value FROM app_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
    }

    /// Записать значение в app_meta
    pub fn set_app_meta(&self, key: &str, value: &str) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO app_meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }
}
