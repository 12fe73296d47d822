use crate::models::{
    MutationOperation, Payload, QueueStats, QueueStatus, QueuedMutation, ReplaySummary,
    SyncStatusResponse,
};
use crate::Database;
use scopeguard::guard;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

mod remote;
mod request;

pub use remote::{RemoteStore, RestClient};
pub use request::RemoteRequest;

/// Потолок попыток: на третьей неудаче мутация удаляется из очереди
pub const MAX_REPLAY_ATTEMPTS: u32 = 3;

const LAST_REPLAY_AT_KEY: &str = "last_replay_at";

/// Ошибки синхронизации (для разбора и логирования)
#[derive(Debug)]
pub enum SyncError {
    /// Missing or empty remote credentials
    Config(String),
    MissingMatch { operation: MutationOperation },
    Network(String),
    Http { status: u16, message: String },
    Storage(String),
    Snapshot(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Config(s) => write!(f, "Config: {}", s),
            SyncError::MissingMatch { operation } => write!(
                f,
                "Missing matchColumn/matchValue for {} operation",
                operation
            ),
            SyncError::Network(s) => write!(f, "Network: {}", s),
            SyncError::Http { status, message } => write!(f, "HTTP {}: {}", status, message),
            SyncError::Storage(s) => write!(f, "Storage: {}", s),
            SyncError::Snapshot(s) => write!(f, "Snapshot: {}", s),
        }
    }
}

impl std::error::Error for SyncError {}

/// Конфигурация синхронизации
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// REST base, e.g. `https://<project>.supabase.co/rest/v1`
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub http_timeout_secs: u64,
    pub app_version: String,
    /// Ключ в local_store, под которым лежит снимок очереди
    pub storage_key: String,
    /// Hex-encoded 32-byte key for at-rest encryption of the snapshot
    pub encryption_key: Option<String>,
    pub background_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:54321/rest/v1".to_string(),
            api_key: None,
            http_timeout_secs: 30,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            storage_key: "chronyx_offline_queue".to_string(),
            encryption_key: None,
            background_interval_secs: 60,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Собрать конфиг из произвольного источника переменных; пустые значения игнорируются
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = get("CHRONYX_SUPABASE_URL") {
            config.api_base_url = format!("{}/rest/v1", url.trim().trim_end_matches('/'));
        }
        config.api_key = get("CHRONYX_SUPABASE_KEY");
        if let Some(secs) = get("CHRONYX_SYNC_TIMEOUT_SECS") {
            match secs.trim().parse() {
                Ok(v) => config.http_timeout_secs = v,
                Err(_) => warn!(
                    "[SYNC] Ignoring invalid CHRONYX_SYNC_TIMEOUT_SECS={:?}",
                    secs
                ),
            }
        }
        if let Some(key) = get("CHRONYX_QUEUE_STORAGE_KEY") {
            config.storage_key = key;
        }
        config.encryption_key = get("CHRONYX_QUEUE_ENCRYPTION_KEY");
        if let Some(secs) = get("CHRONYX_SYNC_INTERVAL_SECS") {
            match secs.trim().parse() {
                Ok(v) if v > 0 => config.background_interval_secs = v,
                _ => warn!(
                    "[SYNC] Ignoring invalid CHRONYX_SYNC_INTERVAL_SECS={:?}",
                    secs
                ),
            }
        }
        config
    }
}

/// Снимок очереди как он лежит на диске: разобранные мутации и записи,
/// которые не удалось разобрать. Последние не проигрываются, но и не теряются
/// при перезаписи снимка.
#[derive(Debug, Default)]
struct Snapshot {
    entries: Vec<QueuedMutation>,
    unreadable: Vec<serde_json::Value>,
}

impl Snapshot {
    fn decode(raw: Option<&str>) -> Result<Self, SyncError> {
        let raw = match raw {
            Some(raw) if !raw.trim().is_empty() => raw,
            _ => return Ok(Self::default()),
        };
        let items: Vec<serde_json::Value> =
            serde_json::from_str(raw).map_err(|e| SyncError::Snapshot(e.to_string()))?;

        let mut snapshot = Self {
            entries: Vec::with_capacity(items.len()),
            unreadable: Vec::new(),
        };
        for (index, item) in items.into_iter().enumerate() {
            match serde_json::from_value::<QueuedMutation>(item.clone()) {
                Ok(mutation) => snapshot.entries.push(mutation),
                Err(e) => {
                    warn!(
                        "[SYNC] Skipping queue entry #{}: cannot decode ({}). Entry is kept in storage as is.",
                        index, e
                    );
                    snapshot.unreadable.push(item);
                }
            }
        }
        Ok(snapshot)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.unreadable.is_empty()
    }

    /// Разобранные записи, затем неразобранные в исходном виде
    fn encode(&self) -> Result<String, SyncError> {
        let mut items = Vec::with_capacity(self.entries.len() + self.unreadable.len());
        for mutation in &self.entries {
            items.push(
                serde_json::to_value(mutation).map_err(|e| SyncError::Snapshot(e.to_string()))?,
            );
        }
        items.extend(self.unreadable.iter().cloned());
        serde_json::to_string(&items).map_err(|e| SyncError::Snapshot(e.to_string()))
    }
}

/// Разобрать снимок очереди. Битые записи пропускаются: одна сломанная
/// мутация не должна блокировать остальные.
pub fn decode_snapshot(raw: Option<&str>) -> Result<Vec<QueuedMutation>, SyncError> {
    Snapshot::decode(raw).map(|snapshot| snapshot.entries)
}

pub fn encode_snapshot(entries: &[QueuedMutation]) -> Result<String, SyncError> {
    serde_json::to_string(entries).map_err(|e| SyncError::Snapshot(e.to_string()))
}

/// Новый случайный id (128 бит, hex)
fn generate_mutation_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Офлайн-очередь мутаций: хранит несинхронизированные записи на устройстве
/// и проигрывает их в удалённое хранилище.
/// Single-flight: параллельный replay_all не запускается.
pub struct OfflineQueue<R: RemoteStore> {
    pub(crate) db: Arc<Database>,
    pub(crate) remote: Arc<R>,
    pub(crate) storage_key: String,
    pub(crate) is_replaying: Arc<AtomicBool>,
}

impl<R: RemoteStore> Clone for OfflineQueue<R> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            remote: self.remote.clone(),
            storage_key: self.storage_key.clone(),
            is_replaying: self.is_replaying.clone(),
        }
    }
}

impl OfflineQueue<RestClient> {
    /// Очередь с REST-клиентом из конфига
    pub fn with_rest_client(db: Arc<Database>, config: &SyncConfig) -> Self {
        Self::new(db, Arc::new(RestClient::new(config)), &config.storage_key)
    }
}

impl<R: RemoteStore> OfflineQueue<R> {
    pub fn new(db: Arc<Database>, remote: Arc<R>, storage_key: &str) -> Self {
        Self {
            db,
            remote,
            storage_key: storage_key.to_string(),
            is_replaying: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    fn load(&self) -> Result<Vec<QueuedMutation>, SyncError> {
        let raw = self
            .db
            .get_value(&self.storage_key)
            .map_err(|e| SyncError::Storage(format!("load queue: {}", e)))?;
        decode_snapshot(raw.as_deref())
    }

    /// Атомарно изменить снимок очереди. Неразобранные записи переписываются как есть;
    /// пустой снимок удаляет ключ.
    fn modify<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut Vec<QueuedMutation>) -> T,
    {
        let mut snapshot_error = None;
        let result = self.db.update_value(&self.storage_key, |raw| {
            let mut snapshot = match Snapshot::decode(raw.as_deref()) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    snapshot_error = Some(e);
                    return Err(rusqlite::Error::InvalidParameterName("queue snapshot".into()));
                }
            };
            let output = f(&mut snapshot.entries);
            if snapshot.is_empty() {
                return Ok((None, output));
            }
            match snapshot.encode() {
                Ok(encoded) => Ok((Some(encoded), output)),
                Err(e) => {
                    snapshot_error = Some(e);
                    Err(rusqlite::Error::InvalidParameterName("queue snapshot".into()))
                }
            }
        });
        match (result, snapshot_error) {
            (Ok(output), _) => Ok(output),
            (Err(_), Some(e)) => Err(e),
            (Err(e), None) => Err(SyncError::Storage(e.to_string())),
        }
    }

    /// Добавить мутацию в очередь и сразу сохранить снимок.
    /// update/delete без match-полей принимаются: они провалятся при первом replay.
    pub fn enqueue(
        &self,
        table: &str,
        operation: MutationOperation,
        payload: Payload,
        match_column: Option<&str>,
        match_value: Option<serde_json::Value>,
    ) -> Result<String, SyncError> {
        if operation.requires_match() && (match_column.is_none() || match_value.is_none()) {
            warn!(
                "[SYNC] Enqueuing {} on {} without matchColumn/matchValue; it will fail on replay",
                operation, table
            );
        }

        let id = self.modify(|entries| {
            let mut id = generate_mutation_id();
            while entries.iter().any(|m| m.id == id) {
                id = generate_mutation_id();
            }
            entries.push(QueuedMutation {
                id: id.clone(),
                target: table.to_string(),
                operation,
                payload,
                match_column: match_column.map(str::to_string),
                match_value,
                enqueued_at: chrono::Utc::now().timestamp_millis(),
                attempts: 0,
            });
            id
        })?;

        debug!("[SYNC] Enqueued {} on {} as {}", operation, table, id);
        Ok(id)
    }

    /// Удалить мутацию по id; отсутствие не ошибка
    pub fn dequeue(&self, id: &str) -> Result<(), SyncError> {
        let removed = self.modify(|entries| {
            let before = entries.len();
            entries.retain(|m| m.id != id);
            before - entries.len()
        })?;
        if removed > 0 {
            debug!("[SYNC] Dequeued {}", id);
        }
        Ok(())
    }

    /// Очистить очередь (например, при выходе пользователя)
    pub fn clear(&self) -> Result<(), SyncError> {
        self.db
            .remove_value(&self.storage_key)
            .map_err(|e| SyncError::Storage(format!("clear queue: {}", e)))?;
        info!("[SYNC] Offline queue cleared");
        Ok(())
    }

    /// Сводка очереди: количество и самый ранний timestamp. Только чтение.
    pub fn queue_status(&self) -> Result<QueueStatus, SyncError> {
        let entries = self.load()?;
        Ok(QueueStatus {
            count: entries.len(),
            oldest_timestamp: entries.iter().map(|m| m.enqueued_at).min(),
        })
    }

    /// Статистика очереди по таблицам и операциям
    pub fn queue_stats(&self) -> Result<QueueStats, SyncError> {
        let entries = self.load()?;
        let mut stats = QueueStats {
            pending_count: entries.len(),
            ..QueueStats::default()
        };
        for m in &entries {
            if m.attempts > 0 {
                stats.retrying_count += 1;
            }
            *stats.pending_by_table.entry(m.target.clone()).or_insert(0) += 1;
            *stats.pending_by_operation.entry(m.operation).or_insert(0) += 1;
        }
        Ok(stats)
    }

    /// Состояние синхронизации для UI
    pub async fn sync_status(&self) -> Result<SyncStatusResponse, SyncError> {
        let pending_count = self.queue_status()?.count;
        let last_replay_at = self
            .db
            .get_app_meta(LAST_REPLAY_AT_KEY)
            .map_err(|e| SyncError::Storage(format!("read last_replay_at: {}", e)))?
            .and_then(|v| v.parse::<i64>().ok());
        let is_online = self.remote.probe().await;
        Ok(SyncStatusResponse {
            pending_count,
            is_online,
            last_replay_at,
        })
    }

    /// Проиграть очередь в удалённое хранилище.
    /// Строго последовательно, по возрастанию timestamp. Никогда не возвращает ошибку.
    /// Panic guard: is_replaying is always reset via scopeguard
    pub async fn replay_all(&self) -> ReplaySummary {
        if self
            .is_replaying
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("[SYNC] Another replay already in progress, skipping");
            let still_pending = self.queue_status().map(|s| s.count).unwrap_or(0);
            return ReplaySummary {
                still_pending,
                ..ReplaySummary::default()
            };
        }

        let _guard = guard((), |_| {
            self.is_replaying.store(false, Ordering::Release);
        });

        self.run_replay_internal().await
    }

    async fn run_replay_internal(&self) -> ReplaySummary {
        let mut entries = match self.load() {
            Ok(entries) => entries,
            Err(e) => {
                error!("[SYNC] Cannot load offline queue, replay skipped: {}", e);
                return ReplaySummary::default();
            }
        };

        if entries.is_empty() {
            debug!("[SYNC] No pending mutations, skipping replay");
            self.touch_last_replay_at();
            return ReplaySummary::default();
        }

        // sort_by_key стабилен: при равных timestamp сохраняется порядок хранения
        entries.sort_by_key(|m| m.enqueued_at);
        info!("[SYNC] Starting replay: {} pending mutations", entries.len());

        let mut summary = ReplaySummary::default();
        let mut resolved: HashSet<String> = HashSet::new();
        let mut retried: HashMap<String, u32> = HashMap::new();

        for mut mutation in entries {
            let result = match RemoteRequest::from_mutation(&mutation) {
                Ok(request) => self.remote.execute(&request).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    summary.succeeded += 1;
                    debug!(
                        "[SYNC] Mutation {} ({} on {}) replayed",
                        mutation.id, mutation.operation, mutation.target
                    );
                    resolved.insert(mutation.id);
                }
                Err(e) => {
                    mutation.attempts += 1;
                    if mutation.attempts >= MAX_REPLAY_ATTEMPTS {
                        summary.permanently_failed += 1;
                        warn!(
                            "[SYNC] Mutation {} ({} on {}) dropped after {} attempts: {}",
                            mutation.id,
                            mutation.operation,
                            mutation.target,
                            mutation.attempts,
                            e
                        );
                        resolved.insert(mutation.id);
                    } else {
                        info!(
                            "[SYNC] Mutation {} will retry later (attempt {}/{}): {}",
                            mutation.id, mutation.attempts, MAX_REPLAY_ATTEMPTS, e
                        );
                        retried.insert(mutation.id, mutation.attempts);
                    }
                }
            }
        }

        // Merge with the current snapshot: keep entries enqueued during the pass,
        // do not resurrect entries dequeued or cleared during it.
        let persisted = self.modify(|current| {
            current.retain(|m| !resolved.contains(&m.id));
            for m in current.iter_mut() {
                if let Some(&attempts) = retried.get(&m.id) {
                    m.attempts = m.attempts.max(attempts);
                }
            }
            current.len()
        });
        summary.still_pending = match persisted {
            Ok(len) => len,
            Err(e) => {
                error!(
                    "[SYNC] CRITICAL: Failed to persist queue after replay: {}. Replayed mutations may be sent again.",
                    e
                );
                retried.len()
            }
        };

        self.touch_last_replay_at();

        if summary.permanently_failed > 0 {
            warn!(
                "[SYNC] Replay completed: {} succeeded, {} permanently failed, {} pending",
                summary.succeeded, summary.permanently_failed, summary.still_pending
            );
        } else {
            info!(
                "[SYNC] Replay completed: {} succeeded, {} pending",
                summary.succeeded, summary.still_pending
            );
        }
        summary
    }

    fn touch_last_replay_at(&self) {
        if let Err(e) = self.db.set_app_meta(
            LAST_REPLAY_AT_KEY,
            &chrono::Utc::now().timestamp().to_string(),
        ) {
            warn!("[SYNC] Failed to update last_replay_at: {}", e);
        }
    }
}
