use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

mod auth;
mod database;
pub mod finance;
mod models;
mod network;
mod sync;

pub use auth::{CredentialManager, Credentials, SnapshotEncryption};
pub use database::Database;
pub use models::{
    MutationOperation, Payload, QueueStats, QueueStatus, QueuedMutation, ReplaySummary,
    SyncStatusResponse,
};
pub use network::check_online_status;
pub use sync::{
    decode_snapshot, encode_snapshot, OfflineQueue, RemoteRequest, RemoteStore, RestClient,
    SyncConfig, SyncError, MAX_REPLAY_ATTEMPTS,
};


/// Инициализация логирования: по умолчанию info (если RUST_LOG не задан).
/// Повторный вызов ничего не делает.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Открыть локальную БД очереди по пути из приложения, с шифрованием если задан ключ
pub fn open_database(db_path: &str, config: &SyncConfig) -> Result<Database, SyncError> {
    let db = Database::new(db_path)
        .map_err(|e| SyncError::Storage(format!("Failed to initialize database: {}", e)))?;
    match config.encryption_key.as_deref() {
        Some(key) => {
            let encryption = SnapshotEncryption::from_hex(key).map_err(SyncError::Config)?;
            info!("[DB] Offline queue encryption enabled");
            Ok(db.with_encryption(encryption))
        }
        None => Ok(db),
    }
}

/// Фоновая синхронизация: после стартовой задержки (с jitter) раз в `interval`
/// проверяет доступность хранилища и проигрывает очередь.
/// Завершается, когда в `shutdown` приходит `true`; идущий replay не прерывается.
pub async fn run_background_sync<R: RemoteStore>(
    queue: OfflineQueue<R>,
    interval: Duration,
    initial_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        return;
    }

    if !initial_delay.is_zero() {
        let jitter_ms: u64 = rand::random::<u32>() as u64 % 2000 + 1000;
        let delay = initial_delay + Duration::from_millis(jitter_ms);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("[SYNC] Background sync stopped before first tick");
                    return;
                }
            }
        }
    }

    info!("[SYNC] Starting background sync task");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut was_online = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("[SYNC] Background sync stopped");
                    return;
                }
                continue;
            }
        }

        if !queue.remote().probe().await {
            if was_online {
                warn!("[SYNC] Remote store unreachable, replay paused");
            }
            was_online = false;
            continue;
        }
        if !was_online {
            info!("[SYNC] Remote store reachable again, replaying offline queue");
        }
        was_online = true;

        let summary = queue.replay_all().await;
        if summary.permanently_failed > 0 {
            error!(
                "[SYNC] Background sync: {} mutations permanently lost",
                summary.permanently_failed
            );
        } else if summary.succeeded > 0 {
            info!("[SYNC] Background sync: replayed {} mutations", summary.succeeded);
        } else {
            debug!("[SYNC] Background sync: nothing replayed");
        }
    }
}

/// Запустить [`run_background_sync`] на текущем tokio runtime
pub fn spawn_background_sync<R: RemoteStore + 'static>(
    queue: OfflineQueue<R>,
    config: &SyncConfig,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(config.background_interval_secs.max(1));
    tokio::spawn(run_background_sync(
        queue,
        interval,
        Duration::from_secs(10),
        shutdown,
    ))
}

/// Очередь для приложения: БД по пути + REST-клиент из конфига
pub fn open_offline_queue(
    db_path: &str,
    config: &SyncConfig,
) -> Result<OfflineQueue<RestClient>, SyncError> {
    let db = Arc::new(open_database(db_path, config)?);
    Ok(OfflineQueue::with_rest_client(db, config))
}
