use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Непрозрачный payload мутации: поля уходят на сервер без изменений
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Тип операции над удалённой таблицей
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOperation {
    Insert,
    Update,
    Delete,
    Upsert,
}

impl MutationOperation {
    /// update/delete адресуют строки через matchColumn = matchValue
    pub fn requires_match(self) -> bool {
        matches!(self, MutationOperation::Update | MutationOperation::Delete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MutationOperation::Insert => "insert",
            MutationOperation::Update => "update",
            MutationOperation::Delete => "delete",
            MutationOperation::Upsert => "upsert",
        }
    }
}

impl fmt::Display for MutationOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Запись, которая ещё не подтверждена удалённым хранилищем.
/// Имена полей в JSON совпадают с форматом снимка очереди на диске.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: String,
    #[serde(rename = "table")]
    pub target: String,
    pub operation: MutationOperation,
    #[serde(rename = "data")]
    pub payload: Payload,
    #[serde(
        rename = "matchColumn",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub match_column: Option<String>,
    /// Явный `null` сохраняется как `Some(Value::Null)` и уходит как `eq.null`
    #[serde(
        rename = "matchValue",
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub match_value: Option<serde_json::Value>,
    /// Unix time in milliseconds; replay order key
    #[serde(rename = "timestamp")]
    pub enqueued_at: i64,
    #[serde(rename = "retryCount", default)]
    pub attempts: u32,
}

/// Поле присутствует в JSON: любое значение, включая `null`, это `Some`.
/// Отсутствие поля обрабатывает `#[serde(default)]`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// Итог одного прохода replay_all
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySummary {
    pub succeeded: usize,
    pub permanently_failed: usize,
    pub still_pending: usize,
}

/// Краткая сводка очереди (без сети и без записи)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub count: usize,
    pub oldest_timestamp: Option<i64>,
}

/// Статистика очереди синхронизации
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending_count: usize,
    /// Entries that already failed at least once
    pub retrying_count: usize,
    pub pending_by_table: HashMap<String, usize>,
    pub pending_by_operation: HashMap<MutationOperation, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusResponse {
    pub pending_count: usize,
    pub is_online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_replay_at: Option<i64>,
}
