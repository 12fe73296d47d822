use reqwest::Method;

use super::SyncError;
use crate::models::{MutationOperation, QueuedMutation};

/// Готовый к отправке REST-запрос для одной мутации (без учётных данных)
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub mutation_id: String,
    pub table: String,
    pub method: Method,
    /// `(column, "eq.<value>")` row filter for update/delete
    pub filter: Option<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Upsert: `Prefer: resolution=merge-duplicates`
    pub merge_duplicates: bool,
}

impl RemoteRequest {
    /// Построить запрос для мутации.
    /// update/delete без matchColumn/matchValue -> MissingMatch (попытка считается неудачной).
    pub fn from_mutation(mutation: &QueuedMutation) -> Result<Self, SyncError> {
        let filter = if mutation.operation.requires_match() {
            match (&mutation.match_column, &mutation.match_value) {
                (Some(column), Some(value)) if !column.is_empty() => {
                    Some((column.clone(), format!("eq.{}", render_match_value(value))))
                }
                _ => {
                    return Err(SyncError::MissingMatch {
                        operation: mutation.operation,
                    })
                }
            }
        } else {
            None
        };

        let body = serde_json::Value::Object(mutation.payload.clone());
        let (method, body, merge_duplicates) = match mutation.operation {
            MutationOperation::Insert => (Method::POST, Some(body), false),
            MutationOperation::Upsert => (Method::POST, Some(body), true),
            MutationOperation::Update => (Method::PATCH, Some(body), false),
            MutationOperation::Delete => (Method::DELETE, None, false),
        };

        Ok(Self {
            mutation_id: mutation.id.clone(),
            table: mutation.target.clone(),
            method,
            filter,
            body,
            merge_duplicates,
        })
    }
}

/// Строки уходят как есть, остальное JSON-текстом (числа, bool, null)
pub(crate) fn render_match_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
