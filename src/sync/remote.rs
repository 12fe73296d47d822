use reqwest::header::CONTENT_TYPE;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::request::RemoteRequest;
use super::{SyncConfig, SyncError};
use crate::auth::{CredentialManager, Credentials};

/// Удалённое хранилище, в которое проигрывается очередь.
/// В production это [`RestClient`], в тестах подставной in-process fake.
pub trait RemoteStore: Send + Sync {
    /// Отправить один запрос; Ok только для 2xx
    fn execute(&self, request: &RemoteRequest)
        -> impl Future<Output = Result<(), SyncError>> + Send;

    /// Достижимо ли хранилище прямо сейчас
    fn probe(&self) -> impl Future<Output = bool> + Send;
}

/// REST-клиент для auto-generated API хостинга (`<base>/<table>`)
pub struct RestClient {
    client: reqwest::Client,
    api_base_url: String,
    credentials: Arc<CredentialManager>,
    client_info: String,
}

impl RestClient {
    pub fn new(config: &SyncConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let credentials = config.api_key.clone().map(Credentials::new);
        Self {
            client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            credentials: Arc::new(CredentialManager::new(credentials)),
            client_info: format!("chronyx-sync/{}", config.app_version),
        }
    }

    /// Shared handle for sign-in / sign-out token updates
    pub fn credentials(&self) -> Arc<CredentialManager> {
        self.credentials.clone()
    }

    /// `<base>/<table>`; имя таблицы кодируется как один сегмент пути
    fn table_url(&self, table: &str) -> Result<reqwest::Url, SyncError> {
        let mut url = reqwest::Url::parse(&self.api_base_url).map_err(|e| {
            SyncError::Config(format!("Invalid API base URL {}: {}", self.api_base_url, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                SyncError::Config(format!("API base URL {} cannot have a path", self.api_base_url))
            })?
            .pop_if_empty()
            .push(table);
        Ok(url)
    }

    /// Собрать HTTP-запрос (без отправки)
    pub fn build_request(
        &self,
        request: &RemoteRequest,
        credentials: &Credentials,
    ) -> Result<reqwest::RequestBuilder, SyncError> {
        let url = self.table_url(&request.table)?;
        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .header("apikey", &credentials.api_key)
            .header("Authorization", format!("Bearer {}", credentials.bearer()))
            .header("X-Client-Info", &self.client_info)
            .header(CONTENT_TYPE, "application/json");

        let prefer = if request.merge_duplicates {
            "return=minimal,resolution=merge-duplicates"
        } else {
            "return=minimal"
        };
        builder = builder.header("Prefer", prefer);

        if let Some((column, condition)) = &request.filter {
            builder = builder.query(&[(column.as_str(), condition.as_str())]);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder)
    }
}

impl RemoteStore for RestClient {
    async fn execute(&self, request: &RemoteRequest) -> Result<(), SyncError> {
        // Без учётных данных в сеть не ходим
        let credentials = self
            .credentials
            .get_credentials()
            .await
            .map_err(SyncError::Config)?;

        let response = self
            .build_request(request, &credentials)?
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(
                "[SYNC] {} {} -> {} (mutation {})",
                request.method, request.table, status, request.mutation_id
            );
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if !body.is_empty() {
            warn!(
                "[SYNC] Mutation {} HTTP {} response body: {}",
                request.mutation_id,
                status.as_u16(),
                body
            );
        }
        let message = if body.is_empty() {
            status.canonical_reason().unwrap_or("Unknown").into()
        } else {
            body
        };
        Err(SyncError::Http {
            status: status.as_u16(),
            message,
        })
    }

    async fn probe(&self) -> bool {
        crate::network::check_online_status(&self.client, &self.api_base_url).await
    }
}
