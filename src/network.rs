use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// Проверка online статуса через легковесный HTTP запрос к удалённому хранилищу.
// Любой HTTP-ответ (даже 401/404) означает, что сервер достижим.
pub async fn check_online_status(client: &Client, probe_url: &str) -> bool {
    match client.get(probe_url).timeout(PROBE_TIMEOUT).send().await {
        Ok(response) => {
            debug!("[NET] Probe {} -> {}", probe_url, response.status());
            true
        }
        Err(e) => {
            debug!("[NET] Probe {} failed: {}", probe_url, e);
            false
        }
    }
}
