// REST client for a Home Assistant style controller
// Bearer auth, bounded timeouts, transport retries with exponential backoff

use super::{backoff_delay, Controller};
use crate::config::RestConfig;
use crate::error::{MedicError, MedicResult};
use crate::state::EntityState;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// HTTP client bound to one controller instance
#[derive(Clone)]
pub struct HomeAssistantClient {
    /// Base URL without trailing slash
    base_url: String,

    token: String,

    http: reqwest::Client,

    max_retries: u32,

    retry_base: Duration,
}

impl std::fmt::Debug for HomeAssistantClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HomeAssistantClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HomeAssistantClient {
    pub fn new(base_url: &str, token: &str, config: &RestConfig) -> MedicResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("home-medic/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MedicError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send one request, retrying transport failures, and map the status
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> MedicResult<Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;

        let response = loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.token)
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => break response,
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = backoff_delay(attempt, self.retry_base, Duration::from_secs(30));
                    warn!(%url, attempt, delay_ms = delay.as_millis() as u64, error = %e, "request failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(MedicError::Connection(format!("{method} {path}: {e}")));
                }
            }
        };

        let status = response.status();
        debug!(%method, %path, status = status.as_u16(), "controller responded");

        match status {
            s if s.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED => Err(MedicError::Auth(format!("{method} {path} rejected the access token"))),
            StatusCode::NOT_FOUND => Err(MedicError::NotFound(path.to_string())),
            s => {
                let message = response.text().await.unwrap_or_default();
                Err(MedicError::Remote {
                    status: s.as_u16(),
                    message,
                })
            }
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response, what: &str) -> MedicResult<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| MedicError::Protocol(format!("invalid {what} payload: {e}")))
    }
}

#[async_trait]
impl Controller for HomeAssistantClient {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn get_states(&self) -> MedicResult<Vec<EntityState>> {
        let response = self.send(Method::GET, "/api/states", &[], None).await?;
        Self::json(response, "states").await
    }

    async fn get_state(&self, entity_id: &str) -> MedicResult<EntityState> {
        let path = format!("/api/states/{entity_id}");
        let response = self.send(Method::GET, &path, &[], None).await?;
        Self::json(response, "state").await
    }

    #[instrument(skip(self, data), fields(base_url = %self.base_url))]
    async fn call_service(&self, domain: &str, service: &str, data: Value) -> MedicResult<()> {
        let path = format!("/api/services/{domain}/{service}");
        self.send(Method::POST, &path, &[], Some(&data)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn reload_config_entry(&self, entry_id: &str) -> MedicResult<()> {
        let path = format!("/api/config/config_entries/entry/{entry_id}/reload");
        self.send(Method::POST, &path, &[], None).await?;
        Ok(())
    }

    async fn create_notification(
        &self,
        title: &str,
        message: &str,
        notification_id: Option<&str>,
    ) -> MedicResult<()> {
        let mut body = json!({ "title": title, "message": message });
        if let Some(id) = notification_id {
            body["notification_id"] = Value::String(id.to_string());
        }
        self.send(
            Method::POST,
            "/api/services/persistent_notification/create",
            &[],
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn history(&self, entity_id: &str, start: DateTime<Utc>) -> MedicResult<Vec<EntityState>> {
        let path = format!(
            "/api/history/period/{}",
            start.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let response = self
            .send(Method::GET, &path, &[("filter_entity_id", entity_id)], None)
            .await?;
        let series: Vec<Vec<EntityState>> = Self::json(response, "history").await?;
        Ok(series.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config() -> RestConfig {
        RestConfig {
            timeout_secs: 5,
            max_retries: 2,
            retry_base_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_get_states_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/states"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"entity_id": "light.kitchen", "state": "on", "attributes": {"brightness": 200},
                 "last_updated": "2024-05-01T10:00:00+00:00"},
                {"entity_id": "sensor.door", "state": "unavailable", "attributes": {},
                 "last_updated": "2024-05-01T10:00:00+00:00"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = HomeAssistantClient::new(&format!("{}/", server.uri()), "secret", &config()).unwrap();
        let states = client.get_states().await.unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[1].state, "unavailable");
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/states/sensor.gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/config/config_entries/entry/abc/reload"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/services/hue/reload"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = HomeAssistantClient::new(&server.uri(), "secret", &config()).unwrap();

        let err = client.get_state("sensor.gone").await.unwrap_err();
        assert!(matches!(err, MedicError::NotFound(_)));

        let err = client.reload_config_entry("abc").await.unwrap_err();
        assert!(matches!(err, MedicError::Auth(_)));

        let err = client.call_service("hue", "reload", json!({})).await.unwrap_err();
        match err {
            MedicError::Remote { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transport_failure_exhausts_retries() {
        // Bind then drop a listener so the port refuses connections
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HomeAssistantClient::new(&format!("http://{addr}"), "secret", &config()).unwrap();
        let err = client.get_states().await.unwrap_err();
        assert!(matches!(err, MedicError::Connection(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_notification_and_history() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/services/persistent_notification/create"))
            .and(body_partial_json(json!({"title": "Healing failed", "notification_id": "medic_1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/history/period/2024-05-01T00:00:00Z"))
            .and(query_param("filter_entity_id", "sensor.door"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([[
                {"entity_id": "sensor.door", "state": "on", "last_updated": "2024-05-01T01:00:00+00:00"},
                {"entity_id": "sensor.door", "state": "off", "last_updated": "2024-05-01T02:00:00+00:00"}
            ]])))
            .mount(&server)
            .await;

        let client = HomeAssistantClient::new(&server.uri(), "secret", &config()).unwrap();
        client
            .create_notification("Healing failed", "details", Some("medic_1"))
            .await
            .unwrap();

        let start = DateTime::parse_from_rfc3339("2024-05-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let history = client.history("sensor.door", start).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].state, "off");
    }
}
