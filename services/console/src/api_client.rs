//! HTTP client for the relay server API.

use async_trait::async_trait;
use relay_pipeline::{Event, EventPatch, NewEvent};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors talking to the relay server
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Relay server unreachable: {0}")]
    Transport(String),

    #[error("Relay server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Unexpected response body: {0}")]
    Decode(String),

    #[error("Subscription to {topic} rejected: {message}")]
    SubscriptionRejected { topic: String, message: String },
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status: 404, .. })
    }
}

/// Operations the console needs from the relay server
#[async_trait]
pub trait RelayApi: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), ApiError>;

    async fn fetch_events(&self) -> Result<Vec<Event>, ApiError>;

    async fn fetch_topic_events(&self, topic: &str) -> Result<Vec<Event>, ApiError>;

    async fn create_event(&self, event: &NewEvent) -> Result<Event, ApiError>;

    async fn update_event(&self, id: Uuid, patch: &EventPatch) -> Result<Event, ApiError>;
}

#[derive(Debug, Deserialize)]
struct SubscribeBody {
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// [`RelayApi`] over HTTP
pub struct HttpRelayApi {
    client: Client,
    base_url: String,
}

impl HttpRelayApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            return Err(Self::status_error(status, response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn status_error(status: StatusCode, response: reqwest::Response) -> ApiError {
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
        };
        ApiError::Status {
            status: status.as_u16(),
            message,
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(transport)?;
        Self::decode(response).await
    }
}

fn transport(e: reqwest::Error) -> ApiError {
    ApiError::Transport(e.to_string())
}

#[async_trait]
impl RelayApi for HttpRelayApi {
    async fn subscribe(&self, topic: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/topic/{}/subscribe", topic)))
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body: SubscribeBody = match response.json().await {
            Ok(body) => body,
            Err(e) if status.is_success() => return Err(ApiError::Decode(e.to_string())),
            Err(_) => {
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    message: status.canonical_reason().unwrap_or("unknown").to_string(),
                })
            }
        };

        if body.status == "success" {
            debug!(topic = %topic, message = %body.message, "Subscribed");
            Ok(())
        } else {
            Err(ApiError::SubscriptionRejected {
                topic: topic.to_string(),
                message: body.message,
            })
        }
    }

    async fn fetch_events(&self) -> Result<Vec<Event>, ApiError> {
        self.get("/event").await
    }

    async fn fetch_topic_events(&self, topic: &str) -> Result<Vec<Event>, ApiError> {
        self.get(&format!("/event/topic/{}", topic)).await
    }

    async fn create_event(&self, event: &NewEvent) -> Result<Event, ApiError> {
        let response = self
            .client
            .post(self.url("/event"))
            .json(event)
            .send()
            .await
            .map_err(transport)?;
        Self::decode(response).await
    }

    async fn update_event(&self, id: Uuid, patch: &EventPatch) -> Result<Event, ApiError> {
        let response = self
            .client
            .patch(self.url(&format!("/event/id/{}", id)))
            .json(patch)
            .send()
            .await
            .map_err(transport)?;
        Self::decode(response).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use relay_pipeline::Category;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpRelayApi {
        HttpRelayApi::new(server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_events_decodes_wire_format() {
        let mock_server = MockServer::start().await;
        let event = Event::detect("gas", json!({"co2": 900}));

        Mock::given(method("GET"))
            .and(path("/event"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![&event]))
            .mount(&mock_server)
            .await;

        let events = client(&mock_server).fetch_events().await.unwrap();
        assert_eq!(events, vec![event]);
    }

    #[tokio::test]
    async fn test_subscribe_success_and_rejection() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/topic/gas/subscribe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "message": "Subscribed to gas"
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/topic/motion/subscribe"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "status": "failed",
                "message": "Failed to subscribe to motion: broker down"
            })))
            .mount(&mock_server)
            .await;

        let api = client(&mock_server);
        assert!(api.subscribe("gas").await.is_ok());
        assert!(matches!(
            api.subscribe("motion").await,
            Err(ApiError::SubscriptionRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_sends_patch_and_maps_not_found() {
        let mock_server = MockServer::start().await;
        let mut event = Event::detect("gas", json!({}));
        let missing = Uuid::new_v4();

        let patch = EventPatch {
            acknowledged: Some(true),
            ..Default::default()
        };
        event.apply(&patch);

        Mock::given(method("PATCH"))
            .and(path(format!("/event/id/{}", event.id)))
            .and(body_json(json!({"acknowledged": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(&event))
            .mount(&mock_server)
            .await;

        Mock::given(method("PATCH"))
            .and(path(format!("/event/id/{}", missing)))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": "Not found: event",
                "code": "NOT_FOUND"
            })))
            .mount(&mock_server)
            .await;

        let api = client(&mock_server);
        let updated = api.update_event(event.id, &patch).await.unwrap();
        assert!(updated.acknowledged);

        let err = api.update_event(missing, &patch).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_create_event_posts_body() {
        let mock_server = MockServer::start().await;
        let new = NewEvent::new(Category::Alarm, "sensor_timeout", json!({"sensorId": "S1"}));
        let created = Event::from_new(new.clone());

        Mock::given(method("POST"))
            .and(path("/event"))
            .and(body_json(&new))
            .respond_with(ResponseTemplate::new(201).set_body_json(&created))
            .mount(&mock_server)
            .await;

        let event = client(&mock_server).create_event(&new).await.unwrap();
        assert_eq!(event.category, Category::Alarm);
        assert_eq!(event.topic, "sensor_timeout");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let api = HttpRelayApi::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert!(matches!(
            api.fetch_events().await,
            Err(ApiError::Transport(_))
        ));
    }
}
