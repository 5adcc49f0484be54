//! REST implementation of the backend contract.
//!
//! Records are reached through a PostgREST-style API (`/rest/v1/...`), stored
//! procedures through `/rest/v1/rpc/<name>`, and photos through the object
//! storage API (`/storage/v1/object/...`).

use std::time::Duration;

use async_trait::async_trait;
use fieldops_core::{AssetId, PartId, TicketId};
use fieldops_tickets::{Asset, Compatibility, Ticket};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::images::UPLOAD_TIMEOUT;

use super::{
    Backend, BackendError, BackendErrorKind, ConsumePart, ConsumePartsBatch, NewExpense,
    ObjectStorage, RawBackendError, TicketUpdate,
};

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub auth_token: Option<String>,
    pub bucket: String,
    /// Deadline for record and RPC requests.
    pub request_timeout: Duration,
    /// Deadline for object uploads, which carry whole photos.
    pub upload_timeout: Duration,
}

impl HttpBackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            auth_token: None,
            bucket: "ticket-photos".to_string(),
            request_timeout: Duration::from_secs(15),
            upload_timeout: UPLOAD_TIMEOUT,
        }
    }
}

/// Backend client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    config: HttpBackendConfig,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Public URL of an uploaded object.
    pub fn public_url(&self, path: &str) -> String {
        self.url(&format!(
            "/storage/v1/object/public/{}/{}",
            self.config.bucket, path
        ))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, self.url(path))
            .timeout(self.config.request_timeout);
        if let Some(key) = &self.config.api_key {
            req = req.header("apikey", key);
        }
        if let Some(token) = self.config.auth_token.as_ref().or(self.config.api_key.as_ref()) {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, BackendError> {
        let resp = req.send().await.map_err(map_transport)?;
        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(error_from_body(status, &body))
    }

    async fn rpc<T: Serialize + ?Sized>(&self, name: &str, body: &T) -> Result<Response, BackendError> {
        let req = self
            .request(Method::POST, &format!("/rest/v1/rpc/{name}"))
            .json(body);
        self.send(req).await
    }

    async fn select_one<T: DeserializeOwned>(
        &self,
        path: &str,
        what: String,
    ) -> Result<T, BackendError> {
        let resp = self.send(self.request(Method::GET, path)).await?;
        let mut rows: Vec<T> = resp
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        if rows.is_empty() {
            return Err(BackendError::NotFound(what));
        }
        Ok(rows.swap_remove(0))
    }
}

fn map_transport(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else if err.is_connect() {
        BackendError::Offline
    } else {
        BackendError::Transport(err.to_string())
    }
}

/// Build a classified error from a non-success response body.
fn error_from_body(status: StatusCode, body: &str) -> BackendError {
    if matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT) {
        return BackendError::Timeout;
    }
    let raw = serde_json::from_str::<RawBackendError>(body)
        .unwrap_or_else(|_| RawBackendError::new(body.trim()));
    raw.with_status(status.as_u16()).into()
}

/// PATCH body of a closure update; the id and guard travel in the query string.
fn update_body(update: &TicketUpdate) -> Value {
    json!({
        "status": update.status,
        "form_data": update.form_data,
        "closed_at": update.closed_at,
        "repair_cost": update.repair_cost,
        "maintenance_cost": update.maintenance_cost,
        "repair_duration": update.repair_duration,
    })
}

fn update_path(update: &TicketUpdate) -> String {
    let mut path = format!("/rest/v1/tickets?id=eq.{}", update.ticket_id);
    if let Some(expected) = update.expected_status {
        path.push_str(&format!("&status=eq.{expected}"));
    }
    path
}

#[async_trait]
impl Backend for HttpBackend {
    async fn consume_part(&self, request: &ConsumePart) -> Result<(), BackendError> {
        let body = json!({
            "p_ticket_id": request.ticket_id,
            "p_part_id": request.part_id,
            "p_quantity": request.quantity,
            "p_technician_id": request.technician_id,
        });
        self.rpc("consume_part", &body).await?;
        Ok(())
    }

    async fn consume_parts_batch(&self, request: &ConsumePartsBatch) -> Result<(), BackendError> {
        let body = json!({
            "p_ticket_id": request.ticket_id,
            "p_technician_id": request.technician_id,
            "p_idempotency_key": request.idempotency_key,
            "p_items": request.items,
        });
        self.rpc("consume_parts_batch", &body).await?;
        Ok(())
    }

    async fn fetch_ticket(&self, ticket_id: TicketId) -> Result<Ticket, BackendError> {
        self.select_one(
            &format!("/rest/v1/tickets?id=eq.{ticket_id}&select=*"),
            format!("ticket {ticket_id}"),
        )
        .await
    }

    async fn update_ticket(&self, update: &TicketUpdate) -> Result<(), BackendError> {
        let req = self
            .request(Method::PATCH, &update_path(update))
            .header("Prefer", "return=representation")
            .json(&update_body(update));
        let resp = self.send(req).await?;
        let rows: Vec<Value> = resp
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        if rows.is_empty() {
            return Err(BackendError::rejected(
                BackendErrorKind::WorkflowViolation,
                format!("ticket {} changed status before the closure was applied", update.ticket_id),
            ));
        }
        Ok(())
    }

    async fn insert_expense(&self, expense: &NewExpense) -> Result<(), BackendError> {
        let req = match expense.client_ref {
            Some(_) => self
                .request(Method::POST, "/rest/v1/expenses?on_conflict=client_ref")
                .header("Prefer", "resolution=ignore-duplicates"),
            None => self.request(Method::POST, "/rest/v1/expenses"),
        };
        self.send(req.json(expense)).await?;
        Ok(())
    }

    async fn fetch_asset(&self, asset_id: AssetId) -> Result<Asset, BackendError> {
        self.select_one(
            &format!("/rest/v1/assets?id=eq.{asset_id}&select=id,category,purchase_value"),
            format!("asset {asset_id}"),
        )
        .await
    }

    async fn check_compatibility(
        &self,
        asset_id: AssetId,
        part_id: PartId,
    ) -> Result<Compatibility, BackendError> {
        let body = json!({ "p_asset_id": asset_id, "p_part_id": part_id });
        let resp = self.rpc("check_part_compatibility", &body).await?;
        resp.json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn health(&self) -> bool {
        match self.request(Method::GET, "/rest/v1/").send().await {
            Ok(resp) => !resp.status().is_server_error(),
            Err(err) => {
                tracing::debug!("health probe failed: {err}");
                false
            }
        }
    }
}

#[async_trait]
impl ObjectStorage for HttpBackend {
    async fn upload(
        &self,
        path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BackendError> {
        let req = self
            .request(
                Method::POST,
                &format!("/storage/v1/object/{}/{}", self.config.bucket, path),
            )
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("x-upsert", "false")
            .timeout(self.config.upload_timeout)
            .body(bytes);
        self.send(req).await?;
        Ok(self.public_url(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fieldops_tickets::{FormData, TicketStatus};

    fn backend(base: &str) -> HttpBackend {
        HttpBackend::new(HttpBackendConfig::new(base)).unwrap()
    }

    fn update(expected: Option<TicketStatus>) -> TicketUpdate {
        TicketUpdate {
            ticket_id: TicketId::new(),
            status: TicketStatus::Closed,
            expected_status: expected,
            form_data: FormData::new(),
            closed_at: Utc::now(),
            repair_cost: 160.0,
            maintenance_cost: 200.0,
            repair_duration: Some(42),
        }
    }

    #[test]
    fn public_url_points_at_bucket() {
        let b = backend("https://api.example.test/");
        assert_eq!(
            b.public_url("tickets/1/a.jpg"),
            "https://api.example.test/storage/v1/object/public/ticket-photos/tickets/1/a.jpg"
        );
    }

    #[test]
    fn update_guard_is_a_status_filter() {
        let guarded = update(Some(TicketStatus::InProgress));
        assert!(update_path(&guarded).ends_with("&status=eq.in_progress"));

        let unguarded = update(None);
        assert!(!update_path(&unguarded).contains("status="));
    }

    #[test]
    fn update_body_uses_column_names() {
        let body = update_body(&update(None));
        assert_eq!(body["status"], json!("closed"));
        assert_eq!(body["repair_cost"], json!(160.0));
        assert_eq!(body["repair_duration"], json!(42));
        assert!(body.get("ticket_id").is_none());
    }

    #[test]
    fn error_bodies_are_classified() {
        let err = error_from_body(
            StatusCode::BAD_REQUEST,
            r#"{"code":"55P03","message":"could not obtain lock on row"}"#,
        );
        assert_eq!(err.kind(), Some(BackendErrorKind::ResourceBusy));

        let err = error_from_body(StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded");
        assert_eq!(err.kind(), Some(BackendErrorKind::Generic));

        assert_eq!(
            error_from_body(StatusCode::GATEWAY_TIMEOUT, ""),
            BackendError::Timeout
        );
    }

    /// Accepts connections and never answers.
    async fn silent_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn uploads_get_their_own_deadline() {
        let config = HttpBackendConfig {
            request_timeout: Duration::from_millis(100),
            upload_timeout: Duration::from_millis(600),
            ..HttpBackendConfig::new(silent_server().await)
        };
        let b = HttpBackend::new(config).unwrap();

        let started = std::time::Instant::now();
        let err = b.fetch_ticket(TicketId::new()).await.unwrap_err();
        assert_eq!(err, BackendError::Timeout);
        assert!(started.elapsed() < Duration::from_millis(600));

        let started = std::time::Instant::now();
        let err = b.upload("tickets/1/a.jpg", "image/jpeg", vec![1, 2, 3]).await.unwrap_err();
        assert_eq!(err, BackendError::Timeout);
        assert!(started.elapsed() >= Duration::from_millis(600), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn unreachable_host_is_offline() {
        let b = backend("http://127.0.0.1:1");
        let err = b.fetch_ticket(TicketId::new()).await.unwrap_err();
        assert!(err.is_transport(), "{err:?}");
        assert!(!b.health().await);
    }
}
