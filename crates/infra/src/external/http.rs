//! Session-based REST ERP driver.
//!
//! `POST /Login` returns a `SessionId` that is sent back on every call as the
//! `B1SESSION` cookie; `POST /Logout` ends the session. Documents are posted
//! as JSON and the ERP answers with its entry/number pair.
//!
//! Classification:
//! - transport errors, timeouts, 401 (session expired), 408, 429, 5xx: transient
//! - any other 4xx, or an unreadable success body: permanent

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use packline_core::OperationId;
use packline_operations::ExternalRef;

use super::connection::{ConnectionManager, SessionFactory};
use super::{DocumentKind, ErpError, ExternalDocumentStatus, SyncAdapter, SyncLine};
use crate::config::ErpCredentials;

const SESSION_COOKIE: &str = "B1SESSION";

#[derive(Debug, Clone)]
pub struct HttpSession {
    session_id: String,
}

impl HttpSession {
    fn cookie(&self) -> String {
        format!("{SESSION_COOKIE}={}", self.session_id)
    }
}

pub struct HttpSessionFactory {
    client: Client,
    credentials: ErpCredentials,
}

impl HttpSessionFactory {
    pub fn new(credentials: ErpCredentials, timeout: Duration) -> Result<Self, ErpError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ErpError::permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, credentials })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.credentials.base_url.trim_end_matches('/'), path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        session: &HttpSession,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ErpError> {
        let response = request
            .header(reqwest::header::COOKIE, session.cookie())
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ErpError::permanent(format!("unreadable ERP response: {e}")))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        session: &HttpSession,
        path: &str,
        body: &Value,
    ) -> Result<T, ErpError> {
        self.send(session, self.client.post(self.url(path)).json(body)).await
    }

    async fn get<T: DeserializeOwned>(&self, session: &HttpSession, path: &str) -> Result<T, ErpError> {
        self.send(session, self.client.get(self.url(path))).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LoginResponse {
    session_id: String,
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    type Session = HttpSession;

    async fn open(&self) -> Result<HttpSession, ErpError> {
        let body = json!({
            "CompanyDB": self.credentials.company,
            "UserName": self.credentials.username,
            "Password": self.credentials.password,
        });
        let response = self
            .client
            .post(self.url("Login"))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            // A rejected login is a configuration problem, not a session expiry.
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    ErpError::permanent(format!("ERP login rejected: {}", error_message(&text)))
                }
                _ => classify_status(status, &text),
            });
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| ErpError::transient(format!("unreadable login response: {e}")))?;
        info!(company = %self.credentials.company, "logged in to ERP");
        Ok(HttpSession {
            session_id: login.session_id,
        })
    }

    async fn close(&self, session: &HttpSession) {
        let result = self
            .client
            .post(self.url("Logout"))
            .header(reqwest::header::COOKIE, session.cookie())
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => debug!("logged out of ERP"),
            Ok(response) => warn!(status = %response.status(), "ERP logout failed"),
            Err(e) => warn!(error = %e, "ERP logout failed"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DocumentResponse {
    #[serde(alias = "DocumentEntry")]
    doc_entry: i64,
    #[serde(alias = "DocumentNumber")]
    doc_num: i64,
}

impl From<DocumentResponse> for ExternalRef {
    fn from(doc: DocumentResponse) -> Self {
        ExternalRef {
            entry: doc.doc_entry,
            number: doc.doc_num,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PickListResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SeriesResponse {
    series: i64,
}

/// Sync adapter for the session-based REST ERP.
pub struct HttpErpAdapter {
    connection: ConnectionManager<HttpSessionFactory>,
}

impl HttpErpAdapter {
    pub fn new(connection: ConnectionManager<HttpSessionFactory>) -> Self {
        Self { connection }
    }

    async fn post_document(&self, path: &str, body: Value) -> Result<ExternalRef, ErpError> {
        let guard = self.connection.acquire().await?;
        let result = self
            .connection
            .factory()
            .post::<DocumentResponse>(guard.session(), path, &body)
            .await
            .map(ExternalRef::from);
        guard.finish(result).await
    }
}

#[async_trait]
impl SyncAdapter for HttpErpAdapter {
    fn name(&self) -> &'static str {
        "http"
    }

    #[instrument(skip(self, lines), fields(operation_id = %operation_id, line_count = lines.len()), err)]
    async fn push_counting(
        &self,
        operation_id: OperationId,
        warehouse_code: &str,
        lines: &[SyncLine],
        series_number: i64,
    ) -> Result<ExternalRef, ErpError> {
        self.post_document("InventoryCountings", counting_body(operation_id, warehouse_code, lines, series_number))
            .await
    }

    #[instrument(skip(self, lines), fields(operation_id = %operation_id, line_count = lines.len()), err)]
    async fn push_transfer(
        &self,
        operation_id: OperationId,
        warehouse_code: &str,
        comments: Option<&str>,
        lines: &[SyncLine],
    ) -> Result<ExternalRef, ErpError> {
        self.post_document("StockTransfers", transfer_body(operation_id, warehouse_code, comments, lines))
            .await
    }

    #[instrument(skip(self, lines), fields(operation_id = %operation_id, line_count = lines.len()), err)]
    async fn push_receipt(
        &self,
        operation_id: OperationId,
        warehouse_code: &str,
        comments: Option<&str>,
        lines: &[SyncLine],
    ) -> Result<ExternalRef, ErpError> {
        self.post_document("InventoryGenEntries", receipt_body(operation_id, warehouse_code, comments, lines))
            .await
    }

    #[instrument(skip(self), err)]
    async fn query_document_status(&self, external_entry: i64) -> Result<ExternalDocumentStatus, ErpError> {
        let guard = self.connection.acquire().await?;
        let result = self
            .connection
            .factory()
            .get::<PickListResponse>(guard.session(), &format!("PickLists({external_entry})"))
            .await
            .and_then(|r| parse_pick_status(&r.status));
        guard.finish(result).await
    }

    #[instrument(skip(self), err)]
    async fn get_next_series_number(&self, kind: DocumentKind) -> Result<i64, ErpError> {
        let body = json!({ "DocumentTypeParams": { "Document": document_code(kind) } });
        let guard = self.connection.acquire().await?;
        let result = self
            .connection
            .factory()
            .post::<SeriesResponse>(guard.session(), "SeriesService_GetDefaultSeries", &body)
            .await
            .map(|r| r.series);
        guard.finish(result).await
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    async fn shutdown(&self) {
        self.connection.shutdown().await;
    }
}

/// ERP object codes for the series service.
fn document_code(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Counting => "1470000065",
        DocumentKind::Transfer => "67",
        DocumentKind::Receipt => "59",
        DocumentKind::Pick => "156",
    }
}

fn counting_body(operation_id: OperationId, warehouse_code: &str, lines: &[SyncLine], series: i64) -> Value {
    let lines: Vec<Value> = lines
        .iter()
        .map(|l| {
            json!({
                "ItemCode": l.item_code,
                "WarehouseCode": warehouse_code,
                "CountedQuantity": l.quantity,
                "Counted": "tYES",
            })
        })
        .collect();
    json!({
        "Series": series,
        "Reference2": operation_id.to_string(),
        "InventoryCountingLines": lines,
    })
}

fn transfer_body(
    operation_id: OperationId,
    warehouse_code: &str,
    comments: Option<&str>,
    lines: &[SyncLine],
) -> Value {
    let lines: Vec<Value> = lines
        .iter()
        .map(|l| {
            json!({
                "ItemCode": l.item_code,
                "Quantity": l.quantity,
                "WarehouseCode": warehouse_code,
            })
        })
        .collect();
    json!({
        "FromWarehouse": warehouse_code,
        "Comments": comments,
        "JournalMemo": operation_id.to_string(),
        "StockTransferLines": lines,
    })
}

fn receipt_body(
    operation_id: OperationId,
    warehouse_code: &str,
    comments: Option<&str>,
    lines: &[SyncLine],
) -> Value {
    let lines: Vec<Value> = lines
        .iter()
        .map(|l| {
            json!({
                "ItemCode": l.item_code,
                "Quantity": l.quantity,
                "WarehouseCode": warehouse_code,
            })
        })
        .collect();
    json!({
        "Comments": comments,
        "JournalMemo": operation_id.to_string(),
        "DocumentLines": lines,
    })
}

fn parse_pick_status(status: &str) -> Result<ExternalDocumentStatus, ErpError> {
    match status {
        "ps_Open" => Ok(ExternalDocumentStatus::Open),
        "ps_Released" | "ps_Picked" | "ps_PartiallyPicked" | "ps_PartiallyDelivered" => {
            Ok(ExternalDocumentStatus::Released)
        }
        "ps_Closed" => Ok(ExternalDocumentStatus::Closed),
        "ps_Cancelled" => Ok(ExternalDocumentStatus::Cancelled),
        other => Err(ErpError::permanent(format!("unknown pick list status {other}"))),
    }
}

fn classify_transport(err: reqwest::Error) -> ErpError {
    // Anything that failed before a status line arrived: timeouts, refused
    // connections, resets. The ERP may or may not have seen the request.
    if err.is_builder() {
        ErpError::permanent(format!("invalid ERP request: {err}"))
    } else {
        ErpError::transient(format!("ERP unreachable: {err}"))
    }
}

fn classify_status(status: StatusCode, body: &str) -> ErpError {
    let msg = format!("ERP returned {}: {}", status.as_u16(), error_message(body));
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ErpError::Transient(msg)
    } else {
        ErpError::Permanent(msg)
    }
}

/// Pull `error.message.value` out of an ERP error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message/value")
                .or_else(|| v.pointer("/error/message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use packline_core::OperationLineId;

    fn lines() -> Vec<SyncLine> {
        vec![SyncLine {
            line_id: OperationLineId::new(),
            item_code: "ITEM-1".to_string(),
            quantity: 20,
        }]
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, "").is_transient());
    }

    #[test]
    fn error_message_prefers_erp_payload() {
        let body = r#"{"error":{"code":-10,"message":{"lang":"en-us","value":"Item ITEM-1 is inactive"}}}"#;
        let err = classify_status(StatusCode::BAD_REQUEST, body);
        assert_eq!(
            err,
            ErpError::Permanent("ERP returned 400: Item ITEM-1 is inactive".to_string())
        );
        assert_eq!(error_message("gateway exploded"), "gateway exploded");
    }

    #[test]
    fn document_bodies_carry_lines_and_reference() {
        let op = OperationId::new();
        let counting = counting_body(op, "WH01", &lines(), 42);
        assert_eq!(counting["Series"], 42);
        assert_eq!(counting["InventoryCountingLines"][0]["CountedQuantity"], 20);
        assert_eq!(counting["Reference2"], op.to_string());

        let transfer = transfer_body(op, "WH01", Some("restock"), &lines());
        assert_eq!(transfer["FromWarehouse"], "WH01");
        assert_eq!(transfer["StockTransferLines"][0]["ItemCode"], "ITEM-1");

        let receipt = receipt_body(op, "WH02", None, &lines());
        assert!(receipt["Comments"].is_null());
        assert_eq!(receipt["DocumentLines"][0]["WarehouseCode"], "WH02");
    }

    #[test]
    fn pick_status_mapping() {
        assert_eq!(parse_pick_status("ps_Open").unwrap(), ExternalDocumentStatus::Open);
        assert_eq!(parse_pick_status("ps_Picked").unwrap(), ExternalDocumentStatus::Released);
        assert_eq!(parse_pick_status("ps_Closed").unwrap(), ExternalDocumentStatus::Closed);
        assert!(parse_pick_status("ps_Lost").is_err());
    }

    #[test]
    fn session_cookie_format() {
        let session = HttpSession {
            session_id: "abc-123".to_string(),
        };
        assert_eq!(session.cookie(), "B1SESSION=abc-123");
    }
}
