//! Attendance reporting to the HR backend.

use crate::http::with_token;
use async_trait::async_trait;
use presence_core::AttendanceMode;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReportError {
    /// The backend refused the event (e.g. "already checked in today").
    #[error("{0}")]
    Rejected(String),
    #[error("attendance request failed: {0}")]
    Network(String),
}

#[async_trait]
pub trait AttendanceReporter: Send + Sync {
    async fn report(&self, employee_id: &str, mode: AttendanceMode) -> Result<(), ReportError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportRequest<'a> {
    employee_id: &'a str,
    mode: AttendanceMode,
}

#[derive(Deserialize, Default)]
struct ReportResponse {
    success: Option<bool>,
    message: Option<String>,
    error: Option<String>,
}

impl ReportResponse {
    fn reason(self) -> Option<String> {
        self.message.or(self.error).filter(|r| !r.trim().is_empty())
    }
}

/// `POST {employeeId, mode}` to the attendance endpoint.
pub struct HttpReporter {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpReporter {
    pub fn new(client: Client, url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl AttendanceReporter for HttpReporter {
    async fn report(&self, employee_id: &str, mode: AttendanceMode) -> Result<(), ReportError> {
        let body = ReportRequest { employee_id, mode };
        let request = with_token(self.client.post(&self.url).json(&body), self.token.as_deref());

        let response = request
            .send()
            .await
            .map_err(|e| ReportError::Network(e.to_string()))?;
        let status = response.status();
        // Some endpoints answer with an empty body; that is fine on success.
        let text = response.text().await.unwrap_or_default();
        let parsed: ReportResponse = serde_json::from_str(&text).unwrap_or_default();

        if status.is_success() {
            if parsed.success == Some(false) {
                let reason = parsed.reason().unwrap_or_else(|| "attendance rejected".to_string());
                tracing::warn!(employee_id, %mode, reason = %reason, "attendance rejected");
                return Err(ReportError::Rejected(reason));
            }
            tracing::info!(employee_id, %mode, "attendance recorded");
            return Ok(());
        }

        let reason = parsed
            .reason()
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        tracing::warn!(
            employee_id,
            %mode,
            status = status.as_u16(),
            reason = %reason,
            "attendance rejected"
        );
        if status.is_server_error() {
            Err(ReportError::Network(reason))
        } else {
            Err(ReportError::Rejected(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn reporter(server: &mockito::Server) -> HttpReporter {
        HttpReporter::new(Client::new(), format!("{}/attendance", server.url()), None)
    }

    #[tokio::test]
    async fn test_posts_employee_and_mode() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/attendance")
            .match_body(Matcher::Json(serde_json::json!({"employeeId": "E1", "mode": "checkIn"})))
            .with_status(200)
            .with_body(r#"{"success": true}"#)
            .create_async()
            .await;

        reporter(&server).report("E1", AttendanceMode::CheckIn).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_business_rejection_carries_reason() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/attendance")
            .with_status(409)
            .with_body(r#"{"message": "already checked in today"}"#)
            .create_async()
            .await;

        let err = reporter(&server).report("E1", AttendanceMode::CheckIn).await.unwrap_err();
        assert_eq!(err, ReportError::Rejected("already checked in today".into()));
    }

    #[tokio::test]
    async fn test_success_false_is_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/attendance")
            .with_status(200)
            .with_body(r#"{"success": false, "error": "not checked in yet"}"#)
            .create_async()
            .await;

        let err = reporter(&server).report("E1", AttendanceMode::CheckOut).await.unwrap_err();
        assert_eq!(err, ReportError::Rejected("not checked in yet".into()));
    }

    #[tokio::test]
    async fn test_server_error_without_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", "/attendance").with_status(500).create_async().await;

        let err = reporter(&server).report("E1", AttendanceMode::CheckIn).await.unwrap_err();
        assert_eq!(err, ReportError::Network("HTTP 500".into()));
    }
}
