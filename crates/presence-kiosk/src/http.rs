use reqwest::{Client, RequestBuilder};
use std::time::Duration;

/// Shared HTTP client for the backend endpoints.
pub fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("presence/", env!("CARGO_PKG_VERSION")))
        .build()
}

pub(crate) fn with_token(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}
