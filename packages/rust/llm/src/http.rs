//! Shared HTTP plumbing for the model backends.

use std::time::Duration;

use reqwest::{Client, Response};

use specextract_shared::{Result, SpecExtractError};

/// User-Agent string for backend requests.
const USER_AGENT: &str = concat!("specextract/", env!("CARGO_PKG_VERSION"));

/// Longest slice of an error body carried into the error message.
const MAX_ERROR_BODY: usize = 300;

/// Build the HTTP client used by a backend.
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| SpecExtractError::Network(format!("failed to build HTTP client: {e}")))
}

/// Turn a non-2xx response into an [`SpecExtractError::Oracle`].
pub(crate) async fn error_for_status(backend: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
    Err(SpecExtractError::Oracle(format!(
        "{backend}: HTTP {status}: {snippet}"
    )))
}
