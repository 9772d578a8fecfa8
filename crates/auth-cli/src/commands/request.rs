//! Raw authenticated requests.

use crate::output::{self, OutputFormat};
use anyhow::Result;
use session_auth::{ApiRequest, AuthClient};
use tracing::debug;

/// `GET <path>` through the gateway; non-success statuses are printed, not raised.
pub async fn get(client: &AuthClient, path: &str, format: &OutputFormat) -> Result<()> {
    let response = client.gateway().send(ApiRequest::get(path)).await?;
    debug!(path = %path, status = response.status, "Request completed");

    let body = serde_json::from_str::<serde_json::Value>(&response.body)
        .unwrap_or_else(|_| serde_json::Value::String(response.body.clone()));

    match format {
        OutputFormat::Text => {
            println!("HTTP {}", response.status);
            match &body {
                serde_json::Value::String(text) => println!("{}", text),
                other => output::print_json(other),
            }
        }
        OutputFormat::Json => output::print_json(&serde_json::json!({
            "status": response.status,
            "body": body,
        })),
    }
    Ok(())
}
