//! Account linking commands.

use crate::output::{self, OutputFormat};
use anyhow::Result;
use session_auth::AuthClient;

pub async fn link_start(client: &AuthClient, provider: &str, format: &OutputFormat) -> Result<()> {
    let start = client.links().start(provider).await?;
    match format {
        OutputFormat::Text => {
            println!("Open this URL to authorize {}:", start.provider);
            println!();
            println!("  {}", start.auth_url);
            println!();
            println!(
                "Then run: keyward link complete {} --state <state> --code <code>",
                start.provider
            );
        }
        OutputFormat::Json => output::print_json(&start),
    }
    Ok(())
}

pub async fn link_complete(
    client: &AuthClient,
    provider: &str,
    state: &str,
    code: &str,
    format: &OutputFormat,
) -> Result<()> {
    let completion = client.links().complete(provider, state, code).await?;
    match format {
        OutputFormat::Text => println!("Linked {}", completion.provider),
        OutputFormat::Json => output::print_json(&completion),
    }
    Ok(())
}

pub fn link_pending(client: &AuthClient, provider: &str, format: &OutputFormat) -> Result<()> {
    let pending = client.links().is_pending(provider)?;
    match format {
        OutputFormat::Text => {
            output::print_row("Provider", provider);
            output::print_row("Pending", if pending { "yes" } else { "no" });
        }
        OutputFormat::Json => output::print_json(&serde_json::json!({
            "provider": provider,
            "pending": pending,
        })),
    }
    Ok(())
}
