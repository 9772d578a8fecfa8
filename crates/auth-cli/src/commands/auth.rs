//! Session commands.

use crate::output::{self, OutputFormat};
use anyhow::Result;
use session_auth::{AuthClient, SessionState};

/// Check the stored session against the backend.
pub async fn status(client: &AuthClient, format: &OutputFormat) -> Result<()> {
    let state = client.restore_session().await?;

    match format {
        OutputFormat::Text => {
            output::print_row("Session", state.name());
            if let SessionState::Authenticated(user) = &state {
                output::print_row("User", &user.id);
                output::print_row("Email", &user.email);
                if let Some(name) = &user.display_name {
                    output::print_row("Name", name);
                }
            }
        }
        OutputFormat::Json => output::print_json(&state),
    }
    Ok(())
}

/// Exchange an identity token for a session.
pub async fn sign_in(client: &AuthClient, id_token: &str, format: &OutputFormat) -> Result<()> {
    if client.restore_session().await?.is_authenticated() {
        output::print_success("Already signed in. Sign out first to switch accounts", format);
        return Ok(());
    }

    let user = client.sign_in(id_token).await?;
    match format {
        OutputFormat::Text => println!("Signed in as {}", user.email),
        OutputFormat::Json => output::print_json(&user),
    }
    Ok(())
}

/// Sign out and clear stored credentials.
pub async fn sign_out(client: &AuthClient, format: &OutputFormat) -> Result<()> {
    client.sign_out().await?;
    output::print_success("Signed out", format);
    Ok(())
}

/// Refresh the access token.
pub async fn refresh(client: &AuthClient, force: bool, format: &OutputFormat) -> Result<()> {
    let coordinator = client.coordinator();
    if force {
        coordinator.force_refresh().await?;
    } else {
        coordinator.refresh_if_needed().await?;
    }

    let expires_at = client.store().credential()?.and_then(|c| c.expires_at);
    match format {
        OutputFormat::Text => match expires_at {
            Some(at) => println!("Access token refreshed, expires {}", at.to_rfc3339()),
            None => println!("Access token refreshed"),
        },
        OutputFormat::Json => output::print_json(&serde_json::json!({
            "status": "success",
            "expires_at": expires_at,
        })),
    }
    Ok(())
}
