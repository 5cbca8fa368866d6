//! OAuth2 for the Gmail API

use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use std::env;
use std::path::Path;
use tracing::{debug, info};
use yup_oauth2::ApplicationSecret;

use crate::error::{LabellerError, Result};

/// Scopes needed to read unread mail, manage labels and label messages
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.labels",
];

pub type GmailHub =
    Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// Load the OAuth client secret. The credentials file wins; without it the
/// `GMAIL_CLIENT_ID` / `GMAIL_CLIENT_SECRET` variables are used.
pub async fn load_secret(credentials_path: &Path) -> Result<ApplicationSecret> {
    if tokio::fs::try_exists(credentials_path).await.unwrap_or(false) {
        debug!("Reading OAuth client secret from {}", credentials_path.display());
        return yup_oauth2::read_application_secret(credentials_path)
            .await
            .map_err(|e| LabellerError::AuthError(format!("Failed to read credentials: {}", e)));
    }

    secret_from_env().map_err(|_| {
        LabellerError::AuthError(format!(
            "No credentials at {} and GMAIL_CLIENT_ID/GMAIL_CLIENT_SECRET are not set",
            credentials_path.display()
        ))
    })
}

fn secret_from_env() -> Result<ApplicationSecret> {
    let client_id = env::var("GMAIL_CLIENT_ID")
        .map_err(|_| LabellerError::ConfigError("GMAIL_CLIENT_ID not set".to_string()))?;
    let client_secret = env::var("GMAIL_CLIENT_SECRET")
        .map_err(|_| LabellerError::ConfigError("GMAIL_CLIENT_SECRET not set".to_string()))?;
    let redirect_uri =
        env::var("GMAIL_REDIRECT_URI").unwrap_or_else(|_| "http://localhost:8080".to_string());

    Ok(ApplicationSecret {
        client_id,
        client_secret,
        auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
        token_uri: "https://oauth2.googleapis.com/token".to_string(),
        redirect_uris: vec![redirect_uri],
        ..Default::default()
    })
}

/// Authenticate (opening the browser flow when no cached token exists) and
/// build a Gmail hub. The token is fetched up front so every concurrent call
/// shares one cached token with the right scopes.
pub async fn connect(credentials_path: &Path, token_cache_path: &Path) -> Result<GmailHub> {
    let secret = load_secret(credentials_path).await?;

    if let Some(parent) = token_cache_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
        secret,
        yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .persist_tokens_to_disk(token_cache_path)
    .build()
    .await
    .map_err(|e| LabellerError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    auth.token(SCOPES)
        .await
        .map_err(|e| LabellerError::AuthError(format!("Failed to obtain token: {}", e)))?;

    if tokio::fs::try_exists(token_cache_path).await.unwrap_or(false) {
        secure_token_file(token_cache_path).await?;
    }
    info!("Authenticated with Gmail");

    // HTTP/1 only; google-gmail1 is more reliable without h2
    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| LabellerError::AuthError(format!("Failed to load TLS roots: {}", e)))?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    Ok(Gmail::new(client, auth))
}

/// Restrict the token cache to the owner
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    Ok(())
}
