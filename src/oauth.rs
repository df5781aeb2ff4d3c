use std::time::Duration;

use reqwest::Client;
use reqwest::tls::Version;
use tracing::debug;

use crate::error::OAuthError;
use crate::model::{OidcConfig, TokenResponse};

const DISCOVERY_SUFFIX: &str = "/.well-known/openid-configuration";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTPS client for OIDC discovery and the client-credentials grant.
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: Client,
}

impl TokenClient {
    /// Builds the shared client: 10s timeout, TLS 1.2 floor.
    pub fn new() -> Result<Self, OAuthError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .min_tls_version(Version::TLS_1_2)
            .build()
            .map_err(|source| OAuthError::Transport {
                what: "HTTP client setup",
                source,
            })?;
        Ok(Self { http })
    }

    /// Fetches `{issuer}/.well-known/openid-configuration`.
    pub async fn discover(&self, issuer: &str) -> Result<OidcConfig, OAuthError> {
        require_https("issuer URL", issuer)?;
        fetch_discovery(&self.http, &discovery_url(issuer)).await
    }

    /// Performs the `client_credentials` grant at `token_endpoint`.
    pub async fn exchange_client_credentials(
        &self,
        token_endpoint: &str,
        client_id: &str,
        client_secret: &str,
        scope: &str,
    ) -> Result<TokenResponse, OAuthError> {
        require_https("token endpoint", token_endpoint)?;
        request_token(&self.http, token_endpoint, client_id, client_secret, scope).await
    }
}

fn require_https(what: &'static str, url: &str) -> Result<(), OAuthError> {
    let secure = url
        .get(..8)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"));
    if secure {
        Ok(())
    } else {
        Err(OAuthError::InsecureScheme {
            what,
            url: url.to_string(),
        })
    }
}

/// Discovery document URL; one trailing slash on the issuer is dropped.
pub fn discovery_url(issuer: &str) -> String {
    let base = issuer.strip_suffix('/').unwrap_or(issuer);
    format!("{}{}", base, DISCOVERY_SUFFIX)
}

fn request_error(what: &'static str, source: reqwest::Error) -> OAuthError {
    if source.is_timeout() {
        OAuthError::Timeout { what }
    } else {
        OAuthError::Transport { what, source }
    }
}

/// Discovery request without the scheme check, so tests can point it at a mock server.
async fn fetch_discovery(client: &Client, url: &str) -> Result<OidcConfig, OAuthError> {
    const WHAT: &str = "OIDC discovery request";
    debug!("OIDC discovery: GET {}", url);
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| request_error(WHAT, e))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(OAuthError::DiscoveryStatus {
            status: status.as_u16(),
        });
    }
    let body = resp.text().await.map_err(|e| request_error(WHAT, e))?;
    let config: OidcConfig =
        serde_json::from_str(&body).map_err(|source| OAuthError::MalformedResponse {
            what: "OIDC discovery response",
            source,
        })?;
    if config.token_endpoint.is_empty() {
        return Err(OAuthError::MissingTokenEndpoint);
    }
    Ok(config)
}

/// Token request without the scheme check. An empty scope is left out of the form.
async fn request_token(
    client: &Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: &str,
    scope: &str,
) -> Result<TokenResponse, OAuthError> {
    const WHAT: &str = "token request";
    let mut form = vec![
        ("grant_type", "client_credentials"),
        ("client_id", client_id),
        ("client_secret", client_secret),
    ];
    if !scope.is_empty() {
        form.push(("scope", scope));
    }
    debug!("token request: POST {} (scope={:?})", token_endpoint, scope);
    let resp = client
        .post(token_endpoint)
        .form(&form)
        .send()
        .await
        .map_err(|e| request_error(WHAT, e))?;
    let status = resp.status();
    let body = resp.text().await.map_err(|e| request_error(WHAT, e))?;
    if !status.is_success() {
        return Err(OAuthError::TokenExchange {
            status: status.as_u16(),
            body,
        });
    }
    serde_json::from_str(&body).map_err(|source| OAuthError::MalformedResponse {
        what: "token response",
        source,
    })
}
