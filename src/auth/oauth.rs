use log::{debug, info, warn};
use oauth2::basic::{BasicClient, BasicErrorResponseType, BasicTokenResponse};
use oauth2::reqwest::http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tiny_http::{Response, Server};
use url::Url;

use crate::error::{ExportError, Result};
use crate::providers::OAuthEndpoints;

pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8080/callback";

/// Tokens returned by an exchange (in-memory)
#[derive(Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<Duration>,
    pub scope: Vec<String>,
}

/// Network side of the OAuth2 lifecycle.
pub trait OAuthEndpoint: Send + Sync {
    /// Interactive authorization-code grant with PKCE.
    fn authorize(&self, identity: &str) -> Result<TokenGrant>;

    /// Exchange a refresh token. A rejected refresh token is `AuthExpired`.
    fn refresh(&self, identity: &str, refresh_token: &str) -> Result<TokenGrant>;
}

/// [`OAuthEndpoint`] backed by the `oauth2` crate and a loopback redirect
/// listener.
pub struct OAuthClient {
    client_id: String,
    client_secret: Option<String>,
    redirect_uri: String,
    endpoints: OAuthEndpoints,
    callback_timeout: Duration,
}

impl OAuthClient {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: Option<String>,
        redirect_uri: Option<String>,
        endpoints: OAuthEndpoints,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            redirect_uri: redirect_uri.unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
            endpoints,
            callback_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    fn basic_client(&self) -> Result<BasicClient> {
        let auth_url = AuthUrl::new(self.endpoints.auth_url.clone())
            .map_err(|e| ExportError::InvalidConfig(format!("bad OAuth auth_url: {e}")))?;
        let token_url = TokenUrl::new(self.endpoints.token_url.clone())
            .map_err(|e| ExportError::InvalidConfig(format!("bad OAuth token_url: {e}")))?;
        Ok(BasicClient::new(
            ClientId::new(self.client_id.clone()),
            self.client_secret.clone().map(ClientSecret::new),
            auth_url,
            Some(token_url),
        ))
    }

    fn grant_from(&self, token: &BasicTokenResponse) -> TokenGrant {
        let scope = token
            .scopes()
            .map(|s| s.iter().map(|s| s.as_str().to_string()).collect())
            .unwrap_or_else(|| self.endpoints.scopes.clone());
        TokenGrant {
            access_token: token.access_token().secret().to_string(),
            refresh_token: token.refresh_token().map(|r| r.secret().to_string()),
            expires_in: token.expires_in(),
            scope,
        }
    }

    /// Waits for the browser to hit the loopback redirect and returns the code.
    fn wait_for_code(
        &self,
        identity: &str,
        server: &Server,
        base: &Url,
        csrf: &CsrfToken,
    ) -> Result<String> {
        let wait_until = Instant::now() + self.callback_timeout;

        while Instant::now() < wait_until {
            let Ok(maybe_request) = server.recv_timeout(Duration::from_millis(500)) else {
                continue;
            };
            let Some(request) = maybe_request else {
                continue;
            };

            // request.url() is a path+query like "/callback?code=...&state=..."
            let Ok(parsed) = base.join(request.url()) else {
                let _ = request.respond(Response::from_string("Bad redirect"));
                continue;
            };

            let mut code = None;
            let mut state = None;
            let mut error = None;
            for (k, v) in parsed.query_pairs() {
                match k.as_ref() {
                    "code" => code = Some(v.into_owned()),
                    "state" => state = Some(v.into_owned()),
                    "error" => error = Some(v.into_owned()),
                    _ => {}
                }
            }

            if let Some(error) = error {
                let _ = request.respond(Response::from_string(
                    "Authorization was not granted. You can close this tab.",
                ));
                return Err(ExportError::AuthFailed {
                    identity: identity.to_string(),
                    reason: format!("authorization denied: {error}"),
                });
            }

            match code {
                Some(code) if state.as_deref() == Some(csrf.secret().as_str()) => {
                    let _ = request.respond(Response::from_string(
                        "Authorization received. You can close this tab.",
                    ));
                    return Ok(code);
                }
                Some(_) => {
                    warn!("Ignoring OAuth callback with mismatched state");
                    let _ = request.respond(Response::from_string("State mismatch"));
                }
                None => {
                    let _ = request.respond(Response::from_string(
                        "No code found in redirect. You can close this tab.",
                    ));
                }
            }
        }

        Err(ExportError::AuthFailed {
            identity: identity.to_string(),
            reason: "no authorization code received within timeout".into(),
        })
    }
}

fn loopback_addr(redirect: &Url) -> Result<SocketAddr> {
    let host = redirect
        .host_str()
        .ok_or_else(|| ExportError::InvalidConfig(format!("redirect_uri missing host: {redirect}")))?;
    let port = redirect.port_or_known_default().ok_or_else(|| {
        ExportError::InvalidConfig(format!("redirect_uri missing/unknown port: {redirect}"))
    })?;

    let ip: IpAddr = match host {
        "localhost" | "127.0.0.1" => IpAddr::V4(Ipv4Addr::LOCALHOST),
        other => other.parse().map_err(|_| {
            ExportError::InvalidConfig(format!(
                "redirect_uri host must be localhost/127.0.0.1 or an IP: {other}"
            ))
        })?,
    };
    Ok(SocketAddr::new(ip, port))
}

impl OAuthEndpoint for OAuthClient {
    fn authorize(&self, identity: &str) -> Result<TokenGrant> {
        let redirect = Url::parse(&self.redirect_uri).map_err(|e| {
            ExportError::InvalidConfig(format!("invalid redirect_uri '{}': {e}", self.redirect_uri))
        })?;
        let bind_addr = loopback_addr(&redirect)?;

        // Listen before the browser is opened so the redirect cannot race us.
        let server = Server::http(bind_addr).map_err(|e| {
            ExportError::Network(format!("cannot bind OAuth callback on {bind_addr}: {e}"))
        })?;

        let redirect_url = RedirectUrl::new(self.redirect_uri.clone())
            .map_err(|e| ExportError::InvalidConfig(format!("invalid redirect_uri: {e}")))?;
        let client = self.basic_client()?.set_redirect_uri(redirect_url);

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let (auth_url, csrf) = client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(self.endpoints.scopes.iter().cloned().map(Scope::new))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .add_extra_param("login_hint", identity)
            .set_pkce_challenge(pkce_challenge)
            .url();

        eprintln!("Open this URL in your browser to authorize {identity}:\n{auth_url}");
        if let Err(e) = open::that(auth_url.as_str()) {
            warn!("Could not open browser automatically: {e}");
        }

        let code = self.wait_for_code(identity, &server, &redirect, &csrf)?;
        info!("Authorization code received; exchanging for tokens");

        let token = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(pkce_verifier)
            .request(http_client)
            .map_err(|e| match e {
                RequestTokenError::Request(e) => ExportError::Network(e.to_string()),
                other => ExportError::AuthFailed {
                    identity: identity.to_string(),
                    reason: format!("token exchange failed: {other}"),
                },
            })?;

        Ok(self.grant_from(&token))
    }

    fn refresh(&self, identity: &str, refresh_token: &str) -> Result<TokenGrant> {
        let client = self.basic_client()?;
        let rt = RefreshToken::new(refresh_token.to_string());

        match client.exchange_refresh_token(&rt).request(http_client) {
            Ok(token) => Ok(self.grant_from(&token)),
            Err(RequestTokenError::ServerResponse(resp)) => {
                debug!("Refresh rejected: {:?}", resp.error());
                match resp.error() {
                    BasicErrorResponseType::InvalidGrant => Err(ExportError::AuthExpired {
                        identity: identity.to_string(),
                    }),
                    other => Err(ExportError::AuthFailed {
                        identity: identity.to_string(),
                        reason: format!("refresh rejected: {other:?}"),
                    }),
                }
            }
            Err(RequestTokenError::Request(e)) => Err(ExportError::Network(e.to_string())),
            Err(other) => Err(ExportError::Protocol(format!(
                "unexpected token endpoint response: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_host_resolution() {
        let url = Url::parse("http://localhost:8765/callback").unwrap();
        assert_eq!(
            loopback_addr(&url).unwrap(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8765)
        );

        let url = Url::parse("http://example.com/callback").unwrap();
        assert!(matches!(
            loopback_addr(&url),
            Err(ExportError::InvalidConfig(_))
        ));
    }

    #[test]
    fn bad_endpoint_urls_are_config_errors() {
        let client = OAuthClient::new(
            "id",
            None,
            None,
            OAuthEndpoints {
                auth_url: "not a url".into(),
                token_url: "https://oauth2.example.com/token".into(),
                scopes: vec![],
            },
        );
        assert!(matches!(
            client.basic_client(),
            Err(ExportError::InvalidConfig(_))
        ));
    }
}
