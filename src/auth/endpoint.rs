//! Token endpoint exchanges (authorization code and refresh token).
//!
//! The OAuth2 protocol handling comes from the `oauth2` crate; the HTTP leg
//! is our own so the request timeout applies and 5xx/429 responses are
//! classified as retryable before `oauth2` gets to parse them.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backoff::future::retry_notify;
use oauth2::basic::{BasicClient, BasicTokenResponse, BasicTokenType};
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, HttpRequest,
    HttpResponse, RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use thiserror::Error;

use super::error::{TokenError, TokenResult};
use super::retry::RetryPolicy;
use super::{ClientCredentials, ProviderConfig};

/// Providers that omit `expires_in` issue one-hour tokens.
const DEFAULT_EXPIRES_IN: Duration = Duration::from_secs(3600);

/// Successful token endpoint response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTokenResponse {
    pub access_token: String,
    /// Absent when the provider does not rotate refresh tokens.
    pub refresh_token: Option<String>,
    pub expires_in: Duration,
    pub token_type: String,
    pub scope: Option<String>,
}

/// Classified endpoint failure.
#[derive(Debug, Clone, Error)]
pub enum EndpointError {
    /// The provider rejected the grant (invalid_grant, invalid_client, ...).
    /// Never retried.
    #[error("{error}: {}", .description.as_deref().unwrap_or("no description"))]
    Rejected {
        error: String,
        description: Option<String>,
    },

    /// Network error, timeout, 5xx or 429 on every attempt.
    #[error("gave up after {attempts} attempt(s): {reason}")]
    Transient { attempts: u32, reason: String },

    /// The provider answered with something that is not a token response.
    #[error("unexpected provider response: {0}")]
    Protocol(String),

    #[error("invalid endpoint configuration: {0}")]
    Config(String),
}

impl EndpointError {
    /// The grant itself was refused: the code or refresh token is dead.
    pub fn is_revoked_grant(&self) -> bool {
        matches!(self, Self::Rejected { error, .. } if error == "invalid_grant")
    }
}

/// The two network exchanges, isolated so they can be mocked.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange_code(
        &self,
        code: &str,
        credentials: &ClientCredentials,
    ) -> Result<RawTokenResponse, EndpointError>;

    async fn exchange_refresh(
        &self,
        refresh_token: &str,
        credentials: &ClientCredentials,
    ) -> Result<RawTokenResponse, EndpointError>;
}

/// Failure of the HTTP leg of a single attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            // `is_request` is only set for in-flight send failures (reset,
            // incomplete message) and the client timeout; builder errors
            // are `is_builder`.
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::Status { .. } => true,
        }
    }

    /// The provider certainly did not act on the request.
    fn never_delivered(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect(),
            Self::Status { status, .. } => *status == 429,
        }
    }
}

/// Outcome of one attempt.
enum Attempt {
    /// Transient and safe to send again.
    Retry(String),
    /// Transient, but the provider may have consumed the grant.
    GiveUp(String),
    Fail(EndpointError),
}

type TokenRequestError = RequestTokenError<TransportError, oauth2::basic::BasicErrorResponse>;

/// `oauth2`-backed client for a provider's token endpoint.
#[derive(Debug, Clone)]
pub struct OAuthTokenEndpoint {
    http: reqwest::Client,
    auth_url: AuthUrl,
    token_url: TokenUrl,
    scope: String,
    retry: RetryPolicy,
}

impl OAuthTokenEndpoint {
    pub fn new(
        provider: &ProviderConfig,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> TokenResult<Self> {
        let auth_url = AuthUrl::new(provider.authorize_url.clone()).map_err(|e| {
            TokenError::InvalidInput(format!("authorize URL {}: {}", provider.authorize_url, e))
        })?;
        let token_url = TokenUrl::new(provider.token_url.clone()).map_err(|e| {
            TokenError::InvalidInput(format!("token URL {}: {}", provider.token_url, e))
        })?;

        // No redirects: a token endpoint that redirects is misconfigured.
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TokenError::InvalidInput(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            auth_url,
            token_url,
            scope: provider.scope.clone(),
            retry,
        })
    }

    fn client(&self, credentials: &ClientCredentials) -> Result<BasicClient, EndpointError> {
        let redirect = RedirectUrl::new(credentials.redirect_uri.clone()).map_err(|e| {
            EndpointError::Config(format!("redirect URI {}: {}", credentials.redirect_uri, e))
        })?;

        Ok(BasicClient::new(
            ClientId::new(credentials.client_id.clone()),
            Some(ClientSecret::new(credentials.client_secret.clone())),
            self.auth_url.clone(),
            Some(self.token_url.clone()),
        )
        .set_auth_type(AuthType::RequestBody)
        .set_redirect_uri(redirect))
    }

    /// Consent URL the user visits to obtain an authorization code, plus
    /// the CSRF state to compare against the redirect.
    pub fn authorization_url(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<(url::Url, CsrfToken), EndpointError> {
        let client = self.client(credentials)?;
        let mut request = client.authorize_url(CsrfToken::new_random);
        if !self.scope.is_empty() {
            request = request.add_scope(Scope::new(self.scope.clone()));
        }
        Ok(request.url())
    }

    async fn with_retry<F, Fut>(
        &self,
        op: &str,
        mut attempt: F,
    ) -> Result<RawTokenResponse, EndpointError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RawTokenResponse, Attempt>>,
    {
        let max_attempts = self.retry.attempts();
        let mut n = 0;

        retry_notify(
            self.retry.backoff(),
            || {
                n += 1;
                let current = n;
                let last = current >= max_attempts;
                let pending = attempt();
                async move {
                    pending.await.map_err(|outcome| match outcome {
                        Attempt::Fail(err) => backoff::Error::permanent(err),
                        Attempt::GiveUp(reason) => {
                            backoff::Error::permanent(EndpointError::Transient {
                                attempts: current,
                                reason,
                            })
                        }
                        Attempt::Retry(reason) => {
                            let err = EndpointError::Transient {
                                attempts: current,
                                reason,
                            };
                            if last {
                                backoff::Error::permanent(err)
                            } else {
                                backoff::Error::transient(err)
                            }
                        }
                    })
                }
            },
            |err: EndpointError, delay: Duration| {
                if let EndpointError::Transient { attempts, reason } = &err {
                    tracing::warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        op,
                        attempts,
                        max_attempts,
                        reason,
                        delay
                    );
                }
            },
        )
        .await
    }
}

#[async_trait]
impl TokenEndpoint for OAuthTokenEndpoint {
    async fn exchange_code(
        &self,
        code: &str,
        credentials: &ClientCredentials,
    ) -> Result<RawTokenResponse, EndpointError> {
        let client = self.client(credentials)?;
        // Codes are single-use: only resend when the first request never
        // reached the provider.
        self.with_retry("Code exchange", || {
            let http = self.http.clone();
            let request = client.exchange_code(AuthorizationCode::new(code.to_string()));
            async move {
                classify(
                    request
                        .request_async(move |req| send(http, req))
                        .await,
                    false,
                )
            }
        })
        .await
    }

    async fn exchange_refresh(
        &self,
        refresh_token: &str,
        credentials: &ClientCredentials,
    ) -> Result<RawTokenResponse, EndpointError> {
        let client = self.client(credentials)?;
        let refresh_token = RefreshToken::new(refresh_token.to_string());
        self.with_retry("Token refresh", || {
            let http = self.http.clone();
            let request = client.exchange_refresh_token(&refresh_token);
            async move {
                classify(
                    request
                        .request_async(move |req| send(http, req))
                        .await,
                    true,
                )
            }
        })
        .await
    }
}

/// HTTP leg handed to `oauth2`.
async fn send(http: reqwest::Client, request: HttpRequest) -> Result<HttpResponse, TransportError> {
    tracing::debug!("POST {}", request.url);

    let response = http
        .request(request.method, request.url)
        .headers(request.headers)
        .body(request.body)
        .send()
        .await?;

    let status_code = response.status();
    if status_code.is_server_error() || status_code == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status_code.as_u16(),
            body,
        });
    }

    let headers = response.headers().clone();
    let body = response.bytes().await?.to_vec();
    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}

fn classify(
    result: Result<BasicTokenResponse, TokenRequestError>,
    replayable: bool,
) -> Result<RawTokenResponse, Attempt> {
    match result {
        Ok(token) => Ok(into_raw(&token)),
        Err(RequestTokenError::ServerResponse(err)) => Err(Attempt::Fail(EndpointError::Rejected {
            error: err.error().to_string(),
            description: err.error_description().cloned(),
        })),
        Err(RequestTokenError::Request(err)) if err.is_retryable() => {
            if replayable || err.never_delivered() {
                Err(Attempt::Retry(err.to_string()))
            } else {
                Err(Attempt::GiveUp(err.to_string()))
            }
        }
        Err(RequestTokenError::Request(err)) => {
            Err(Attempt::Fail(EndpointError::Protocol(err.to_string())))
        }
        Err(RequestTokenError::Parse(err, body)) => Err(Attempt::Fail(EndpointError::Protocol(
            format!("{} (body: {})", err, String::from_utf8_lossy(&body)),
        ))),
        Err(RequestTokenError::Other(msg)) => Err(Attempt::Fail(EndpointError::Protocol(msg))),
    }
}

fn into_raw(token: &BasicTokenResponse) -> RawTokenResponse {
    let token_type = match token.token_type() {
        BasicTokenType::Bearer => "bearer".to_string(),
        BasicTokenType::Mac => "mac".to_string(),
        BasicTokenType::Extension(ext) => ext.clone(),
    };

    RawTokenResponse {
        access_token: token.access_token().secret().to_string(),
        refresh_token: token.refresh_token().map(|rt| rt.secret().to_string()),
        expires_in: token.expires_in().unwrap_or(DEFAULT_EXPIRES_IN),
        token_type,
        scope: token.scopes().map(|scopes| {
            scopes
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> ClientCredentials {
        ClientCredentials {
            client_id: "amzn1.application-oa2-client.test".into(),
            client_secret: "s3cret".into(),
            redirect_uri: "https://localhost".into(),
        }
    }

    fn endpoint(server: &MockServer, timeout: Duration, retry: RetryPolicy) -> OAuthTokenEndpoint {
        let provider = ProviderConfig {
            token_url: format!("{}/auth/o2/token", server.uri()),
            authorize_url: format!("{}/ap/oa", server.uri()),
            scope: "advertising::campaign_management".into(),
        };
        OAuthTokenEndpoint::new(&provider, timeout, retry).unwrap()
    }

    fn token_body(refresh: Option<&str>) -> serde_json::Value {
        let mut body = json!({
            "access_token": "Atza|fresh",
            "token_type": "bearer",
            "expires_in": 3600,
            "scope": "advertising::campaign_management"
        });
        if let Some(rt) = refresh {
            body["refresh_token"] = json!(rt);
        }
        body
    }

    #[tokio::test]
    async fn test_exchange_code_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/o2/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=ANcode"))
            .and(body_string_contains("client_secret=s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body(Some("Atzr|one"))))
            .expect(1)
            .mount(&server)
            .await;

        let ep = endpoint(&server, Duration::from_secs(5), RetryPolicy::immediate(3));
        let resp = ep.exchange_code("ANcode", &credentials()).await.unwrap();

        assert_eq!(resp.access_token, "Atza|fresh");
        assert_eq!(resp.refresh_token.as_deref(), Some("Atzr|one"));
        assert_eq!(resp.expires_in, Duration::from_secs(3600));
        assert_eq!(resp.token_type, "bearer");
        assert_eq!(resp.scope.as_deref(), Some("advertising::campaign_management"));
    }

    #[tokio::test]
    async fn test_refresh_without_rotation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=Atzr%7Cold"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body(None)))
            .expect(1)
            .mount(&server)
            .await;

        let ep = endpoint(&server, Duration::from_secs(5), RetryPolicy::immediate(3));
        let resp = ep.exchange_refresh("Atzr|old", &credentials()).await.unwrap();
        assert_eq!(resp.refresh_token, None);
    }

    #[tokio::test]
    async fn test_invalid_grant_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "The request has an invalid grant parameter : refresh_token"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ep = endpoint(&server, Duration::from_secs(5), RetryPolicy::immediate(3));
        let err = ep.exchange_refresh("revoked", &credentials()).await.unwrap_err();
        match err {
            EndpointError::Rejected { error, description } => {
                assert_eq!(error, "invalid_grant");
                assert!(description.unwrap().contains("refresh_token"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unauthorized_client_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({ "error": "invalid_client" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let ep = endpoint(&server, Duration::from_secs(5), RetryPolicy::immediate(3));
        let err = ep.exchange_code("code", &credentials()).await.unwrap_err();
        assert!(matches!(err, EndpointError::Rejected { ref error, .. } if error == "invalid_client"));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body(Some("Atzr|two"))))
            .expect(1)
            .mount(&server)
            .await;

        let ep = endpoint(&server, Duration::from_secs(5), RetryPolicy::immediate(3));
        let resp = ep.exchange_refresh("Atzr|one", &credentials()).await.unwrap();
        assert_eq!(resp.refresh_token.as_deref(), Some("Atzr|two"));
    }

    #[tokio::test]
    async fn test_code_exchange_not_resent_after_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&server)
            .await;

        let ep = endpoint(&server, Duration::from_secs(5), RetryPolicy::immediate(3));
        let err = ep.exchange_code("code", &credentials()).await.unwrap_err();
        assert!(matches!(err, EndpointError::Transient { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_code_exchange_resent_after_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body(Some("Atzr|one"))))
            .expect(1)
            .mount(&server)
            .await;

        let ep = endpoint(&server, Duration::from_secs(5), RetryPolicy::immediate(3));
        let resp = ep.exchange_code("code", &credentials()).await.unwrap();
        assert_eq!(resp.refresh_token.as_deref(), Some("Atzr|one"));
    }

    #[test]
    fn test_only_invalid_grant_is_revocation() {
        let rejected = |error: &str| EndpointError::Rejected {
            error: error.into(),
            description: None,
        };
        assert!(rejected("invalid_grant").is_revoked_grant());
        assert!(!rejected("invalid_client").is_revoked_grant());
        assert!(!rejected("invalid_scope").is_revoked_grant());
        assert!(!EndpointError::Protocol("x".into()).is_revoked_grant());
    }

    #[tokio::test]
    async fn test_rate_limit_exhausts_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let ep = endpoint(&server, Duration::from_secs(5), RetryPolicy::immediate(3));
        let err = ep.exchange_refresh("rt", &credentials()).await.unwrap_err();
        assert!(matches!(err, EndpointError::Transient { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_request_timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(token_body(Some("rt")))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let ep = endpoint(&server, Duration::from_millis(100), RetryPolicy::immediate(2));
        let err = ep.exchange_refresh("rt", &credentials()).await.unwrap_err();
        assert!(matches!(err, EndpointError::Transient { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_garbage_success_body_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "unexpected": true })))
            .expect(1)
            .mount(&server)
            .await;

        let ep = endpoint(&server, Duration::from_secs(5), RetryPolicy::immediate(3));
        let err = ep.exchange_code("code", &credentials()).await.unwrap_err();
        assert!(matches!(err, EndpointError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_authorization_url() {
        let server = MockServer::start().await;
        let ep = endpoint(&server, Duration::from_secs(5), RetryPolicy::default());
        let (url, state) = ep.authorization_url(&credentials()).unwrap();

        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "amzn1.application-oa2-client.test");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["redirect_uri"], "https://localhost");
        assert_eq!(pairs["scope"], "advertising::campaign_management");
        assert_eq!(&pairs["state"], state.secret());
        assert!(url.path().ends_with("/ap/oa"));
    }
}
