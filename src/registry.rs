//! Tag listing against OCI distribution registries.
//!
//! `GET /v2/<repo>/tags/list` with the token dance Docker Hub and most
//! private registries expect. Failures never propagate out of the public
//! entry point: the detector treats an empty tag list as "fall back to a
//! digest probe".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::credentials::{CredentialStore, RegistryCredentials};
use crate::image::{registry_parts, ImageRef};

const HUB_REGISTRY_URL: &str = "https://registry-1.docker.io";
const HUB_TOKEN_URL: &str = "https://auth.docker.io/token";
const HUB_TOKEN_SERVICE: &str = "registry.docker.io";
const HUB_HOSTS: &[&str] = &["docker.io", "index.docker.io", "registry-1.docker.io"];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry returned status {0}")]
    Status(StatusCode),
    #[error("token endpoint returned no token")]
    MissingToken,
    #[error("registry requires basic auth but no credentials are configured")]
    MissingCredentials,
    #[error("unsupported auth scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("missing or malformed WWW-Authenticate challenge")]
    MalformedChallenge,
}

#[derive(serde::Deserialize)]
struct TagList {
    #[allow(dead_code)]
    name: Option<String>,
    tags: Option<Vec<String>>,
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl TokenResponse {
    fn into_token(self) -> Option<String> {
        self.token.or(self.access_token).filter(|t| !t.is_empty())
    }
}

/// Source of published tags for an image repository.
#[async_trait]
pub trait TagSource: Send + Sync {
    /// List the tags published for the repository of `image_reference`.
    /// Never fails; network and auth problems come back as an empty list.
    async fn tags(&self, image_reference: &str) -> Vec<String>;
}

pub struct RegistryClient {
    http: reqwest::Client,
    credentials: Arc<CredentialStore>,
}

impl RegistryClient {
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");
        Self { http, credentials }
    }

    async fn try_tags(&self, image_reference: &str) -> Result<Vec<String>, RegistryError> {
        let image = ImageRef::parse(image_reference);
        let (host, repository) = registry_parts(&image.repository);
        let creds = self.credentials.lookup(&host);

        if HUB_HOSTS.contains(&host.as_str()) {
            return self.hub_tags(&repository, &creds).await;
        }

        let url = format!("https://{host}/v2/{repository}/tags/list");
        let response = self.http.get(&url).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return decode_tag_list(response).await;
        }

        let challenge = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_challenge)
            .ok_or(RegistryError::MalformedChallenge)?;

        match challenge.scheme.as_str() {
            "bearer" => {
                let realm = challenge
                    .params
                    .get("realm")
                    .ok_or(RegistryError::MalformedChallenge)?;
                let service = challenge.params.get("service").map(String::as_str);
                let scope = challenge
                    .params
                    .get("scope")
                    .cloned()
                    .unwrap_or_else(|| format!("repository:{repository}:pull"));
                let token = self.fetch_token(realm, service, &scope, &creds).await?;
                let response = self.http.get(&url).bearer_auth(token).send().await?;
                decode_tag_list(response).await
            }
            "basic" => {
                if !creds.has_credentials() {
                    return Err(RegistryError::MissingCredentials);
                }
                let response = self
                    .http
                    .get(&url)
                    .basic_auth(
                        creds.username.as_deref().unwrap_or_default(),
                        creds.password.as_deref(),
                    )
                    .send()
                    .await?;
                decode_tag_list(response).await
            }
            other => Err(RegistryError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Docker Hub never answers the tags endpoint anonymously; go straight
    /// to its token service.
    async fn hub_tags(
        &self,
        repository: &str,
        creds: &RegistryCredentials,
    ) -> Result<Vec<String>, RegistryError> {
        let scope = format!("repository:{repository}:pull");
        let token = self
            .fetch_token(HUB_TOKEN_URL, Some(HUB_TOKEN_SERVICE), &scope, creds)
            .await?;
        let url = format!("{HUB_REGISTRY_URL}/v2/{repository}/tags/list");
        let response = self.http.get(&url).bearer_auth(token).send().await?;
        decode_tag_list(response).await
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        creds: &RegistryCredentials,
    ) -> Result<String, RegistryError> {
        let mut query: Vec<(&str, &str)> = vec![("scope", scope)];
        if let Some(service) = service {
            query.push(("service", service));
        }
        let mut request = self.http.get(realm).query(&query);
        if creds.has_credentials() {
            request = request.basic_auth(
                creds.username.as_deref().unwrap_or_default(),
                creds.password.as_deref(),
            );
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Status(response.status()));
        }
        let token: TokenResponse = response.json().await?;
        token.into_token().ok_or(RegistryError::MissingToken)
    }
}

#[async_trait]
impl TagSource for RegistryClient {
    async fn tags(&self, image_reference: &str) -> Vec<String> {
        match self.try_tags(image_reference).await {
            Ok(tags) => tags,
            Err(e) => {
                log::warn!("Failed to list tags for {image_reference}: {e}");
                Vec::new()
            }
        }
    }
}

async fn decode_tag_list(response: reqwest::Response) -> Result<Vec<String>, RegistryError> {
    if !response.status().is_success() {
        return Err(RegistryError::Status(response.status()));
    }
    let list: TagList = response.json().await?;
    Ok(list.tags.unwrap_or_default())
}

#[derive(Debug, PartialEq, Eq)]
struct AuthChallenge {
    /// Lowercased scheme name.
    scheme: String,
    /// Lowercased parameter keys; values with surrounding quotes removed.
    params: HashMap<String, String>,
}

/// Parse a `WWW-Authenticate` header value. Accepts quoted and unquoted
/// parameter pairs separated by commas.
fn parse_challenge(header: &str) -> Option<AuthChallenge> {
    let header = header.trim();
    if header.is_empty() {
        return None;
    }
    let (scheme, rest) = match header.split_once(char::is_whitespace) {
        Some((scheme, rest)) => (scheme, rest),
        None => (header, ""),
    };
    let mut params = HashMap::new();
    for pair in rest.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        params.insert(key.trim().to_ascii_lowercase(), value.to_string());
    }
    Some(AuthChallenge {
        scheme: scheme.to_ascii_lowercase(),
        params,
    })
}
