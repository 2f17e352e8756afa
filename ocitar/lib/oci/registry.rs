use std::{collections::HashMap, path::Path, sync::Arc};

use futures::StreamExt;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::RwLock,
};

use crate::{
    progress::PullProgress,
    utils::{self, sha256_file},
    OcitarError, OcitarResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Maximum number of response-body bytes carried inside a registry error.
const ERROR_BODY_LIMIT: usize = 512;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Basic credentials configured for one registry host.
#[derive(Debug, Clone)]
pub struct BasicCredentials {
    user: String,
    password: String,
}

/// An authenticated HTTP session with one registry host.
///
/// The session starts anonymous. When a request bounces with 401, the
/// `Www-Authenticate` challenge decides how the session re-authenticates:
/// `Basic` attaches the configured credentials, `Bearer` trades them for a
/// token at the challenge realm. Whatever was acquired is kept on the
/// session and replayed on subsequent requests, so the challenge dance
/// happens at most once per 401.
#[derive(Debug)]
pub struct RegistrySession {
    /// The HTTP client used to talk to the registry.
    client: Client,

    /// Credentials used for `Basic` challenges and for token requests.
    credentials: Option<BasicCredentials>,

    /// The authentication state acquired from the last challenge.
    auth: RwLock<AuthMode>,

    /// Whether to speak https to this host.
    tls: bool,
}

#[derive(Debug, Clone)]
enum AuthMode {
    Anonymous,
    Basic,
    Bearer(String),
}

/// A parsed `Www-Authenticate` challenge.
#[derive(Debug, PartialEq, Eq)]
pub struct AuthChallenge {
    /// The challenge scheme (`Basic`, `Bearer`, ...).
    pub scheme: String,

    /// The challenge parameters (`realm`, `service`, `scope`, ...).
    pub params: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BasicCredentials {
    /// Creates credentials from a user name and password.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl RegistrySession {
    /// Creates a session, optionally with basic credentials.
    pub fn new(credentials: Option<BasicCredentials>, tls: bool) -> Self {
        Self {
            client: Client::new(),
            credentials,
            auth: RwLock::new(AuthMode::Anonymous),
            tls,
        }
    }

    /// Performs an authenticated GET against the registry.
    ///
    /// The first attempt replays whatever authentication the session
    /// already holds. A 401 triggers the challenge flow once; any non-2xx
    /// status after that is an error.
    pub async fn get(&self, url: &str, headers: &[(&str, String)]) -> OcitarResult<Response> {
        let url = self.absolute_url(url);
        tracing::debug!("GET {} (headers: {:?})", url, headers);

        let response = self.send(&url, headers).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return self.check(response).await;
        }

        self.authenticate(&response).await?;

        let response = self.send(&url, headers).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(OcitarError::AuthFailed(
                "request unauthorized after re-authentication".into(),
            ));
        }

        self.check(response).await
    }

    /// Downloads a blob into `destination`, resuming, verifying and
    /// decompressing it.
    ///
    /// The compressed bytes are streamed to a sibling `.gz` temp file; if
    /// that file already exists the download resumes from its length with a
    /// `Range` request, and if it already hashes to the digest encoded in
    /// `url` the network is skipped entirely. After verification the temp
    /// file is gunzipped into `destination` and removed. On a digest
    /// mismatch the temp file is deleted so the next attempt starts clean.
    pub async fn fetch_blob(
        &self,
        url: &str,
        destination: &Path,
        accept: Option<&str>,
        progress: Arc<dyn PullProgress>,
    ) -> OcitarResult<()> {
        let expected = digest_from_url(url);
        let short_id: String = expected.chars().take(12).collect();
        let temp = destination.with_extension("gz");

        let mut done = match fs::metadata(&temp).await {
            Result::Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };

        let mut complete = false;
        if done > 0 {
            tracing::debug!("resuming download of layer blob {}", temp.display());
            complete = sha256_file(&temp).await? == expected;
        }

        if complete {
            tracing::debug!("blob {} is up to date, skipping download", temp.display());
        } else {
            progress.update_description(&format!("{}: Pulling fs layer", short_id));
            progress.set_size(0);
            progress.write(0);

            let mut headers: Vec<(&str, String)> = Vec::new();
            if let Some(accept) = accept {
                headers.push(("Accept", accept.to_string()));
            }
            if done > 0 {
                headers.push(("Range", format!("bytes={}-", done)));
            }

            let response = self.get(url, &headers).await?;

            // the server may ignore the range request, start over if so
            if done > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
                done = 0;
            }

            let mut file = if done == 0 {
                OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .open(&temp)
                    .await?
            } else {
                OpenOptions::new().append(true).open(&temp).await?
            };

            progress.update_description(&format!("{}: Downloading", short_id));
            progress.set_size(done + response.content_length().unwrap_or(0));

            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let bytes = chunk?;
                file.write_all(&bytes).await?;
                done += bytes.len() as u64;
                progress.write(done);
            }
            file.flush().await?;
            drop(file);

            let actual = sha256_file(&temp).await?;
            if actual != expected {
                fs::remove_file(&temp).await?;
                return Err(OcitarError::DigestMismatch { expected, actual });
            }
        }

        progress.update_description(&format!("{}: Extracting", short_id));

        let src = temp.clone();
        let dest = destination.to_path_buf();
        let extract_progress = Arc::clone(&progress);
        tokio::task::spawn_blocking(move || {
            utils::gunzip_file(&src, &dest, extract_progress.as_ref())
        })
        .await??;

        progress.flush(&format!("{}: Pull complete", short_id));

        Ok(())
    }

    fn absolute_url(&self, url: &str) -> String {
        if url.starts_with("http") {
            url.to_string()
        } else {
            format!("http{}://{}", if self.tls { "s" } else { "" }, url)
        }
    }

    async fn send(&self, url: &str, headers: &[(&str, String)]) -> OcitarResult<Response> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        request = self.authorize(request).await;

        Ok(request.send().await?)
    }

    async fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.auth.read().await.clone() {
            AuthMode::Anonymous => request,
            AuthMode::Basic => match &self.credentials {
                Some(credentials) => {
                    request.basic_auth(&credentials.user, Some(&credentials.password))
                }
                None => request,
            },
            AuthMode::Bearer(token) => request.bearer_auth(token),
        }
    }

    async fn check(&self, response: Response) -> OcitarResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        tracing::error!("status code: {}, response: {}", status, body);

        Err(OcitarError::RegistryError { status, body })
    }

    /// Handles a 401 response by parsing its challenge and acquiring the
    /// matching authentication material.
    async fn authenticate(&self, response: &Response) -> OcitarResult<()> {
        let header = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .ok_or_else(|| OcitarError::AuthFailed("empty www-authenticate header".into()))?
            .to_str()
            .map_err(|_| OcitarError::AuthFailed("unreadable www-authenticate header".into()))?;

        let challenge = AuthChallenge::parse(header).ok_or_else(|| {
            OcitarError::AuthFailed(format!("unparsable www-authenticate header: {}", header))
        })?;

        if challenge.scheme.eq_ignore_ascii_case("basic") {
            if self.credentials.is_none() {
                return Err(OcitarError::AuthFailed(
                    "registry requires basic credentials but none are configured".into(),
                ));
            }
            *self.auth.write().await = AuthMode::Basic;
            return Ok(());
        }

        if !challenge.scheme.eq_ignore_ascii_case("bearer") {
            return Err(OcitarError::AuthFailed(format!(
                "unsupported authentication scheme: {}",
                challenge.scheme
            )));
        }

        let realm = challenge
            .params
            .get("realm")
            .ok_or_else(|| OcitarError::AuthFailed("bearer challenge without realm".into()))?;
        let service = challenge
            .params
            .get("service")
            .ok_or_else(|| OcitarError::AuthFailed("bearer challenge without service".into()))?;

        // query() appends, so a query string already on the realm survives
        let mut request = self.client.get(realm).query(&[("service", service)]);
        if let Some(scope) = challenge.params.get("scope") {
            request = request.query(&[("scope", scope)]);
        }
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.user, Some(&credentials.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(OcitarError::AuthFailed(format!(
                "token endpoint returned status {}",
                response.status()
            )));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| OcitarError::AuthFailed(format!("invalid token response: {}", e)))?;

        *self.auth.write().await = AuthMode::Bearer(token.token);

        Ok(())
    }
}

impl AuthChallenge {
    /// Parses a `Www-Authenticate` header value into scheme and parameters.
    ///
    /// Parameter values are quoted strings that may themselves contain
    /// commas (`scope="repository:foo:pull,push"`), so the parameter list
    /// is split on commas outside quotes only.
    pub fn parse(header: &str) -> Option<AuthChallenge> {
        let (scheme, rest) = match header.split_once(' ') {
            Some((scheme, rest)) => (scheme, rest),
            None => (header, ""),
        };
        if scheme.is_empty() {
            return None;
        }

        let mut params = HashMap::new();
        for part in split_outside_quotes(rest, ',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=')?;
            params.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }

        Some(AuthChallenge {
            scheme: scheme.to_string(),
            params,
        })
    }
}

impl Default for RegistrySession {
    fn default() -> Self {
        Self::new(None, true)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Extracts the hex digest a blob URL is addressed by.
fn digest_from_url(url: &str) -> String {
    let segment = url.rsplit('/').next().unwrap_or(url);
    match segment.split_once(':') {
        Some((_, hex)) => hex.to_string(),
        None => segment.to_string(),
    }
}

fn split_outside_quotes(input: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in input.chars() {
        if ch == '"' {
            in_quotes = !in_quotes;
            current.push(ch);
        } else if ch == separator && !in_quotes {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }

    parts
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
