//! Meeting provider client
//!
//! Thin HTTP client for the third-party video-meeting API: create/delete
//! meetings, list and fetch finished recording parts. Token caching and
//! rate-limit handling live here so callers only see transient/permanent
//! errors.

use base64::Engine;
use rand::Rng;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::ProviderConfig;
use crate::credentials::ProviderProfile;

/// Maximum retries for a rate-limited or transiently failing provider call
const MAX_RETRIES: u32 = 3;

/// Base backoff for provider retries
const BACKOFF_BASE_MS: u64 = 1000;

/// Refresh the cached token this long before its reported expiry
const TOKEN_REFRESH_MARGIN_SECS: u64 = 60;

/// Provider-specific errors, split by whether a retry can help
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// Timeout, connection failure, 429 or 5xx - retried with backoff
    Transient {
        message: String,
        /// Server-requested wait from a 429 Retry-After header, when present
        retry_after: Option<Duration>,
    },
    /// 4xx other than 429, bad credentials, malformed response - not retried
    Permanent(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Transient { message, .. } => {
                write!(f, "Transient provider error: {}", message)
            }
            ProviderError::Permanent(msg) => write!(f, "Permanent provider error: {}", msg),
        }
    }
}

impl StdError for ProviderError {}

impl ProviderError {
    /// Transient error with no server-requested wait
    pub fn transient(message: impl Into<String>) -> Self {
        ProviderError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }
}

/// A provider-side meeting created for one lesson
#[derive(Debug, Clone)]
pub struct MeetingInfo {
    pub meeting_id: String,
    pub join_url: String,
    pub host_url: String,
    /// Playback password for recording part URLs, when the provider sets one
    pub access_secret: Option<String>,
}

/// One finished raw recording segment reported by the provider
#[derive(Debug, Clone)]
pub struct RecordingPart {
    pub id: String,
    pub start_timestamp_ms: i64,
    pub end_timestamp_ms: i64,
    pub byte_size: u64,
    pub download_url: String,
}

/// Interface to the meeting provider. The HTTP implementation below is the
/// production one; tests substitute stubs.
pub trait MeetingProvider: Send + Sync {
    fn create_meeting(
        &self,
        topic: &str,
        start_ms: i64,
        duration_mins: i64,
    ) -> Result<MeetingInfo, ProviderError>;

    fn delete_meeting(&self, meeting_id: &str) -> Result<(), ProviderError>;

    fn list_recording_parts(
        &self,
        meeting_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<RecordingPart>, ProviderError>;

    /// Fetch one part's bytes. The access secret, when present, is appended
    /// to the download URL as a playback-password query parameter.
    fn download_part(
        &self,
        part: &RecordingPart,
        access_secret: Option<&str>,
    ) -> Result<Vec<u8>, ProviderError>;

    /// Delete the provider-side copy of a meeting's recording.
    /// Callers gate this on durable-copy confirmation; this client does not.
    fn delete_recording(&self, meeting_id: &str) -> Result<(), ProviderError>;
}

/// Append the playback password to a part download URL as a `pwd` query
/// parameter, exactly once.
pub fn with_playback_secret(raw_url: &str, secret: &str) -> Result<String, ProviderError> {
    let mut parsed = url::Url::parse(raw_url)
        .map_err(|e| ProviderError::Permanent(format!("Invalid download URL '{}': {}", raw_url, e)))?;

    let already_present = parsed.query_pairs().any(|(k, _)| k == "pwd");
    if !already_present {
        parsed.query_pairs_mut().append_pair("pwd", secret);
    }
    Ok(parsed.into())
}

/// Exponential backoff for provider retries: 1s, 2s, 4s, ...
pub fn retry_backoff_ms(attempt: u32) -> u64 {
    BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(6))
}

/// Parse a Retry-After header value: either delta-seconds or an HTTP-date
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(std::time::SystemTime::now()).ok()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct CreateMeetingResponse {
    id: serde_json::Value,
    join_url: String,
    start_url: String,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PartData {
    id: String,
    recording_start_ms: i64,
    recording_end_ms: i64,
    file_size: u64,
    download_url: String,
}

#[derive(Debug, Deserialize)]
struct ListPartsResponse {
    recording_files: Vec<PartData>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// HTTP meeting provider client with internal token caching
pub struct HttpMeetingProvider {
    client: Client,
    config: ProviderConfig,
    profile: ProviderProfile,
    token: Mutex<Option<CachedToken>>,
}

impl HttpMeetingProvider {
    pub fn new(config: ProviderConfig, profile: ProviderProfile) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(config.request_timeout_secs.unwrap_or(30));
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Permanent(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            profile,
            token: Mutex::new(None),
        })
    }

    /// Get a cached access token, refreshing it when missing or near expiry
    fn get_access_token(&self) -> Result<String, ProviderError> {
        let mut guard = self
            .token
            .lock()
            .map_err(|_| ProviderError::Permanent("Token cache lock poisoned".to_string()))?;

        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.token.clone());
            }
        }

        let basic = base64::engine::general_purpose::STANDARD.encode(format!(
            "{}:{}",
            self.profile.client_id, self.profile.client_secret
        ));

        let response = self
            .client
            .post(&self.config.auth_url)
            .header(reqwest::header::AUTHORIZATION, format!("Basic {}", basic))
            .form(&[
                ("grant_type", "account_credentials"),
                ("account_id", self.config.account_id.as_str()),
            ])
            .send()
            .map_err(|e| classify_request_error("token request", &e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::Permanent(format!(
                "Provider rejected credentials for profile '{}': {}",
                self.config.credential_profile, status
            )));
        }
        if !status.is_success() {
            return Err(classify_status("token request", status, None));
        }

        let token: TokenResponse = response
            .json()
            .map_err(|e| ProviderError::Permanent(format!("Failed to parse token response: {}", e)))?;

        let lifetime = token
            .expires_in
            .saturating_sub(TOKEN_REFRESH_MARGIN_SECS)
            .max(1);
        let value = token.access_token.clone();
        *guard = Some(CachedToken {
            token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });

        Ok(value)
    }

    /// Issue a request with 429/transient retry handling.
    /// `send` is called once per attempt with a fresh bearer token.
    fn request_with_retry<T>(
        &self,
        what: &str,
        send: impl Fn(&Client, &str) -> Result<reqwest::blocking::Response, reqwest::Error>,
        parse: impl Fn(reqwest::blocking::Response) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let mut attempt = 0u32;
        loop {
            let token = self.get_access_token()?;
            let outcome = match send(&self.client, &token) {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return parse(response);
                    }
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after);
                    Err(classify_status(what, status, retry_after))
                }
                Err(e) => Err(classify_request_error(what, &e)),
            };

            match outcome {
                Err(ProviderError::Transient {
                    message,
                    retry_after,
                }) if attempt < MAX_RETRIES => {
                    let wait = transient_wait(retry_after, attempt);
                    log::warn!(
                        "[provider] {} failed (attempt {}/{}): {}. Retrying in {}ms",
                        what,
                        attempt + 1,
                        MAX_RETRIES,
                        message,
                        wait.as_millis()
                    );
                    std::thread::sleep(wait);
                    attempt += 1;
                }
                Err(e) => return Err(e),
                Ok(value) => return Ok(value),
            }
        }
    }
}

/// Pick the wait for a transient failure: honor the server-requested
/// Retry-After when the classifier captured one, else exponential backoff
/// with jitter so concurrent workers spread their retries out.
fn transient_wait(retry_after: Option<Duration>, attempt: u32) -> Duration {
    if let Some(wait) = retry_after {
        return wait;
    }
    let base = retry_backoff_ms(attempt);
    let jitter = rand::thread_rng().gen_range(0..=base / 4);
    Duration::from_millis(base + jitter)
}

fn classify_status(
    what: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::Transient {
            message: format!("{}: rate limited", what),
            retry_after,
        };
    }
    if status.is_server_error() {
        return ProviderError::transient(format!("{}: provider returned {}", what, status));
    }
    ProviderError::Permanent(format!("{}: provider returned {}", what, status))
}

fn classify_request_error(what: &str, e: &reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() {
        ProviderError::transient(format!("{}: {}", what, e))
    } else {
        ProviderError::Permanent(format!("{}: {}", what, e))
    }
}

impl MeetingProvider for HttpMeetingProvider {
    fn create_meeting(
        &self,
        topic: &str,
        start_ms: i64,
        duration_mins: i64,
    ) -> Result<MeetingInfo, ProviderError> {
        let url = format!("{}/meetings", self.config.base_url);
        let body = serde_json::json!({
            "topic": topic,
            "start_time_ms": start_ms,
            "duration": duration_mins,
        });

        self.request_with_retry(
            "create meeting",
            |client, token| {
                client
                    .post(&url)
                    .bearer_auth(token)
                    .json(&body)
                    .send()
            },
            |response| {
                let data: CreateMeetingResponse = response.json().map_err(|e| {
                    ProviderError::Permanent(format!("Failed to parse create-meeting response: {}", e))
                })?;
                // Providers return numeric or string meeting ids
                let meeting_id = match &data.id {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Ok(MeetingInfo {
                    meeting_id,
                    join_url: data.join_url,
                    host_url: data.start_url,
                    access_secret: data.password,
                })
            },
        )
    }

    fn delete_meeting(&self, meeting_id: &str) -> Result<(), ProviderError> {
        let url = format!(
            "{}/meetings/{}",
            self.config.base_url,
            urlencoding::encode(meeting_id)
        );
        let result = self.request_with_retry(
            "delete meeting",
            |client, token| client.delete(&url).bearer_auth(token).send(),
            |_| Ok(()),
        );
        // Deleting an already-deleted meeting is a success for our callers
        match result {
            Err(ProviderError::Permanent(msg)) if msg.contains("404") => Ok(()),
            other => other,
        }
    }

    fn list_recording_parts(
        &self,
        meeting_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<RecordingPart>, ProviderError> {
        let url = format!(
            "{}/meetings/{}/recordings?from_ms={}&to_ms={}",
            self.config.base_url,
            urlencoding::encode(meeting_id),
            from_ms,
            to_ms
        );
        self.request_with_retry(
            "list recording parts",
            |client, token| client.get(&url).bearer_auth(token).send(),
            |response| {
                let data: ListPartsResponse = response.json().map_err(|e| {
                    ProviderError::Permanent(format!("Failed to parse recordings response: {}", e))
                })?;
                Ok(data
                    .recording_files
                    .into_iter()
                    .map(|p| RecordingPart {
                        id: p.id,
                        start_timestamp_ms: p.recording_start_ms,
                        end_timestamp_ms: p.recording_end_ms,
                        byte_size: p.file_size,
                        download_url: p.download_url,
                    })
                    .collect())
            },
        )
    }

    fn download_part(
        &self,
        part: &RecordingPart,
        access_secret: Option<&str>,
    ) -> Result<Vec<u8>, ProviderError> {
        let url = match access_secret {
            Some(secret) => with_playback_secret(&part.download_url, secret)?,
            None => part.download_url.clone(),
        };
        self.request_with_retry(
            "download recording part",
            |client, token| client.get(&url).bearer_auth(token).send(),
            |response| {
                let body = response.bytes().map_err(|e| {
                    ProviderError::transient(format!("Failed to read part body: {}", e))
                })?;
                Ok(body.to_vec())
            },
        )
    }

    fn delete_recording(&self, meeting_id: &str) -> Result<(), ProviderError> {
        let url = format!(
            "{}/meetings/{}/recordings",
            self.config.base_url,
            urlencoding::encode(meeting_id)
        );
        let result = self.request_with_retry(
            "delete provider recording",
            |client, token| client.delete(&url).bearer_auth(token).send(),
            |_| Ok(()),
        );
        // A retried cleanup may find the recording already gone
        match result {
            Err(ProviderError::Permanent(msg)) if msg.contains("404") => Ok(()),
            other => other,
        }
    }
}
