//! HTTP snapshot frame source.
//!
//! This module provides `HttpSnapshotSource` for cameras that expose a single
//! JPEG/PNG snapshot endpoint instead of a stream.
//!
//! The HTTP source is responsible for:
//! - Polling the snapshot URL at the configured frame rate
//! - Authenticating with basic or digest credentials taken from the config or
//!   from the URL's user-info (which is stripped before any request)
//! - Decoding snapshots in-memory and publishing them
//!
//! A failed poll keeps the previous frame; it never clears the slot.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use image::RgbImage;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use url::Url;

use super::digest::DigestState;
use super::retry::{poll_until, RetryPolicy, Sleeper, ThreadSleeper};
use super::{FrameSource, ProducerThreads};
use crate::error::ConnectError;
use crate::frame::{CaptureSession, Frame};

const MAX_SNAPSHOT_BYTES: u64 = 20 * 1024 * 1024;

/// Credential scheme for snapshot requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpAuthScheme {
    #[default]
    Basic,
    Digest,
}

/// Configuration for an HTTP snapshot source.
#[derive(Clone, Debug)]
pub struct HttpSnapshotConfig {
    /// Snapshot URL (e.g., "http://192.168.1.64/ISAPI/Streaming/channels/101/picture")
    pub url: String,
    /// Polls per second.
    pub fps: u32,
    /// Explicit credentials; URL user-info is used when these are unset.
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth: HttpAuthScheme,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Budget for the first frame to arrive in `start()`.
    pub startup: RetryPolicy,
}

impl Default for HttpSnapshotConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1/snapshot.jpg".to_string(),
            fps: 5,
            username: None,
            password: None,
            auth: HttpAuthScheme::Basic,
            timeout: Duration::from_secs(5),
            startup: RetryPolicy::startup(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Credentials {
    username: String,
    password: String,
}

/// Split user-info off a URL. Returns the bare URL and decoded credentials.
fn strip_credentials(raw: &str) -> Result<(Url, Option<Credentials>), ConnectError> {
    let mut url = Url::parse(raw).map_err(|_| ConnectError::InvalidSource(raw.to_string()))?;
    let credentials = if url.username().is_empty() && url.password().is_none() {
        None
    } else {
        let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
        let creds = Credentials {
            username: decode(url.username()),
            password: decode(url.password().unwrap_or("")),
        };
        url.set_username("")
            .map_err(|_| ConnectError::InvalidSource(raw.to_string()))?;
        url.set_password(None)
            .map_err(|_| ConnectError::InvalidSource(raw.to_string()))?;
        Some(creds)
    };
    Ok((url, credentials))
}

fn basic_authorization(credentials: &Credentials) -> String {
    let token = format!("{}:{}", credentials.username, credentials.password);
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(token)
    )
}

fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// One authenticated snapshot endpoint.
struct SnapshotFetcher {
    agent: ureq::Agent,
    url: Url,
    credentials: Option<Credentials>,
    scheme: HttpAuthScheme,
    digest: DigestState,
}

impl SnapshotFetcher {
    fn fetch(&mut self) -> Result<RgbImage> {
        let response = match self.send() {
            Err(ureq::Error::Status(401, response))
                if self.scheme == HttpAuthScheme::Digest && self.credentials.is_some() =>
            {
                let challenge = response
                    .header("WWW-Authenticate")
                    .ok_or_else(|| anyhow!("401 without WWW-Authenticate"))?
                    .to_string();
                if !self.digest.accept_challenge(&challenge) {
                    return Err(anyhow!("unusable digest challenge '{}'", challenge));
                }
                self.send()
            }
            other => other,
        }
        .map_err(|err| match err {
            ureq::Error::Status(code, _) => anyhow!("snapshot request returned HTTP {}", code),
            other => anyhow!("snapshot request failed: {}", other),
        })?;

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_SNAPSHOT_BYTES)
            .read_to_end(&mut bytes)
            .context("read snapshot body")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty snapshot"));
        }
        let image = image::load_from_memory(&bytes).context("decode snapshot")?;
        Ok(image.into_rgb8())
    }

    fn send(&mut self) -> Result<ureq::Response, ureq::Error> {
        let mut request = self.agent.get(self.url.as_str());
        if let Some(credentials) = &self.credentials {
            let header = match self.scheme {
                HttpAuthScheme::Basic => Some(basic_authorization(credentials)),
                HttpAuthScheme::Digest => self.digest.authorization(
                    &credentials.username,
                    &credentials.password,
                    "GET",
                    &request_uri(&self.url),
                ),
            };
            if let Some(header) = header {
                request = request.set("Authorization", &header);
            }
        }
        request.call()
    }
}

/// Polling snapshot source.
pub struct HttpSnapshotSource {
    config: HttpSnapshotConfig,
    url: Url,
    credentials: Option<Credentials>,
    session: CaptureSession,
    threads: ProducerThreads,
    sleeper: Arc<dyn Sleeper>,
}

impl HttpSnapshotSource {
    pub fn new(config: HttpSnapshotConfig) -> Result<Self, ConnectError> {
        let (url, url_credentials) = strip_credentials(&config.url)?;
        let credentials = match (&config.username, &config.password) {
            (Some(username), password) => Some(Credentials {
                username: username.clone(),
                password: password.clone().unwrap_or_default(),
            }),
            (None, _) => url_credentials,
        };
        Ok(Self {
            config,
            url,
            credentials,
            session: CaptureSession::new(),
            threads: ProducerThreads::default(),
            sleeper: Arc::new(ThreadSleeper),
        })
    }

    /// Request URL with credentials removed.
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    fn poll_interval(&self) -> Duration {
        if self.config.fps == 0 {
            Duration::from_secs(1)
        } else {
            Duration::from_secs_f64(1.0 / self.config.fps as f64)
        }
    }
}

impl FrameSource for HttpSnapshotSource {
    fn name(&self) -> &'static str {
        "http"
    }

    fn start(&mut self) -> Result<(), ConnectError> {
        if self.session.is_running() {
            return Ok(());
        }
        self.release();
        self.session.reset();
        self.session.set_running(true);

        let mut fetcher = SnapshotFetcher {
            agent: ureq::AgentBuilder::new()
                .timeout(self.config.timeout)
                .build(),
            url: self.url.clone(),
            credentials: self.credentials.clone(),
            scheme: self.config.auth,
            digest: DigestState::default(),
        };
        let session = self.session.clone();
        let sleeper = self.sleeper.clone();
        let interval = self.poll_interval();
        self.threads
            .spawn("http-snapshot", move || {
                let mut failures = 0u32;
                while session.is_running() {
                    let started = Instant::now();
                    match fetcher.fetch() {
                        Ok(image) => {
                            if failures > 0 {
                                log::info!(
                                    "HttpSnapshotSource: recovered after {} failed poll(s)",
                                    failures
                                );
                            }
                            failures = 0;
                            session.publish(Frame::new(image));
                        }
                        Err(err) => {
                            failures += 1;
                            session.record_dropped();
                            if failures == 1 {
                                log::warn!("HttpSnapshotSource: {:#}", err);
                            } else {
                                log::debug!("HttpSnapshotSource: {:#}", err);
                            }
                        }
                    }
                    sleeper.sleep(interval.saturating_sub(started.elapsed()));
                }
            })
            .map_err(|err| ConnectError::Request {
                url: self.url.to_string(),
                reason: err.to_string(),
            })?;

        let session = self.session.clone();
        match poll_until(&self.config.startup, self.sleeper.as_ref(), || {
            session.state().frames_captured > 0
        }) {
            Ok(_) => {
                log::info!("HttpSnapshotSource: connected to {}", self.url);
                Ok(())
            }
            Err(attempts) => {
                self.release();
                Err(ConnectError::NoFrame {
                    source_name: self.url.to_string(),
                    attempts,
                })
            }
        }
    }

    fn release(&mut self) {
        self.session.set_running(false);
        // A poll may be mid-request; it finishes within the request timeout.
        self.threads
            .join_all(self.config.timeout + Duration::from_millis(500));
    }

    fn session(&self) -> &CaptureSession {
        &self.session
    }
}

impl Drop for HttpSnapshotSource {
    fn drop(&mut self) {
        self.release();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
