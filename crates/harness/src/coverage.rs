//! Coverage receiver.
//!
//! Browsers upload one coverage report per test page with `PUT` or `POST`.
//! The body is either JSON or a form, carrying a `payload` field whose
//! value is the JSON-encoded upload:
//!
//! ```text
//! { "payload": "{\"navigator\":{\"userAgent\":\"...\"},\"document\":{\"URL\":\"...\"},\"coverage\":{...}}" }
//! ```
//!
//! The `coverage` member is written, pretty-printed, to
//! `coverage-<browser>-<version>-<testfile>-<instance>-<rand>.json` in the
//! coverage directory. A failed write is reported to the uploader and
//! dropped; retrying is the browser's business.

use crate::result::{HarnessError, HarnessResult};
use axum::extract::{DefaultBodyLimit, FromRequest, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::put;
use axum::{Form, Json, Router};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Default URL path the receiver listens on
pub const DEFAULT_COVERAGE_PATH: &str = "/coverage";

/// Default limit on an upload body (coverage for large bundles is big)
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

const UNKNOWN: &str = "unknown";
const UNKNOWN_VERSION: &str = "0";
const MAX_NAME_ATTEMPTS: usize = 8;

// =============================================================================
// Browser classification
// =============================================================================

/// Browser family and version derived from a user agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserInfo {
    /// Lowercase family: chrome, webkit, opera, msie, mozilla or unknown
    pub name: String,
    /// Version string, `0` when absent
    pub version: String,
}

impl BrowserInfo {
    /// Identity used when nothing can be inferred
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN.to_string(),
            version: UNKNOWN_VERSION.to_string(),
        }
    }
}

struct UaPatterns {
    chrome: Regex,
    webkit: Regex,
    opera: Regex,
    msie: Regex,
    mozilla: Regex,
}

fn ua_patterns() -> Option<&'static UaPatterns> {
    static PATTERNS: OnceLock<Option<UaPatterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(UaPatterns {
                chrome: Regex::new(r"(chrome)[ /]([\w.]+)").ok()?,
                webkit: Regex::new(r"(webkit)[ /]([\w.]+)").ok()?,
                opera: Regex::new(r"(opera)(?:.*version|)[ /]([\w.]+)").ok()?,
                msie: Regex::new(r"(msie) ([\w.]+)").ok()?,
                mozilla: Regex::new(r"(mozilla)(?:.*? rv:([\w.]+)|)").ok()?,
            })
        })
        .as_ref()
}

/// Classify a user-agent string; the first matching family wins
#[must_use]
pub fn classify_user_agent(user_agent: &str) -> BrowserInfo {
    let Some(patterns) = ua_patterns() else {
        return BrowserInfo::unknown();
    };
    let ua = user_agent.to_lowercase();

    let mut candidates = vec![
        &patterns.chrome,
        &patterns.webkit,
        &patterns.opera,
        &patterns.msie,
    ];
    if !ua.contains("compatible") {
        candidates.push(&patterns.mozilla);
    }

    candidates
        .into_iter()
        .find_map(|re| re.captures(&ua))
        .map_or_else(BrowserInfo::unknown, |caps| BrowserInfo {
            name: caps
                .get(1)
                .map_or(UNKNOWN, |m| m.as_str())
                .to_string(),
            version: caps
                .get(2)
                .map(|m| m.as_str())
                .filter(|v| !v.is_empty())
                .unwrap_or(UNKNOWN_VERSION)
                .to_string(),
        })
}

// =============================================================================
// Upload payload
// =============================================================================

/// `navigator` member of an upload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NavigatorInfo {
    /// `navigator.userAgent`
    #[serde(rename = "userAgent", default)]
    pub user_agent: Option<String>,
}

/// `document` member of an upload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentInfo {
    /// `document.URL`
    #[serde(rename = "URL", default)]
    pub url: Option<String>,
}

/// Coverage report uploaded by one page
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageUpload {
    /// Browser identity
    #[serde(default)]
    pub navigator: Option<NavigatorInfo>,
    /// Page identity
    #[serde(default)]
    pub document: Option<DocumentInfo>,
    /// Coverage data, persisted as-is
    #[serde(default)]
    pub coverage: Value,
}

impl CoverageUpload {
    /// Decode a request body: `{payload: "<json>"}`, `{payload: {...}}`, or
    /// the upload object itself
    pub fn from_body(body: &[u8]) -> HarnessResult<Self> {
        let value: Value = serde_json::from_slice(body)?;
        Self::from_value(value)
    }

    fn from_value(mut value: Value) -> HarnessResult<Self> {
        match value.get_mut("payload").map(Value::take) {
            Some(Value::String(payload)) => Ok(serde_json::from_str(&payload)?),
            Some(payload @ Value::Object(_)) => Ok(serde_json::from_value(payload)?),
            Some(other) => Err(HarnessError::config(format!(
                "coverage payload must be a JSON string or object, got {other}"
            ))),
            None => Ok(serde_json::from_value(value)?),
        }
    }

    /// Browser identity, `unknown`/`0` when the user agent is missing
    #[must_use]
    pub fn browser(&self) -> BrowserInfo {
        self.navigator
            .as_ref()
            .and_then(|n| n.user_agent.as_deref())
            .map_or_else(BrowserInfo::unknown, classify_user_agent)
    }

    /// Test page file name, `unknown` when the URL is missing
    #[must_use]
    pub fn test_filename(&self) -> String {
        self.document
            .as_ref()
            .and_then(|d| d.url.as_deref())
            .map_or_else(|| UNKNOWN.to_string(), filename_from_url)
    }
}

/// Last path segment of a URL, with query and fragment removed
#[must_use]
pub fn filename_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    if name.is_empty() || name.ends_with(':') {
        UNKNOWN.to_string()
    } else {
        sanitize(name)
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// =============================================================================
// File naming
// =============================================================================

/// `coverage-<browser>-<version>-<testfile>-<instance>-<rand>.json`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageFileName {
    /// Browser identity
    pub browser: BrowserInfo,
    /// Test page file name
    pub test_filename: String,
    /// Content server instance
    pub instance_id: String,
    /// Random suffix
    pub suffix: u32,
}

impl CoverageFileName {
    /// Compose a name with a fresh random suffix
    #[must_use]
    pub fn new(browser: BrowserInfo, test_filename: String, instance_id: &str) -> Self {
        Self {
            browser,
            test_filename,
            instance_id: instance_id.to_string(),
            suffix: random_suffix(),
        }
    }

    /// Same name with another random suffix
    #[must_use]
    pub fn reroll(mut self) -> Self {
        self.suffix = random_suffix();
        self
    }
}

impl fmt::Display for CoverageFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "coverage-{}-{}-{}-{}-{}.json",
            sanitize(&self.browser.name),
            sanitize(&self.browser.version),
            self.test_filename,
            sanitize(&self.instance_id),
            self.suffix
        )
    }
}

fn random_suffix() -> u32 {
    (uuid::Uuid::new_v4().as_u128() & u128::from(u32::MAX)) as u32
}

// =============================================================================
// Receiver
// =============================================================================

/// Persists uploaded coverage reports
#[derive(Debug, Clone)]
pub struct CoverageReceiver {
    dir: PathBuf,
    instance_id: String,
}

impl CoverageReceiver {
    /// Receiver writing into `dir`, which is created if missing
    pub async fn new(dir: impl Into<PathBuf>, instance_id: impl Into<String>) -> HarnessResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "coverage directory ready");
        Ok(Self {
            dir,
            instance_id: instance_id.into(),
        })
    }

    /// Coverage directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Server instance id embedded in file names
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Write one upload, returning the file written.
    ///
    /// Files are created exclusively; if a generated name already exists a
    /// new suffix is drawn, so an earlier report is never overwritten.
    pub async fn store(&self, upload: &CoverageUpload) -> HarnessResult<PathBuf> {
        let contents = serde_json::to_string_pretty(&upload.coverage)?;
        let mut name = CoverageFileName::new(upload.browser(), upload.test_filename(), &self.instance_id);

        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = self.dir.join(name.to_string());
            let opened = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match opened {
                Ok(file) => {
                    if let Err(e) = write_contents(file, contents.as_bytes()).await {
                        discard_partial(&path).await;
                        return Err(e.into());
                    }
                    info!(file = %path.display(), "saved coverage report");
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(file = %path.display(), "coverage file name taken, drawing another");
                    name = name.reroll();
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(HarnessError::invalid_state(format!(
            "could not find a free coverage file name after {MAX_NAME_ATTEMPTS} attempts"
        )))
    }
}

async fn write_contents<W>(mut out: W, contents: &[u8]) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    out.write_all(contents).await?;
    out.flush().await
}

/// Remove a partially written report so the reporter never sees it
async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(file = %path.display(), "removed partial coverage file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), error = %e, "cannot remove partial coverage file"),
    }
}

#[derive(Debug, Deserialize)]
struct PayloadForm {
    payload: String,
}

/// Build the router answering `PUT`/`POST` on `path`
pub fn coverage_router(receiver: Arc<CoverageReceiver>, path: &str, max_upload_bytes: usize) -> Router {
    Router::new()
        .route(path, put(handle_upload).post(handle_upload))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(receiver)
}

async fn handle_upload(State(receiver): State<Arc<CoverageReceiver>>, request: Request) -> Response {
    let result = match decode_request(request).await {
        Ok(upload) => receiver.store(&upload).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(path) => (
            StatusCode::OK,
            Json(json!({
                "message": format!("Coverage data saved to {}", path.display()),
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "coverage upload failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "isError": true,
                    "message": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

async fn decode_request(request: Request) -> HarnessResult<CoverageUpload> {
    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    if is_form {
        let Form(form) = Form::<PayloadForm>::from_request(request, &())
            .await
            .map_err(|e| HarnessError::config(format!("invalid coverage form: {e}")))?;
        return Ok(serde_json::from_str(&form.payload)?);
    }

    let body = axum::body::Bytes::from_request(request, &())
        .await
        .map_err(|e| HarnessError::config(format!("cannot read coverage body: {e}")))?;
    CoverageUpload::from_body(&body)
}
