//! Boundary to the external fetch client: the metadata documents it writes and the
//! surface the discovery loop drives it through.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tagscout_core::{media_identifier_from_url, MediaRecord};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub const CRATE_NAME: &str = "tagscout-adapters";

/// File suffix of metadata documents in the output directory.
pub const METADATA_SUFFIX: &str = ".json";

pub const DEFAULT_SCRAPER_BIN: &str = "instagram-scraper";

const STDERR_TAIL_LINES: usize = 5;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("reading {}: {}", path.display(), source)]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {}", path.display(), source)]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntryError {
    #[error("entry is not an object")]
    NotAnObject,
    #[error("entry has no display_url")]
    MissingDisplayUrl,
    #[error("display_url {0:?} yields no media identifier")]
    UnusableDisplayUrl(String),
    #[error("entry has no edge_liked_by.count")]
    MissingPopularity,
}

/// Metadata written by the fetch client. Entries stay raw JSON so one bad entry
/// cannot spoil the rest of the document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMetadataDocument {
    #[serde(rename = "GraphImages")]
    entries: Vec<JsonValue>,
}

impl RawMetadataDocument {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = RawMediaEntry<'_>> {
        self.entries
            .iter()
            .enumerate()
            .map(|(position, value)| RawMediaEntry { position, value })
    }
}

pub async fn load_document(path: &Path) -> Result<RawMetadataDocument, DocumentError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| DocumentError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    RawMetadataDocument::from_slice(&bytes).map_err(|source| DocumentError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Read-only view over one media entry of a [`RawMetadataDocument`].
#[derive(Debug, Clone, Copy)]
pub struct RawMediaEntry<'a> {
    position: usize,
    value: &'a JsonValue,
}

impl<'a> RawMediaEntry<'a> {
    pub fn position(&self) -> usize {
        self.position
    }

    /// Tag strings on the entry. Absent or malformed lists yield nothing and
    /// non-string elements are dropped.
    pub fn tags(&self) -> Vec<&'a str> {
        self.value
            .get("tags")
            .and_then(JsonValue::as_array)
            .map(|tags| tags.iter().filter_map(JsonValue::as_str).collect())
            .unwrap_or_default()
    }

    pub fn display_url(&self) -> Result<&'a str, EntryError> {
        if !self.value.is_object() {
            return Err(EntryError::NotAnObject);
        }
        self.value
            .get("display_url")
            .and_then(JsonValue::as_str)
            .ok_or(EntryError::MissingDisplayUrl)
    }

    pub fn popularity_count(&self) -> Result<u64, EntryError> {
        self.value
            .get("edge_liked_by")
            .and_then(|edge| edge.get("count"))
            .and_then(JsonValue::as_u64)
            .ok_or(EntryError::MissingPopularity)
    }

    pub fn media_record(&self) -> Result<MediaRecord, EntryError> {
        let url = self.display_url()?;
        let identifier = media_identifier_from_url(url)
            .ok_or_else(|| EntryError::UnusableDisplayUrl(url.to_string()))?;
        Ok(MediaRecord::new(identifier, self.popularity_count()?))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("must provide login user AND password")]
pub struct CredentialPairError;

/// How every fetch of a process lifetime authenticates. Decided once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    Credentials(Credentials),
    Anonymous,
}

impl AuthMode {
    pub fn from_login(
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, CredentialPairError> {
        match (username, password) {
            (Some(username), Some(password)) => {
                Ok(Self::Credentials(Credentials::new(username, password)))
            }
            (None, None) => Ok(Self::Anonymous),
            _ => Err(CredentialPairError),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Credentials(_) => "credentials",
            Self::Anonymous => "anonymous",
        }
    }
}

/// Parameters for one fetch-client run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub targets: Vec<String>,
    pub maximum: u32,
    pub destination: PathBuf,
    pub media_types: Vec<String>,
    pub media_metadata: bool,
    pub tag_mode: bool,
}

impl FetchConfig {
    pub fn for_tag(
        tag: impl Into<String>,
        maximum: u32,
        destination: impl Into<PathBuf>,
        media_types: Vec<String>,
    ) -> Self {
        Self {
            targets: vec![tag.into()],
            maximum,
            destination: destination.into(),
            media_types,
            media_metadata: true,
            tag_mode: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("scrape requested before authenticating")]
    Unauthenticated,
    #[error("spawning {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("fetch client exited with {status}: {stderr_tail}")]
    ExitStatus { status: String, stderr_tail: String },
    #[error("fetch client timed out after {0:?}")]
    TimedOut(Duration),
}

/// Surface of the external client; every call may fail with a [`FetchError`].
#[async_trait]
pub trait FetchClient: Send {
    async fn authenticate_with_credentials(
        &mut self,
        credentials: &Credentials,
    ) -> Result<(), FetchError>;

    async fn authenticate_anonymously(&mut self) -> Result<(), FetchError>;

    async fn scrape_by_tag(&mut self) -> Result<(), FetchError>;
}

/// Builds a fresh client per fetch, mirroring one scraper run per target.
pub trait FetchClientFactory: Send + Sync {
    fn build(&self, config: FetchConfig) -> Box<dyn FetchClient>;
}

#[derive(Debug, Clone)]
enum Session {
    Login(Credentials),
    Guest,
}

/// Drives an external scraper executable as a child process.
#[derive(Debug)]
pub struct CommandFetchClient {
    program: PathBuf,
    config: FetchConfig,
    timeout: Duration,
    session: Option<Session>,
}

impl CommandFetchClient {
    pub fn new(program: impl Into<PathBuf>, config: FetchConfig, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            config,
            timeout,
            session: None,
        }
    }

    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.config.targets.clone();
        if self.config.tag_mode {
            args.push("--tag".to_string());
        }
        args.push("--maximum".to_string());
        args.push(self.config.maximum.to_string());
        args.push("--destination".to_string());
        args.push(self.config.destination.display().to_string());
        if self.config.media_metadata {
            args.push("--media-metadata".to_string());
        }
        if !self.config.media_types.is_empty() {
            args.push("--media-types".to_string());
            args.extend(self.config.media_types.iter().cloned());
        }
        args.push("--quiet".to_string());
        if let Some(Session::Login(credentials)) = &self.session {
            args.push("--login-user".to_string());
            args.push(credentials.username.clone());
            args.push("--login-pass".to_string());
            args.push(credentials.password().to_string());
        }
        args
    }
}

#[async_trait]
impl FetchClient for CommandFetchClient {
    async fn authenticate_with_credentials(
        &mut self,
        credentials: &Credentials,
    ) -> Result<(), FetchError> {
        if credentials.username.trim().is_empty() || credentials.password().is_empty() {
            return Err(FetchError::Authentication(
                "empty username or password".to_string(),
            ));
        }
        self.session = Some(Session::Login(credentials.clone()));
        Ok(())
    }

    async fn authenticate_anonymously(&mut self) -> Result<(), FetchError> {
        self.session = Some(Session::Guest);
        Ok(())
    }

    async fn scrape_by_tag(&mut self) -> Result<(), FetchError> {
        if self.session.is_none() {
            return Err(FetchError::Unauthenticated);
        }
        let program = self.program.display().to_string();
        debug!(%program, targets = ?self.config.targets, maximum = self.config.maximum, "spawning fetch client");

        let child = Command::new(&self.program)
            .args(self.command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FetchError::Spawn {
                program: program.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| FetchError::TimedOut(self.timeout))?
            .map_err(|source| FetchError::Spawn { program, source })?;

        if output.status.success() {
            return Ok(());
        }
        Err(FetchError::ExitStatus {
            status: output.status.to_string(),
            stderr_tail: stderr_tail(&output.stderr),
        })
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}

#[derive(Debug, Clone)]
pub struct CommandFetchClientFactory {
    program: PathBuf,
    timeout: Duration,
}

impl CommandFetchClientFactory {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl FetchClientFactory for CommandFetchClientFactory {
    fn build(&self, config: FetchConfig) -> Box<dyn FetchClient> {
        Box::new(CommandFetchClient::new(
            self.program.clone(),
            config,
            self.timeout,
        ))
    }
}
