use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use tracing::trace;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub type ArtifactReader = Box<dyn Read + Send>;

pub fn image_artifact_path(name: &str) -> String {
    format!("pkg/{name}.squashfs")
}

pub fn meta_artifact_path(name: &str) -> String {
    format!("pkg/{name}.meta")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryLocation {
    Directory(PathBuf),
    Http(String),
}

impl RepositoryLocation {
    pub fn parse(location: &str) -> Self {
        let trimmed = location.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Self::Http(trimmed.to_string())
        } else {
            Self::Directory(PathBuf::from(trimmed))
        }
    }
}

impl fmt::Display for RepositoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory(path) => write!(f, "{}", path.display()),
            Self::Http(url) => f.write_str(url),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Repository {
    location: RepositoryLocation,
    client: Client,
}

impl Repository {
    pub fn location(&self) -> &RepositoryLocation {
        &self.location
    }

    /// Opens `relative_path` inside the repository. `Ok(None)` means the
    /// repository does not carry the artifact.
    pub fn open(&self, relative_path: &str) -> Result<Option<ArtifactReader>> {
        let relative_path = relative_path.trim_start_matches('/');
        match &self.location {
            RepositoryLocation::Directory(base) => {
                let path = base.join(relative_path);
                match File::open(&path) {
                    Ok(file) => Ok(Some(Box::new(file))),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(err) => {
                        Err(err).with_context(|| format!("failed to open {}", path.display()))
                    }
                }
            }
            RepositoryLocation::Http(base) => {
                let url = format!("{}/{relative_path}", base.trim_end_matches('/'));
                trace!(%url, "requesting artifact");
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .with_context(|| format!("failed to fetch {url}"))?;
                match response.status() {
                    StatusCode::OK => Ok(Some(Box::new(response))),
                    StatusCode::NOT_FOUND => Ok(None),
                    status => Err(anyhow!("failed to fetch {url}: HTTP status {status}")),
                }
            }
        }
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.location.fmt(f)
    }
}

/// The ordered repositories of one invocation, sharing a single HTTP client.
#[derive(Debug, Clone, Default)]
pub struct RepositorySet {
    repos: Vec<Repository>,
}

impl RepositorySet {
    pub fn new(locations: impl IntoIterator<Item = RepositoryLocation>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self::with_client(locations, client))
    }

    pub fn with_client(
        locations: impl IntoIterator<Item = RepositoryLocation>,
        client: Client,
    ) -> Self {
        let repos = locations
            .into_iter()
            .map(|location| Repository {
                location,
                client: client.clone(),
            })
            .collect();
        Self { repos }
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Repository> {
        self.repos.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Repository> {
        self.repos.iter()
    }
}
