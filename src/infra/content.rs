//! Filesystem-backed content root served through the rendered cache.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("invalid content path")]
    InvalidPath,
    #[error("content not found")]
    NotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A file read from the content root.
#[derive(Debug, Clone)]
pub struct ContentFile {
    pub path: PathBuf,
    pub bytes: Bytes,
    pub modified: Option<SystemTime>,
}

impl ContentFile {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }
}

#[derive(Debug, Clone)]
pub struct ContentRoot {
    root: PathBuf,
}

impl ContentRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the page behind a request path.
    ///
    /// `/` and directory paths map to `index.html`; extensionless paths try
    /// `<path>.html` before `<path>/index.html`.
    pub async fn read_page(&self, request_path: &str) -> Result<ContentFile, ContentError> {
        let relative = request_path.trim_start_matches('/');
        if relative.is_empty() || relative.ends_with('/') {
            return self.read(&format!("{relative}index.html")).await;
        }

        if Path::new(relative).extension().is_some() {
            return self.read(relative).await;
        }

        match self.read(&format!("{relative}.html")).await {
            Err(ContentError::NotFound) => self.read(&format!("{relative}/index.html")).await,
            other => other,
        }
    }

    /// Read a file by its path relative to the root.
    pub async fn read(&self, relative: &str) -> Result<ContentFile, ContentError> {
        let path = self.resolve(relative)?;
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContentError::NotFound);
            }
            Err(err) => return Err(err.into()),
        };
        if !metadata.is_file() {
            return Err(ContentError::NotFound);
        }

        let bytes = fs::read(&path).await?;
        Ok(ContentFile {
            path,
            bytes: Bytes::from(bytes),
            modified: metadata.modified().ok(),
        })
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, ContentError> {
        let relative = Path::new(relative);
        if relative.is_absolute()
            || relative.components().any(|component| {
                matches!(
                    component,
                    Component::ParentDir | Component::Prefix(_) | Component::RootDir
                )
            })
        {
            return Err(ContentError::InvalidPath);
        }

        Ok(self.root.join(relative))
    }
}
