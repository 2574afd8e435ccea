//! File storage for the sandbox capability surface
//!
//! A `FileStore` exposes read/write/list/delete rooted at a logical
//! directory, with a traversal guard so scripts cannot escape their
//! area. `WebDataStore` adds one-shot downloads and schedule records
//! consumed by an external scheduler.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Download timeout for sandbox web fetches
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum accepted download size (scripts read these files back whole)
const MAX_FETCH_BYTES: u64 = 256 * 1024;

/// File store rooted at a single directory
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory of this store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a file name inside the root, rejecting traversal
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() {
            return Err(Error::Storage("empty file name".to_string()));
        }
        let candidate = Path::new(name);
        let escapes = candidate.is_absolute()
            || candidate
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir));
        if escapes {
            return Err(Error::Storage(format!("path escapes storage area: {name}")));
        }
        Ok(self.root.join(candidate))
    }

    /// Read a file's contents as a string
    ///
    /// # Errors
    ///
    /// Returns error if the name is invalid or the file cannot be read
    pub fn read(&self, name: &str) -> Result<String> {
        let path = self.resolve(name)?;
        Ok(std::fs::read_to_string(path)?)
    }

    /// Write a file, replacing any existing contents
    ///
    /// # Errors
    ///
    /// Returns error if the name is invalid or the write fails
    pub fn write(&self, name: &str, data: &str) -> Result<()> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    /// List file names in the root (non-recursive), sorted
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete a file
    ///
    /// # Errors
    ///
    /// Returns error if the name is invalid or the file cannot be removed
    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        std::fs::remove_file(path)?;
        Ok(())
    }
}

/// A recorded fetch schedule, persisted for the external scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSchedule {
    /// Source URL
    pub url: String,

    /// Destination file name inside the web-data area
    pub filename: String,

    /// Refresh interval in minutes
    pub interval_minutes: u32,
}

/// Web-data area: downloaded files plus persisted fetch schedules
pub struct WebDataStore {
    files: FileStore,
    schedules_path: PathBuf,
}

impl WebDataStore {
    /// Schedule file name inside the web-data area
    const SCHEDULES_FILE: &'static str = "schedules.json";

    /// Create a web-data store rooted at `root`
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn new(root: PathBuf) -> Result<Self> {
        let schedules_path = root.join(Self::SCHEDULES_FILE);
        Ok(Self {
            files: FileStore::new(root)?,
            schedules_path,
        })
    }

    /// Download a URL once into the web-data area.
    ///
    /// Blocking call; the sandbox invokes it from a dedicated thread.
    ///
    /// # Errors
    ///
    /// Returns error on network failure, non-success status, oversized
    /// body, or write failure
    pub fn fetch_once(&self, url: &str, filename: &str) -> Result<()> {
        tracing::info!(url, filename, "fetching web data");

        let client = reqwest::blocking::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()?;
        let response = client.get(url).send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Storage(format!("fetch failed with status {status}")));
        }
        if let Some(len) = response.content_length()
            && len > MAX_FETCH_BYTES
        {
            return Err(Error::Storage(format!("response too large: {len} bytes")));
        }

        let body = response.text()?;
        if body.len() as u64 > MAX_FETCH_BYTES {
            return Err(Error::Storage(format!(
                "response too large: {} bytes",
                body.len()
            )));
        }

        self.files.write(filename, &body)
    }

    /// Record a recurring fetch for the external scheduler.
    ///
    /// Replaces any existing schedule for the same filename.
    ///
    /// # Errors
    ///
    /// Returns error if the schedule file cannot be written
    pub fn fetch_scheduled(&self, url: &str, filename: &str, interval_minutes: u32) -> Result<()> {
        if interval_minutes == 0 {
            return Err(Error::Storage("interval must be at least 1 minute".to_string()));
        }

        let mut schedules = self.schedules()?;
        schedules.retain(|s| s.filename != filename);
        schedules.push(FetchSchedule {
            url: url.to_string(),
            filename: filename.to_string(),
            interval_minutes,
        });

        let raw = serde_json::to_string(&schedules)?;
        std::fs::write(&self.schedules_path, raw)?;
        tracing::info!(url, filename, interval_minutes, "fetch schedule recorded");
        Ok(())
    }

    /// Persisted fetch schedules
    ///
    /// # Errors
    ///
    /// Returns error if the schedule file exists but cannot be parsed
    pub fn schedules(&self) -> Result<Vec<FetchSchedule>> {
        if !self.schedules_path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.schedules_path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Read a downloaded file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read
    pub fn read(&self, filename: &str) -> Result<String> {
        self.files.read(filename)
    }

    /// List downloaded files
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read
    pub fn list(&self) -> Result<Vec<String>> {
        self.files.list()
    }
}
