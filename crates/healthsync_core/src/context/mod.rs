//! Small cross-process scratch space and read-only credential lookup.
//!
//! # Responsibility
//! - Publish the signed-in owner, locale and last sync time to secondary
//!   processes through a JSON document in the shared container.
//! - Expose credential lookup as a read-only seam.
//!
//! # Invariants
//! - Writers replace the document atomically (temp file then rename), so a
//!   reader sees either the old or the new document.
//! - A missing document reads as an empty context.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Values shared between the primary app and its extensions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessContext {
    pub owner_id: Option<String>,
    pub locale: Option<String>,
    pub last_sync_ms: Option<i64>,
}

#[derive(Debug)]
pub enum ContextError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl Display for ContextError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "shared context io failed: {err}"),
            Self::Parse(err) => write!(f, "shared context is malformed: {err}"),
        }
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for ContextError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ContextError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

pub trait SharedContext: Send + Sync {
    fn load(&self) -> Result<ProcessContext, ContextError>;
    fn save(&self, context: &ProcessContext) -> Result<(), ContextError>;

    /// Read-modify-write of the whole document.
    fn update(
        &self,
        apply: &mut dyn FnMut(&mut ProcessContext),
    ) -> Result<ProcessContext, ContextError> {
        let mut context = self.load()?;
        apply(&mut context);
        self.save(&context)?;
        Ok(context)
    }
}

/// JSON document in the shared container.
#[derive(Debug)]
pub struct FileSharedContext {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSharedContext {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replace(&self, context: &ProcessContext) -> Result<(), ContextError> {
        let encoded = serde_json::to_vec_pretty(context)?;
        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        if let Err(err) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err.into());
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }
}

impl SharedContext for FileSharedContext {
    fn load(&self) -> Result<ProcessContext, ContextError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(ProcessContext::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, context: &ProcessContext) -> Result<(), ContextError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.replace(context)
    }

    /// Holds the write lock across the read as well as the write.
    fn update(
        &self,
        apply: &mut dyn FnMut(&mut ProcessContext),
    ) -> Result<ProcessContext, ContextError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut context = self.load()?;
        apply(&mut context);
        self.replace(&context)?;
        Ok(context)
    }
}

/// Read-only access to secrets held by the platform credential store.
pub trait CredentialStore: Send + Sync {
    fn lookup(&self, service: &str) -> Option<String>;
}

/// Fixed credential map for hosts without a platform store.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    entries: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, service: impl Into<String>, secret: impl Into<String>) -> Self {
        self.entries.insert(service.into(), secret.into());
        self
    }
}

impl CredentialStore for StaticCredentials {
    fn lookup(&self, service: &str) -> Option<String> {
        self.entries.get(service).cloned()
    }
}
