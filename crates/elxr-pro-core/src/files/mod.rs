//! Persistent file store.
//!
//! Records live as files under the configured data directory, either private
//! (`<data_dir>/private`, mode 0600) or public (mode 0644). Writes are atomic:
//! the content lands in a temporary file in the target directory which is then
//! renamed over the destination.

pub mod machine_token;
pub mod state_files;
pub mod user_config;

use std::fs::{self, DirBuilder, Permissions};
use std::io::{self, Write};
use std::marker::PhantomData;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

pub const ROOT_READABLE_MODE: u32 = 0o600;
pub const WORLD_READABLE_MODE: u32 = 0o644;
const PRIVATE_DIR_MODE: u32 = 0o700;

/// Atomically write `content` to `path`.
///
/// When `mode` is `None` an existing file keeps its mode; a new file gets
/// 0644. Ownership of an existing file is preserved.
pub fn write_file(path: &Path, content: &str, mode: Option<u32>) -> io::Result<()> {
    let existing = fs::metadata(path).ok().filter(fs::Metadata::is_file);
    let mode = mode
        .or_else(|| existing.as_ref().map(|m| m.permissions().mode() & 0o7777))
        .unwrap_or(WORLD_READABLE_MODE);

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tracing::debug!(
        "writing file {} atomically via tempfile {}",
        path.display(),
        tmp.path().display()
    );
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    fs::set_permissions(tmp.path(), Permissions::from_mode(mode))?;
    if let Some(meta) = &existing {
        std::os::unix::fs::chown(tmp.path(), Some(meta.uid()), Some(meta.gid()))?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read `path`, returning `None` when it does not exist.
pub fn load_file(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("tried to load {} but file does not exist", path.display());
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Remove `path` if present. A missing file is not an error.
pub fn ensure_file_absent(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("removed file: {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("tried to remove {} but file does not exist", path.display());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// A single named file in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    path: PathBuf,
    private: bool,
}

impl DataFile {
    pub fn new(directory: &Path, name: &str, private: bool) -> Self {
        Self {
            path: directory.join(name),
            private,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn is_private(&self) -> bool {
        self.private
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn write(&self, content: &str) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if self.private {
                DirBuilder::new()
                    .recursive(true)
                    .mode(PRIVATE_DIR_MODE)
                    .create(dir)?;
            } else {
                fs::create_dir_all(dir)?;
            }
        }
        let mode = if self.private {
            ROOT_READABLE_MODE
        } else {
            WORLD_READABLE_MODE
        };
        write_file(&self.path, content, Some(mode))?;
        Ok(())
    }

    pub fn read(&self) -> Result<Option<String>> {
        Ok(load_file(&self.path)?)
    }

    pub fn delete(&self) -> Result<()> {
        Ok(ensure_file_absent(&self.path)?)
    }
}

/// A [`DataFile`] holding one JSON-encoded record of type `T`.
#[derive(Debug, Clone)]
pub struct JsonFile<T> {
    file: DataFile,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonFile<T>
where
    T: Serialize + DeserializeOwned,
{
    pub const fn new(file: DataFile) -> Self {
        Self {
            file,
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn exists(&self) -> bool {
        self.file.exists()
    }

    /// Read the record. Missing or empty files yield `None`; unparseable
    /// content is an [`Error::InvalidFileFormat`].
    pub fn read(&self) -> Result<Option<T>> {
        let Some(raw) = self.file.read()? else {
            return Ok(None);
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|_| Error::InvalidFileFormat {
                path: self.file.path().to_path_buf(),
                format: "json",
            })
    }

    pub fn write(&self, record: &T) -> Result<()> {
        self.file.write(&serde_json::to_string(record)?)
    }

    pub fn delete(&self) -> Result<()> {
        self.file.delete()
    }
}
