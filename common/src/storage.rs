use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use chrono::{SecondsFormat, Utc};
use thiserror::Error;

use crate::{program::Program, types::FileEntry};

/// Mount point used by the device; names may carry it as a prefix.
pub const FLASH_MOUNT_PREFIX: &str = "/flash/";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid file name `{0}`")]
    InvalidName(String),
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error("program file `{0}` is empty or corrupted")]
    Corrupt(String),
    #[error("program file `{name}` holds {found:?} after writing {expected:?}")]
    VerifyFailed {
        name: String,
        expected: char,
        found: Option<char>,
    },
    #[error("flash i/o on `{name}` failed")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Flat file area on flash, backed by a directory.
#[derive(Debug, Clone)]
pub struct FlashStore {
    root: PathBuf,
}

impl FlashStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root).map_err(|source| StorageError::Io {
            name: self.root.display().to_string(),
            source,
        })
    }

    /// Strips the mount prefix and rejects anything that is not a plain file name.
    pub fn normalize_name(name: &str) -> Result<&str, StorageError> {
        let trimmed = name.trim();
        let bare = trimmed
            .strip_prefix(FLASH_MOUNT_PREFIX)
            .unwrap_or(trimmed);

        if bare.is_empty()
            || bare.contains('/')
            || bare.contains('\\')
            || bare.contains("..")
        {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(bare)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.read_prefix(name, usize::MAX)
    }

    pub fn read_prefix(&self, name: &str, max_bytes: usize) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(name)?;
        let file = fs::File::open(&path).map_err(|source| io_error(name, source))?;

        let mut buffer = Vec::new();
        file.take(max_bytes as u64)
            .read_to_end(&mut buffer)
            .map_err(|source| io_error(name, source))?;
        Ok(buffer)
    }

    pub fn write(&self, name: &str, contents: &[u8]) -> Result<(), StorageError> {
        self.create_with(name, |path| fs::write(path, contents))
    }

    pub fn append(&self, name: &str, contents: &[u8]) -> Result<(), StorageError> {
        self.create_with(name, |path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?
                .write_all(contents)
        })
    }

    /// Returns whether a file was actually removed.
    pub fn remove(&self, name: &str) -> Result<bool, StorageError> {
        let path = self.resolve(name)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(io_error(name, source)),
        }
    }

    pub fn list(&self) -> Result<Vec<FileEntry>, StorageError> {
        let root_name = self.root.display().to_string();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::Io {
                    name: root_name,
                    source,
                })
            }
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::Io {
                name: root_name.clone(),
                source,
            })?;
            let metadata = entry.metadata().map_err(|source| StorageError::Io {
                name: entry.file_name().to_string_lossy().into_owned(),
                source,
            })?;
            if !metadata.is_file() {
                continue;
            }
            files.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// `Ok(None)` when no program was ever stored.
    pub fn load_program(&self, name: &str) -> Result<Option<Program>, StorageError> {
        if !self.exists(name) {
            return Ok(None);
        }

        let contents = self.read_prefix(name, 1)?;
        contents
            .first()
            .copied()
            .and_then(Program::from_flag)
            .map(Some)
            .ok_or_else(|| StorageError::Corrupt(name.to_string()))
    }

    /// Replaces the program file with the flag byte and reads it back.
    pub fn save_program(&self, name: &str, program: Program) -> Result<Program, StorageError> {
        self.remove(name)?;
        self.write(name, &[program.flag()])?;

        let stored = self.read_prefix(name, 1)?.first().copied();
        match stored.and_then(Program::from_flag) {
            Some(found) if found == program => Ok(found),
            _ => Err(StorageError::VerifyFailed {
                name: name.to_string(),
                expected: program.flag() as char,
                found: stored.map(char::from),
            }),
        }
    }

    pub fn append_event(&self, name: &str, message: &str) -> Result<(), StorageError> {
        let line = format!(
            "{} {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            message
        );
        self.append(name, line.as_bytes())
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(Self::normalize_name(name)?))
    }

    /// Runs a creating operation, making the root directory on first use.
    fn create_with<F>(&self, name: &str, op: F) -> Result<(), StorageError>
    where
        F: Fn(&Path) -> std::io::Result<()>,
    {
        let path = self.resolve(name)?;
        match op(&path) {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.ensure_root()?;
                op(&path).map_err(|source| io_error(name, source))
            }
            result => result.map_err(|source| io_error(name, source)),
        }
    }
}

fn io_error(name: &str, source: std::io::Error) -> StorageError {
    if source.kind() == ErrorKind::NotFound {
        StorageError::NotFound(name.to_string())
    } else {
        StorageError::Io {
            name: name.to_string(),
            source,
        }
    }
}
