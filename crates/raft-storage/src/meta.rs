//! # meta
//!
//! why: log metadata and snapshot metadata must survive a crash mid-write
//! relations: owned by store::SegmentedLogStore, one file per record
//! what: MetaFile, an atomically replaced json file

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StorageError};

/// one json record stored at a fixed path
pub(crate) struct MetaFile<T> {
    path: PathBuf,
    temp: PathBuf,
    _record: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> MetaFile<T> {
    pub(crate) fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{}.json", name)),
            temp: dir.join(format!("{}.tmp", name)),
            _record: PhantomData,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// none when the record was never written
    pub(crate) fn load(&self) -> Result<Option<T>> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&contents)?))
    }

    /// atomic write: write to temp file then rename
    pub(crate) fn save(&self, record: &T, sync: bool) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        let mut file = File::create(&self.temp).map_err(|source| StorageError::CreateFile {
            path: self.temp.clone(),
            source,
        })?;
        file.write_all(&json)?;
        if sync {
            file.sync_all()?;
        }
        fs::rename(&self.temp, &self.path)?;
        Ok(())
    }
}
