//! Durable per-domain task store.
//!
//! Each domain keeps its records in one pretty-printed JSON list that is
//! rewritten in full on every mutation. Writes go to a sibling temporary file
//! which is then renamed over the store, so a crash mid-write leaves either the
//! old or the new list on disk.

use crate::task::{TaskPayload, TaskRecord};
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store file could not be read or written
    #[error("Store IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Store file exists but is not a valid task list
    #[error("Store file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// No record with the given id
    #[error("Task not found: {0}")]
    NotFound(String),
}

/// Task list of one domain, persisted as a single JSON file.
///
/// `update`/`try_update` hold a per-store lock around load-modify-save, so
/// concurrent writers inside one process never lose each other's changes.
#[derive(Debug)]
pub struct TaskStore<P> {
    path: PathBuf,
    lock: Mutex<()>,
    _payload: PhantomData<fn() -> P>,
}

impl<P: TaskPayload> TaskStore<P> {
    /// Store at an explicit file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            _payload: PhantomData,
        }
    }

    /// Store for `P`'s domain inside `state_dir`.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(P::DOMAIN.store_file()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record. A missing store is created empty.
    pub fn load_all(&self) -> Result<Vec<TaskRecord<P>>, StoreError> {
        let _guard = self.guard();
        self.read_unlocked()
    }

    /// Replace the whole list.
    pub fn save_all(&self, tasks: &[TaskRecord<P>]) -> Result<(), StoreError> {
        let _guard = self.guard();
        self.write_unlocked(tasks)
    }

    /// Fetch a single record by id.
    pub fn get(&self, id: &str) -> Result<Option<TaskRecord<P>>, StoreError> {
        Ok(self.load_all()?.into_iter().find(|task| task.id == id))
    }

    /// Load, mutate and save under the store lock.
    pub fn update<T>(
        &self,
        mutate: impl FnOnce(&mut Vec<TaskRecord<P>>) -> T,
    ) -> Result<T, StoreError> {
        self.try_update(|tasks| Ok(mutate(tasks)))
    }

    /// Like [`TaskStore::update`], but only writes when the closure reports a change.
    pub fn update_when<T>(
        &self,
        mutate: impl FnOnce(&mut Vec<TaskRecord<P>>) -> (bool, T),
    ) -> Result<T, StoreError> {
        let _guard = self.guard();
        let mut tasks = self.read_unlocked()?;
        let (changed, out) = mutate(&mut tasks);
        if changed {
            self.write_unlocked(&tasks)?;
        }
        Ok(out)
    }

    /// Like [`TaskStore::update`], but the closure can abort.
    ///
    /// When the closure returns an error nothing is written and the
    /// in-memory change is discarded.
    pub fn try_update<T, E>(
        &self,
        mutate: impl FnOnce(&mut Vec<TaskRecord<P>>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let _guard = self.guard();
        let mut tasks = self.read_unlocked()?;
        let out = mutate(&mut tasks)?;
        self.write_unlocked(&tasks)?;
        Ok(out)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_unlocked(&self) -> Result<Vec<TaskRecord<P>>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.write_unlocked(&[])?;
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn write_unlocked(&self, tasks: &[TaskRecord<P>]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let json = serde_json::to_string_pretty(tasks).map_err(|e| StoreError::Io {
            path: self.path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
