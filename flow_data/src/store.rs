//! The store handle: a primary container shared by every worker, plus an
//! optional scratch container receiving outputs that are configured to be
//! dropped at the end of the run.

use crate::{ContainerSnafu, Result, StoreUnavailableSnafu};
use container_file::{ContainerFile, OpenMode};
use hashbrown::HashMap;
use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// How the workers of a run share the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Every worker reads, nobody writes.
    ReadOnly,
    /// Every worker writes; resizes happen at collective points.
    ReadWriteCollective,
    /// Worker 0 writes; the remaining ranks see read-only snapshots.
    ReadWriteSolo,
}

/// Which container a path resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The primary output container.
    Primary,
    /// The scratch container holding dropped outputs.
    Scratch,
}

/// A shared handle on the run's containers.
///
/// The handle is constructed once per run and shared by every worker; the
/// underlying files open lazily on first access and can be closed and
/// transparently reopened. Routing between the primary and the scratch
/// container is a function of the path and the drop-list, cached per path.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    mode: AccessMode,
    drop_list: Vec<String>,
    scratch_path: Option<PathBuf>,
    primary: Mutex<Option<ContainerFile>>,
    scratch: Mutex<Option<ContainerFile>>,
    routes: Mutex<HashMap<String, Route>>,
}

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

fn scratch_path_for(primary: &Path) -> PathBuf {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let uid = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
    let name = format!(
        "tmp-flowline-{}-{}-{}.bin",
        secs,
        std::process::id(),
        uid
    );
    primary.with_file_name(name)
}

impl Store {
    /// Create the handle for the container at `path`. A scratch container is
    /// arranged (not yet created on disk) when `drop_list` is non-empty.
    pub fn new(path: impl Into<PathBuf>, mode: AccessMode, drop_list: Vec<String>) -> Arc<Self> {
        let path = path.into();
        let scratch_path = if drop_list.is_empty() {
            None
        } else {
            let scratch = scratch_path_for(&path);
            info!(scratch = %scratch.display(), "writing dropped outputs to scratch container");
            Some(scratch)
        };
        Arc::new(Self {
            path,
            mode,
            drop_list,
            scratch_path,
            primary: Mutex::new(None),
            scratch: Mutex::new(None),
            routes: Mutex::new(HashMap::new()),
        })
    }

    /// Filesystem location of the primary container.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Filesystem location of the scratch container, when configured.
    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch_path.as_deref()
    }

    /// The configured drop-list.
    pub fn drop_list(&self) -> &[String] {
        &self.drop_list
    }

    /// True when the worker at `rank` is allowed to mutate the store.
    pub fn writable(&self, rank: usize) -> bool {
        match self.mode {
            AccessMode::ReadOnly => false,
            AccessMode::ReadWriteCollective => true,
            AccessMode::ReadWriteSolo => rank == 0,
        }
    }

    fn open_mode(&self) -> OpenMode {
        match self.mode {
            AccessMode::ReadOnly => OpenMode::ReadOnly,
            AccessMode::ReadWriteCollective | AccessMode::ReadWriteSolo => OpenMode::ReadWrite,
        }
    }

    /// Run `f` against the primary container, opening it if needed.
    pub fn with_primary<R>(
        &self,
        f: impl FnOnce(&mut ContainerFile) -> container_file::Result<R>,
    ) -> Result<R> {
        let mut guard = self.primary.lock();
        if guard.is_none() {
            *guard = Some(
                ContainerFile::open(&self.path, self.open_mode())
                    .context(StoreUnavailableSnafu { path: &self.path })?,
            );
            debug!(path = %self.path.display(), "opened primary container");
        }
        f(guard.as_mut().expect("opened above")).context(ContainerSnafu {
            path: self.path.display().to_string(),
        })
    }

    /// Run `f` against the scratch container, opening (and creating) it if
    /// needed. Only reachable through [`Route::Scratch`], which implies a
    /// configured scratch path.
    pub fn with_scratch<R>(
        &self,
        f: impl FnOnce(&mut ContainerFile) -> container_file::Result<R>,
    ) -> Result<R> {
        let path = self
            .scratch_path
            .as_ref()
            .expect("scratch routing requires a configured drop-list");
        let mut guard = self.scratch.lock();
        if guard.is_none() {
            *guard = Some(
                ContainerFile::open(path, OpenMode::ReadWrite)
                    .context(StoreUnavailableSnafu { path })?,
            );
            debug!(path = %path.display(), "opened scratch container");
        }
        f(guard.as_mut().expect("opened above")).context(ContainerSnafu {
            path: path.display().to_string(),
        })
    }

    /// Resolve which container `path` lives in: a path already present in
    /// the primary container stays there; otherwise paths with a drop-list
    /// entry as substring go to scratch; everything else is primary.
    pub fn route(&self, path: &str) -> Result<Route> {
        if let Some(route) = self.routes.lock().get(path) {
            return Ok(*route);
        }
        let in_primary = self.with_primary(|c| Ok(c.exists(path)))?;
        let route = if in_primary {
            Route::Primary
        } else if self.drop_list.iter().any(|d| path.contains(d.as_str())) {
            Route::Scratch
        } else {
            Route::Primary
        };
        self.routes.lock().insert(path.to_string(), route);
        Ok(route)
    }

    /// True when the scratch container has ever been materialized.
    pub fn scratch_on_disk(&self) -> bool {
        self.scratch.lock().is_some()
            || self
                .scratch_path
                .as_ref()
                .map(|p| p.exists())
                .unwrap_or(false)
    }

    /// True when any object exists at `path`, without materializing the
    /// scratch container just to look.
    pub fn exists(&self, path: &str) -> Result<bool> {
        match self.route(path)? {
            Route::Primary => self.with_primary(|c| Ok(c.exists(path))),
            Route::Scratch => {
                if !self.scratch_on_disk() {
                    return Ok(false);
                }
                self.with_scratch(|c| Ok(c.exists(path)))
            }
        }
    }

    /// Run `f` against the container `path` routes to.
    pub fn with_routed<R>(
        &self,
        path: &str,
        f: impl FnOnce(&mut ContainerFile) -> container_file::Result<R>,
    ) -> Result<R> {
        match self.route(path)? {
            Route::Primary => self.with_primary(f),
            Route::Scratch => self.with_scratch(f),
        }
    }

    /// Flush both containers without closing them.
    pub fn flush(&self) -> Result<()> {
        for guard in [&self.primary, &self.scratch] {
            if let Some(container) = guard.lock().as_mut() {
                container.flush().context(ContainerSnafu {
                    path: container.path().display().to_string(),
                })?;
            }
        }
        Ok(())
    }

    /// Flush and release both containers. Idempotent; the next access
    /// reopens lazily.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        *self.primary.lock() = None;
        *self.scratch.lock() = None;
        Ok(())
    }

    /// Delete the scratch file from disk, if one was ever created.
    pub fn remove_scratch(&self) -> std::io::Result<()> {
        *self.scratch.lock() = None;
        if let Some(path) = &self.scratch_path {
            if path.exists() {
                info!(path = %path.display(), "removing scratch container");
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}
