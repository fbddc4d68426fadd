//! File-backed isolated databases with templated seeding.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use tempfile::TempDir;
use uuid::Uuid;

use crate::error::DriverError;
use crate::provision::{DatabaseProvisioner, IsolatedDatabaseHandle, ProvisionError, SeedingOptions};

const EXTENSION: &str = "sqlite3";
const SIDE_FILES: &[&str] = &["-journal", "-wal", "-shm"];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands out SQLite databases inside a private temporary directory.
///
/// A seeded database is a copy of a template built once per distinct seed
/// script, so a schema is only created once however many tests use it.
/// Dropping the provisioner deletes the directory and every database left
/// in it.
///
/// # Example
///
/// ```rust
/// use txretry::sqlite::SqliteProvisioner;
/// use txretry::{DatabaseProvisioner, SeedingOptions};
///
/// # tokio_test::block_on(async {
/// let provisioner = SqliteProvisioner::new().unwrap();
/// let seed = SeedingOptions::with_seed_script("CREATE TABLE accounts (id INTEGER PRIMARY KEY);");
///
/// let first = provisioner.acquire(seed.clone()).await.unwrap();
/// let second = provisioner.acquire(seed).await.unwrap();
/// assert_ne!(first.connection_string(), second.connection_string());
/// assert_eq!(first.template_name(), second.template_name());
///
/// provisioner.release(first).await.unwrap();
/// provisioner.release(second).await.unwrap();
/// # });
/// ```
#[derive(Debug)]
pub struct SqliteProvisioner {
    root: TempDir,
    templates: Mutex<HashMap<String, String>>,
    live: Mutex<HashSet<String>>,
}

impl SqliteProvisioner {
    /// Provisioner rooted in a fresh temporary directory.
    pub fn new() -> Result<Self, ProvisionError> {
        Ok(Self::with_root(tempfile::tempdir()?))
    }

    /// Provisioner rooted in `root`, which it deletes on drop.
    pub fn with_root(root: TempDir) -> Self {
        Self {
            root,
            templates: Mutex::new(HashMap::new()),
            live: Mutex::new(HashSet::new()),
        }
    }

    /// Directory holding the databases.
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Names of acquired, not yet released databases.
    pub fn live_databases(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.live).iter().cloned().collect();
        names.sort();
        names
    }

    fn file(&self, name: &str) -> PathBuf {
        self.root.path().join(format!("{name}.{EXTENSION}"))
    }

    /// Build the template for `script` unless it exists; returns its name.
    fn template_for(&self, script: &str) -> Result<String, ProvisionError> {
        let mut templates = lock(&self.templates);
        if let Some(name) = templates.get(script) {
            return Ok(name.clone());
        }

        let mut hasher = DefaultHasher::new();
        script.hash(&mut hasher);
        let name = format!("template_{:016x}", hasher.finish());

        let path = self.file(&name);
        if let Err(err) = seed(&path, script) {
            // A half-seeded template must not be reused.
            let _ = fs::remove_file(&path);
            return Err(err.into());
        }

        tracing::debug!(template = %name, "seeded template database");
        templates.insert(script.to_string(), name.clone());
        Ok(name)
    }

    fn create(&self, options: &SeedingOptions) -> Result<IsolatedDatabaseHandle, ProvisionError> {
        let name = format!("db_{}", Uuid::new_v4().simple());
        let path = self.file(&name);

        let template_name = match options.schema_seed_script.as_deref() {
            Some(script) => {
                let template = self.template_for(script)?;
                fs::copy(self.file(&template), &path)?;
                Some(template)
            }
            None => {
                let conn = Connection::open(&path).map_err(DriverError::from)?;
                conn.close().map_err(|(_, err)| DriverError::from(err))?;
                None
            }
        };

        lock(&self.live).insert(name.clone());
        tracing::debug!(database = %name, template = ?template_name, "acquired isolated database");
        Ok(IsolatedDatabaseHandle::new(
            name,
            path.to_string_lossy(),
            template_name,
        ))
    }

    fn destroy(&self, handle: &IsolatedDatabaseHandle) -> Result<(), ProvisionError> {
        let mut live = lock(&self.live);
        if !live.contains(handle.name()) {
            return Err(ProvisionError::UnknownDatabase(handle.name().to_string()));
        }

        // Tracked until every file is gone.
        let path = self.file(handle.name());
        for suffix in std::iter::once("").chain(SIDE_FILES.iter().copied()) {
            let mut file = path.clone().into_os_string();
            file.push(suffix);
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        live.remove(handle.name());
        drop(live);

        tracing::debug!(database = %handle.name(), "released isolated database");
        Ok(())
    }
}

fn seed(path: &Path, script: &str) -> Result<(), DriverError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(script)?;
    conn.close().map_err(|(_, err)| DriverError::from(err))
}

impl DatabaseProvisioner for SqliteProvisioner {
    async fn acquire(&self, options: SeedingOptions) -> Result<IsolatedDatabaseHandle, ProvisionError> {
        self.create(&options)
    }

    async fn release(&self, handle: IsolatedDatabaseHandle) -> Result<(), ProvisionError> {
        self.destroy(&handle)
    }
}
