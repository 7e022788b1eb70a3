//! Lookup of local OS accounts and their login shells.
//!
//! The login shell is the identity marker tying an account to the backend
//! that created it.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use nix::unistd::User;
use tracing::debug;

/// Source of local account entries.
pub trait AccountDirectory: Send + Sync {
    /// All `(name, shell)` entries.
    fn entries(&self) -> io::Result<Vec<(String, String)>>;

    /// Shell of the account `name`, or `None` if no such account exists.
    fn shell_of(&self, name: &str) -> io::Result<Option<String>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, shell)| shell))
    }
}

/// The host's account database.
///
/// Single-name lookups go through the system resolver (`getpwnam`), so
/// accounts served by NSS are found too. Enumeration reads a passwd(5)
/// format file, since slivers are always created as local accounts.
#[derive(Debug, Clone)]
pub struct PasswdDirectory {
    path: PathBuf,
}

impl PasswdDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for PasswdDirectory {
    fn default() -> Self {
        Self::new("/etc/passwd")
    }
}

impl AccountDirectory for PasswdDirectory {
    fn entries(&self) -> io::Result<Vec<(String, String)>> {
        let content = fs::read_to_string(&self.path)?;
        Ok(parse_passwd(&content))
    }

    fn shell_of(&self, name: &str) -> io::Result<Option<String>> {
        let user = User::from_name(name).map_err(io::Error::from)?;
        Ok(user.map(|user| user.shell.to_string_lossy().into_owned()))
    }
}

/// `name:passwd:uid:gid:gecos:home:shell`
fn parse_passwd(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() != 7 || fields[0].is_empty() {
                debug!(line, "Skipping malformed passwd entry");
                return None;
            }
            Some((fields[0].to_string(), fields[6].to_string()))
        })
        .collect()
}

/// Directory kept in memory, for the mock backend and tests.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    entries: Mutex<BTreeMap<String, String>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, shell: &str) {
        self.lock().insert(name.to_string(), shell.to_string());
    }

    pub fn remove(&self, name: &str) -> bool {
        self.lock().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AccountDirectory for InMemoryDirectory {
    fn entries(&self) -> io::Result<Vec<(String, String)>> {
        Ok(self
            .lock()
            .iter()
            .map(|(name, shell)| (name.clone(), shell.clone()))
            .collect())
    }

    fn shell_of(&self, name: &str) -> io::Result<Option<String>> {
        Ok(self.lock().get(name).cloned())
    }
}
