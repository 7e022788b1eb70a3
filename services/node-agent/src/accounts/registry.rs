//! Backend registry keyed by type string and login shell.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use super::directory::AccountDirectory;
use super::{AccountError, Backend};

/// Errors from backend registration and lookup.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no backend registered for type {0}")]
    UnknownType(String),

    #[error("backend type {0} already registered")]
    DuplicateType(String),

    #[error("shell {0} already claimed by another backend")]
    DuplicateShell(String),

    /// The account exists but was not created by any registered backend.
    #[error("account {name} has shell {shell}, which no backend claims")]
    UnknownShell { name: String, shell: String },
}

/// Registered backends and the directory used to find their accounts.
pub struct BackendRegistry {
    by_type: HashMap<String, Arc<dyn Backend>>,
    by_shell: HashMap<String, Arc<dyn Backend>>,
    directory: Arc<dyn AccountDirectory>,
}

impl BackendRegistry {
    pub fn new(directory: Arc<dyn AccountDirectory>) -> Self {
        Self {
            by_type: HashMap::new(),
            by_shell: HashMap::new(),
            directory,
        }
    }

    /// Register a backend. Type strings and shells must both be unique.
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> Result<(), RegistryError> {
        let kind = backend.type_name().to_string();
        let shell = backend.shell().to_string();

        if self.by_type.contains_key(&kind) {
            return Err(RegistryError::DuplicateType(kind));
        }
        if self.by_shell.contains_key(&shell) {
            return Err(RegistryError::DuplicateShell(shell));
        }

        info!(backend_type = %kind, shell = %shell, "Registered backend");
        self.by_type.insert(kind, Arc::clone(&backend));
        self.by_shell.insert(shell, backend);
        Ok(())
    }

    pub fn backend_for_type(&self, kind: &str) -> Result<Arc<dyn Backend>, RegistryError> {
        self.by_type
            .get(kind)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownType(kind.to_string()))
    }

    /// Backend owning the local account `name`, or `None` if no such
    /// account exists.
    ///
    /// An existing account with a shell no backend claims is not ours and
    /// yields [`RegistryError::UnknownShell`].
    pub fn backend_for_account(&self, name: &str) -> Result<Option<Arc<dyn Backend>>, AccountError> {
        let Some(shell) = self.directory.shell_of(name)? else {
            return Ok(None);
        };
        match self.by_shell.get(&shell) {
            Some(backend) => Ok(Some(Arc::clone(backend))),
            None => {
                warn!(sliver = %name, shell = %shell, "Account exists with unrecognized shell");
                Err(RegistryError::UnknownShell {
                    name: name.to_string(),
                    shell,
                }
                .into())
            }
        }
    }

    /// Names of local accounts whose shell belongs to a registered backend.
    pub fn existing_accounts(&self) -> std::io::Result<Vec<String>> {
        Ok(self
            .directory
            .entries()?
            .into_iter()
            .filter(|(_, shell)| self.by_shell.contains_key(shell))
            .map(|(name, _)| name)
            .collect())
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.by_type.keys().map(String::as_str)
    }
}
