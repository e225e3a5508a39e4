//! Persisted key lookup.

use super::material::{KeyMaterial, KeyOrigin};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Scope under which a persisted key is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScope {
    /// Machine-wide key, shared by every process on the host.
    Machine,
    /// Key belonging to the current user.
    User,
}

impl KeyScope {
    /// Origin classification given to keys opened under this scope.
    pub fn origin(&self) -> KeyOrigin {
        match self {
            Self::Machine => KeyOrigin::Machine,
            Self::User => KeyOrigin::Software,
        }
    }
}

/// Source of persisted keys.
pub trait KeyStore: Send + Sync {
    /// Opens the key `name` under `scope`. `Ok(None)` means no such key.
    fn open(&self, scope: KeyScope, name: &str) -> Result<Option<KeyMaterial>>;
}

/// A store that never has a key.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeyStore;

impl KeyStore for NoKeyStore {
    fn open(&self, _scope: KeyScope, _name: &str) -> Result<Option<KeyMaterial>> {
        Ok(None)
    }
}

/// Reads PKCS#8 PEM keys from `<dir>/<name>.pem`.
#[derive(Debug, Clone, Default)]
pub struct FileKeyStore {
    machine_dir: Option<PathBuf>,
    user_dir: Option<PathBuf>,
}

impl FileKeyStore {
    pub fn new(machine_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            machine_dir,
            user_dir,
        }
    }

    fn dir(&self, scope: KeyScope) -> Option<&Path> {
        match scope {
            KeyScope::Machine => self.machine_dir.as_deref(),
            KeyScope::User => self.user_dir.as_deref(),
        }
    }

    /// Path a key would be read from, if the scope has a directory.
    pub fn key_path(&self, scope: KeyScope, name: &str) -> Result<Option<PathBuf>> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(Error::Config(format!("invalid key name: {name:?}")));
        }
        Ok(self.dir(scope).map(|dir| dir.join(format!("{name}.pem"))))
    }
}

impl KeyStore for FileKeyStore {
    fn open(&self, scope: KeyScope, name: &str) -> Result<Option<KeyMaterial>> {
        let Some(path) = self.key_path(scope, name)? else {
            return Ok(None);
        };

        let pem = match std::fs::read_to_string(&path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), ?scope, "no persisted key");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let key = KeyMaterial::from_pkcs8_pem(&pem, scope.origin())?;
        debug!(
            path = %path.display(),
            ?scope,
            algorithm = ?key.algorithm(),
            "opened persisted key"
        );
        Ok(Some(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ec_key;

    fn write_key(dir: &Path, name: &str) {
        let der = ec_key().export_pkcs8_der().unwrap();
        let pem = pem::encode(&pem::Pem::new("PRIVATE KEY", der.to_vec()));
        std::fs::write(dir.join(format!("{name}.pem")), pem).unwrap();
    }

    #[test]
    fn test_no_key_store_is_empty() {
        assert!(NoKeyStore.open(KeyScope::Machine, "any").unwrap().is_none());
    }

    #[test]
    fn test_missing_directory_or_file_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(Some(tmp.path().to_path_buf()), None);

        assert!(store.open(KeyScope::User, "k").unwrap().is_none());
        assert!(store.open(KeyScope::Machine, "k").unwrap().is_none());
    }

    #[test]
    fn test_opens_with_scope_origin() {
        let machine = tempfile::tempdir().unwrap();
        let user = tempfile::tempdir().unwrap();
        write_key(machine.path(), "machine-key");
        write_key(user.path(), "user-key");

        let store = FileKeyStore::new(
            Some(machine.path().to_path_buf()),
            Some(user.path().to_path_buf()),
        );

        let key = store.open(KeyScope::Machine, "machine-key").unwrap().unwrap();
        assert_eq!(key.origin(), KeyOrigin::Machine);
        assert_eq!(key.public_key(), ec_key().public_key());

        let key = store.open(KeyScope::User, "user-key").unwrap().unwrap();
        assert_eq!(key.origin(), KeyOrigin::Software);
    }

    #[test]
    fn test_corrupt_key_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("bad.pem"), "not a key").unwrap();
        let store = FileKeyStore::new(Some(tmp.path().to_path_buf()), None);

        assert!(matches!(
            store.open(KeyScope::Machine, "bad"),
            Err(Error::CertificateCreationFailed { .. })
        ));
    }

    #[test]
    fn test_rejects_path_like_names() {
        let store = FileKeyStore::new(Some(PathBuf::from("/tmp")), None);
        assert!(matches!(
            store.open(KeyScope::Machine, "../etc/passwd"),
            Err(Error::Config(_))
        ));
        assert!(matches!(store.open(KeyScope::Machine, ""), Err(Error::Config(_))));
    }
}
