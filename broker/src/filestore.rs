//! Content-addressed blob store behind the `STORE`/`DELETE` commands.
//!
//! Files land under `<root>/<scope>/<name>` and are served back to workers by
//! whatever fronts the root directory. The path guard is a security boundary:
//! a `name` or `scope` that would normalize outside the scope directory is
//! refused outright.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use protocol::{CmdError, StoredFile};
use sha2::{Digest, Sha256};

pub struct DirStore {
    root: PathBuf,
    public_base: String,
}

impl DirStore {
    pub fn new(root: PathBuf, public_base: String) -> Self {
        Self {
            root,
            public_base: public_base.trim_end_matches('/').to_string(),
        }
    }

    /// Write `bytes` as `<scope>/<name>` and return its public url and digest.
    pub fn store(&self, bytes: &[u8], name: &str, scope: &str) -> Result<StoredFile> {
        let path = self.resolve(name, scope)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("create scope dir")?;
        }
        std::fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;

        let sha256 = hex::encode(Sha256::digest(bytes));
        Ok(StoredFile {
            url: format!("{}/{}/{}", self.public_base, scope, name),
            sha256,
        })
    }

    pub fn delete(&self, name: &str, scope: &str) -> Result<()> {
        let path = self.resolve(name, scope)?;
        std::fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        Ok(())
    }

    /// Map `(scope, name)` to a real path, refusing anything that would
    /// escape the scope directory.
    fn resolve(&self, name: &str, scope: &str) -> Result<PathBuf> {
        let scope_dir = self.root.join(checked_relative(scope)?);
        let path = scope_dir.join(checked_relative(name)?);
        Ok(path)
    }
}

/// Component-wise validation: relative, no `..`, no root/prefix components.
fn checked_relative(raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw);
    if raw.is_empty() {
        return Err(CmdError::forbidden("empty path").into());
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(
                    CmdError::forbidden(format!("path {raw:?} escapes its scope")).into(),
                );
            }
        }
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, DirStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::new(dir.path().to_path_buf(), "http://files.test/".into());
        (dir, store)
    }

    #[test]
    fn store_and_delete_round_trip() {
        let (dir, store) = store();
        let stored = store.store(b"frame data", "frame-0001.png", "job-7").unwrap();
        assert_eq!(stored.url, "http://files.test/job-7/frame-0001.png");
        assert_eq!(
            stored.sha256,
            hex::encode(Sha256::digest(b"frame data"))
        );
        assert_eq!(
            std::fs::read(dir.path().join("job-7/frame-0001.png")).unwrap(),
            b"frame data"
        );

        store.delete("frame-0001.png", "job-7").unwrap();
        assert!(!dir.path().join("job-7/frame-0001.png").exists());
    }

    #[test]
    fn escaping_names_are_refused() {
        let (_dir, store) = store();
        for name in ["../escape", "a/../../escape", "/etc/passwd", "..", ""] {
            let err = store.store(b"x", name, "scope").unwrap_err();
            let kind = err.downcast_ref::<CmdError>().unwrap().kind;
            assert_eq!(kind, protocol::ErrorKind::Forbidden, "name {name:?}");
        }
    }

    #[test]
    fn escaping_scopes_are_refused() {
        let (_dir, store) = store();
        assert!(store.store(b"x", "ok.txt", "../elsewhere").is_err());
        assert!(store.delete("ok.txt", "/abs").is_err());
    }

    #[test]
    fn nested_names_inside_scope_are_fine() {
        let (dir, store) = store();
        store.store(b"x", "sub/dir/out.bin", "job-1").unwrap();
        assert!(dir.path().join("job-1/sub/dir/out.bin").exists());
    }
}
