//! On-disk format version marker.
//!
//! Each state root carries a `.fisk-version` file. When the recorded version
//! differs from the running one the whole root is destroyed and recreated;
//! there is no migration.

use std::fs;
use std::io;
use std::path::Path;

/// Name of the marker file inside a state root.
pub const VERSION_FILE: &str = ".fisk-version";

/// What [`ensure_version`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    /// The root did not exist or was empty.
    Created,
    /// The marker matched.
    Current,
    /// The root held another version (or no marker) and was wiped.
    Reset { previous: Option<String> },
}

/// Make sure `root` exists and is stamped with `version`.
pub fn ensure_version(root: &Path, version: &str) -> io::Result<VersionCheck> {
    let marker = root.join(VERSION_FILE);

    let previous = match fs::read_to_string(&marker) {
        Ok(text) => Some(text.trim().to_string()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    if previous.as_deref() == Some(version) {
        return Ok(VersionCheck::Current);
    }

    let populated = match fs::read_dir(root) {
        Ok(mut entries) => entries.next().is_some(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => return Err(e),
    };

    let check = if populated {
        tracing::warn!(
            root = %root.display(),
            previous = previous.as_deref().unwrap_or("<none>"),
            current = version,
            "state root version mismatch, wiping"
        );
        fs::remove_dir_all(root)?;
        VersionCheck::Reset { previous }
    } else {
        VersionCheck::Created
    };

    fs::create_dir_all(root)?;
    fs::write(&marker, format!("{}\n", version))?;
    Ok(check)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_root_is_stamped() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("state");

        assert_eq!(ensure_version(&root, "3").unwrap(), VersionCheck::Created);
        assert_eq!(fs::read_to_string(root.join(VERSION_FILE)).unwrap(), "3\n");
        assert_eq!(ensure_version(&root, "3").unwrap(), VersionCheck::Current);
    }

    #[test]
    fn test_mismatch_wipes_contents() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("state");
        ensure_version(&root, "1").unwrap();
        fs::write(root.join("old.env"), b"data").unwrap();

        let check = ensure_version(&root, "2").unwrap();
        assert_eq!(
            check,
            VersionCheck::Reset {
                previous: Some("1".to_string())
            }
        );
        assert!(!root.join("old.env").exists());
        assert_eq!(ensure_version(&root, "2").unwrap(), VersionCheck::Current);
    }

    #[test]
    fn test_unmarked_content_is_wiped() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("state");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("stray"), b"?").unwrap();

        assert_eq!(
            ensure_version(&root, "1").unwrap(),
            VersionCheck::Reset { previous: None }
        );
        assert!(!root.join("stray").exists());
    }
}
