//! Bearer-token cache on disk.
//!
//! One JSON document `{token, user_id}`, written atomically (temp file
//! in the same directory, then rename) so a crash never leaves a
//! half-written session behind.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: String,
}

impl Session {
    /// Read the cached session; absent or unreadable files yield an
    /// empty session.
    pub fn load(path: &Path) -> Self {
        std::fs::read(path)
            .ok()
            .and_then(|data| serde_json::from_slice(&data).ok())
            .unwrap_or_default()
    }

    /// Write the session atomically.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let data = serde_json::to_vec(self)?;
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = dir {
            std::fs::create_dir_all(dir)?;
        }

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::load(&dir.path().join("absent.json"));
        assert!(session.is_empty());
        assert!(session.user_id.is_empty());
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let session = Session {
            token: "tok".into(),
            user_id: "u1".into(),
        };
        session.save(&path).unwrap();

        let loaded = Session::load(&path);
        assert_eq!(loaded.token, "tok");
        assert_eq!(loaded.user_id, "u1");
        // No temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(Session::load(&path).is_empty());
    }
}
