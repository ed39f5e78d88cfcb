//! Worker registry file
//!
//! Plain text, one worker id per line. Written by the supervisor when it
//! starts and read by `status`. Nothing consults it for correctness.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRegistry {
    path: PathBuf,
}

impl WorkerRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file contents with `worker_ids`
    pub async fn write(&self, worker_ids: &[String]) -> io::Result<()> {
        let mut contents = String::new();
        for id in worker_ids {
            contents.push_str(id);
            contents.push('\n');
        }
        tokio::fs::write(&self.path, contents).await
    }

    /// Registered ids; empty when the file does not exist
    pub async fn read(&self) -> io::Result<Vec<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Delete the file; a missing file is not an error
    pub async fn remove(&self) -> io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::new(dir.path().join("workers"));
        assert!(registry.read().await.unwrap().is_empty());

        registry
            .write(&["w-1-0".to_string(), "w-1-1".to_string()])
            .await
            .unwrap();
        assert_eq!(registry.read().await.unwrap(), vec!["w-1-0", "w-1-1"]);

        registry.remove().await.unwrap();
        registry.remove().await.unwrap();
        assert!(registry.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers");
        tokio::fs::write(&path, "4101\n\n  4102 \n").await.unwrap();

        let registry = WorkerRegistry::new(&path);
        assert_eq!(registry.read().await.unwrap(), vec!["4101", "4102"]);
    }
}
