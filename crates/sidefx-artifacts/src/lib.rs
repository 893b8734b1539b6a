//! Create-only artifact sink.
//!
//! The side effect's proof-of-execution is a file that can be created exactly
//! once per business key. `create` is the only operation; there is no update
//! or delete, because a side effect, once performed, is never un-performed.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Artifacts live under `{root}/tickets/`, matching the original worker's
/// `ticket_{business_key}.json` layout.
const TICKETS_SUBDIR: &str = "tickets";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactOutcome {
    Created,
    AlreadyExisted,
}

#[derive(Clone)]
pub struct ArtifactSink {
    root: PathBuf,
}

impl ArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(TICKETS_SUBDIR))
            .with_context(|| format!("create artifacts dir failed: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn path_for(&self, business_key: &str) -> PathBuf {
        self.root
            .join(TICKETS_SUBDIR)
            .join(format!("ticket_{}.json", sanitize(business_key)))
    }

    /// Attempt to create the artifact for `business_key`, writing `contents`.
    ///
    /// `create_new(true)` is the exclusivity primitive: the open call itself
    /// fails with `AlreadyExists` if another attempt won the race, so there is
    /// no check-then-write gap to close.
    pub fn create(&self, business_key: &str, contents: &[u8]) -> Result<(ArtifactOutcome, PathBuf)> {
        let path = self.path_for(business_key);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(contents)
                    .with_context(|| format!("write artifact failed: {}", path.display()))?;
                file.sync_all().ok();
                Ok((ArtifactOutcome::Created, path))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok((ArtifactOutcome::AlreadyExisted, path)),
            Err(e) => Err(e).with_context(|| format!("open artifact failed: {}", path.display())),
        }
    }

    pub fn exists(&self, business_key: &str) -> bool {
        self.path_for(business_key).exists()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Debug readout: artifact file names and sizes, most-recently-created
    /// last-on-disk ordering isn't tracked, so this returns lexical order.
    pub fn list(&self) -> Result<Vec<(String, u64)>> {
        let tickets_dir = self.root.join(TICKETS_SUBDIR);
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&tickets_dir)
            .with_context(|| format!("read artifacts dir failed: {}", tickets_dir.display()))?
        {
            let entry = entry.context("read artifacts dir entry failed")?;
            let meta = entry.metadata().context("read artifact metadata failed")?;
            if meta.is_file() {
                out.push((entry.file_name().to_string_lossy().into_owned(), meta.len()));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

fn sanitize(business_key: &str) -> String {
    business_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

pub fn ensure_artifacts_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("create artifacts dir failed: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_succeeds_once_then_reports_already_existed() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ArtifactSink::new(dir.path()).unwrap();

        let (outcome, path) = sink.create("order-1", b"receipt body").unwrap();
        assert_eq!(outcome, ArtifactOutcome::Created);
        assert!(path.exists());

        let (outcome2, path2) = sink.create("order-1", b"different body").unwrap();
        assert_eq!(outcome2, ArtifactOutcome::AlreadyExisted);
        assert_eq!(path, path2);

        // The second create must not have clobbered the first write.
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "receipt body");
    }

    #[test]
    fn sanitize_strips_path_separators() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ArtifactSink::new(dir.path()).unwrap();
        let path = sink.path_for("../../etc/passwd");
        assert!(path.starts_with(dir.path()));
        assert!(!path.to_string_lossy().contains(".."));
    }

    #[test]
    fn exists_reflects_create_state() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ArtifactSink::new(dir.path()).unwrap();
        assert!(!sink.exists("order-2"));
        sink.create("order-2", b"x").unwrap();
        assert!(sink.exists("order-2"));
    }

    #[test]
    fn list_reflects_created_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ArtifactSink::new(dir.path()).unwrap();
        sink.create("order-a", b"aaa").unwrap();
        sink.create("order-b", b"bb").unwrap();

        let items = sink.list().unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().any(|(name, bytes)| name.contains("order-a") && *bytes == 3));
        assert!(items.iter().any(|(name, bytes)| name.contains("order-b") && *bytes == 2));
    }
}
