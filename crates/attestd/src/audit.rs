use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

use crate::uploads::Upload;

/// Where an audit copy belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    Enroll,
    Proof,
}

impl AuditKind {
    fn dir_name(self) -> &'static str {
        match self {
            AuditKind::Enroll => "enroll",
            AuditKind::Proof => "proofs",
        }
    }
}

/// Write-only archive of accepted uploads. Copies are never read back.
#[derive(Debug, Clone)]
pub struct AuditLog {
    root: PathBuf,
}

impl AuditLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<kind>/<utc stamp>_<user>_<id>.<ext>`
    pub fn record(&self, kind: AuditKind, username: &str, upload: &Upload) -> io::Result<PathBuf> {
        let dir = self.root.join(kind.dir_name());
        fs::create_dir_all(&dir)?;
        let id = Uuid::new_v4().simple().to_string();
        let name = format!(
            "{}_{}_{}.{}",
            Utc::now().format("%Y%m%dT%H%M%S"),
            file_safe(username),
            &id[..8],
            upload.kind.extension()
        );
        let path = dir.join(name);
        fs::write(&path, &upload.bytes)?;
        Ok(path)
    }
}

/// Keep ASCII alphanumerics, `-` and `_`; everything else becomes `_`.
fn file_safe(username: &str) -> String {
    let cleaned: String = username
        .chars()
        .take(64)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "anonymous".to_string()
    } else {
        cleaned
    }
}
