//! Local directory source.
//!
//! Walks a tenant's root with `walkdir`, filtering relative paths through
//! include/exclude globs. The document id is the path relative to the root
//! with `/` separators; the revision id is derived from modification time
//! and size, so touching a file starts a new revision.

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::connector::{DocumentSelector, DocumentSource, SourceError, SourceFile};
use crate::extract::mime_for_path;

pub struct FilesystemSource {
    root: PathBuf,
    include_globs: Vec<String>,
    exclude_globs: Vec<String>,
    max_file_bytes: u64,
}

impl FilesystemSource {
    pub fn new(
        root: PathBuf,
        include_globs: Vec<String>,
        exclude_globs: Vec<String>,
        max_file_bytes: u64,
    ) -> Self {
        Self {
            root,
            include_globs,
            exclude_globs,
            max_file_bytes,
        }
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, SourceError> {
        let rel = Path::new(relative);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SourceError::PermissionDenied(format!(
                "path escapes source root: {}",
                relative
            )));
        }
        Ok(self.root.join(rel))
    }

    fn scan(&self, selector: &DocumentSelector) -> Result<Vec<SourceFile>, SourceError> {
        if !self.root.exists() {
            return Err(SourceError::NotFound(format!(
                "filesystem root does not exist: {}",
                self.root.display()
            )));
        }

        let include_set = build_globset(&self.include_globs)?;
        let mut default_excludes = vec!["**/.git/**".to_string(), "**/.*".to_string()];
        default_excludes.extend(self.exclude_globs.clone());
        let exclude_set = build_globset(&default_excludes)?;

        let start = match selector {
            DocumentSelector::Folder(folder) => self.resolve(folder)?,
            _ => self.root.clone(),
        };
        let wanted: Option<std::collections::HashSet<&str>> = match selector {
            DocumentSelector::Files(ids) => Some(ids.iter().map(String::as_str).collect()),
            _ => None,
        };

        let mut files = Vec::new();
        for entry in WalkDir::new(&start) {
            let entry = entry.map_err(|e| SourceError::Other(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                continue;
            }
            if let Some(wanted) = &wanted {
                if !wanted.contains(rel_str.as_str()) {
                    continue;
                }
            }

            files.push(describe(path, rel_str)?);
        }

        files.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(files)
    }
}

fn describe(path: &Path, document_id: String) -> Result<SourceFile, SourceError> {
    let metadata = std::fs::metadata(path).map_err(io_error)?;
    let modified_ns = metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let revision = Sha256::digest(format!("{}:{}", modified_ns, metadata.len()).as_bytes());

    let display_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| document_id.clone());

    Ok(SourceFile {
        mime_type: mime_for_path(path).to_string(),
        display_name,
        revision_id: hex::encode(&revision[..8]),
        web_url: Some(format!("file://{}", path.display())),
        size_bytes: Some(metadata.len()),
        document_id,
    })
}

fn io_error(e: std::io::Error) -> SourceError {
    match e.kind() {
        std::io::ErrorKind::NotFound => SourceError::NotFound(e.to_string()),
        std::io::ErrorKind::PermissionDenied => SourceError::PermissionDenied(e.to_string()),
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut => {
            SourceError::Transient(e.to_string())
        }
        _ => SourceError::Other(e.to_string()),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, SourceError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|e| SourceError::Other(e.to_string()))?);
    }
    builder
        .build()
        .map_err(|e| SourceError::Other(e.to_string()))
}

#[async_trait]
impl DocumentSource for FilesystemSource {
    fn kind(&self) -> &'static str {
        "filesystem"
    }

    async fn list_files(&self, selector: &DocumentSelector) -> Result<Vec<SourceFile>, SourceError> {
        self.scan(selector)
    }

    async fn download(&self, file: &SourceFile) -> Result<Vec<u8>, SourceError> {
        let path = self.resolve(&file.document_id)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(io_error)?;
        if metadata.len() > self.max_file_bytes {
            return Err(SourceError::TooLarge {
                size: metadata.len(),
                limit: self.max_file_bytes,
            });
        }
        tokio::fs::read(&path).await.map_err(io_error)
    }
}
