//! Project export
//!
//! Bundles the file table into a zip archive and builds the directory tree
//! shown by file browsers.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Seek, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::store::FileTable;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Write every file table entry into a zip archive
pub fn write_zip<W: Write + Seek>(files: &FileTable, writer: W) -> Result<W, ExportError> {
    let mut zip = ZipWriter::new(writer);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (path, content) in files {
        if !action_parser::is_relative_path(path) {
            log::warn!("Skipping {:?}: path leaves the project root", path);
            continue;
        }
        zip.start_file(path.trim_start_matches("./"), options)?;
        zip.write_all(content.as_bytes())?;
    }

    Ok(zip.finish()?)
}

/// Zip archive of the file table, in memory
pub fn zip_bytes(files: &FileTable) -> Result<Vec<u8>, ExportError> {
    Ok(write_zip(files, Cursor::new(Vec::new()))?.into_inner())
}

/// Write the zip archive of the file table to `path`
pub async fn save_zip(files: &FileTable, path: &Path) -> Result<(), ExportError> {
    let bytes = zip_bytes(files)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    log::info!("Exported {} files to {:?}", files.len(), path);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Directory,
    File,
}

/// Entry in the project file tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTreeNode {
    pub name: String,
    /// Path relative to the project root
    pub path: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileTreeNode>,
}

#[derive(Default)]
struct DirBuilder {
    dirs: BTreeMap<String, DirBuilder>,
    files: BTreeSet<String>,
}

impl DirBuilder {
    fn into_nodes(self, prefix: &str) -> Vec<FileTreeNode> {
        let join = |name: &str| {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", prefix, name)
            }
        };

        let mut nodes = Vec::with_capacity(self.dirs.len() + self.files.len());
        for (name, dir) in self.dirs {
            let path = join(&name);
            nodes.push(FileTreeNode {
                children: dir.into_nodes(&path),
                name,
                path,
                kind: NodeKind::Directory,
            });
        }
        for name in self.files {
            nodes.push(FileTreeNode {
                path: join(&name),
                name,
                kind: NodeKind::File,
                children: Vec::new(),
            });
        }
        nodes
    }
}

/// Directory tree of the file table. Directories come before files; both
/// are sorted by name.
pub fn file_tree(files: &FileTable) -> Vec<FileTreeNode> {
    let mut root = DirBuilder::default();
    for path in files.keys() {
        let segments: Vec<&str> = path
            .trim_start_matches("./")
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        let Some((file, dirs)) = segments.split_last() else {
            continue;
        };

        let mut node = &mut root;
        for dir in dirs {
            node = node.dirs.entry(dir.to_string()).or_default();
        }
        node.files.insert(file.to_string());
    }
    root.into_nodes("")
}
