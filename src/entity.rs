//! Send items: things that can be packed into an upload archive

use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::file_types;

/// Largest image passed through unchanged as an ask icon.
const MAX_ICON_BYTES: u64 = 512 * 1024;

/// One item of an outbound transfer. Owned by the caller; the core only reads it.
pub trait Entity: Send + Sync {
    /// Display name (file name with extension).
    fn name(&self) -> &str;
    /// Archive-relative path, `./name` or `./dir/name`.
    fn path(&self) -> &str;
    fn mime_type(&self) -> &str;
    /// Byte length, `None` when not known before reading.
    fn size(&self) -> Option<u64>;
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
    /// Icon bytes for the ask preview. Only consulted for `image/*` entities.
    fn thumbnail(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Archive path for a top-level item.
pub fn archive_path(name: &str) -> String {
    format!("./{name}")
}

pub struct FileEntity {
    file: PathBuf,
    name: String,
    path: String,
    mime: String,
    size: u64,
}

impl FileEntity {
    pub fn new(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("unusable file name: {}", file.display()))?
            .to_string();
        let path = archive_path(&name);
        Self::with_archive_path(file, path)
    }

    pub fn with_archive_path(file: impl Into<PathBuf>, path: String) -> Result<Self> {
        let file = file.into();
        let md = fs::metadata(&file).with_context(|| format!("stat {}", file.display()))?;
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        let mime = file_types::mime_for_name(&name).to_string();
        Ok(Self { file, name, path, mime, size: md.len() })
    }

    pub fn file(&self) -> &Path {
        &self.file
    }
}

impl Entity for FileEntity {
    fn name(&self) -> &str {
        &self.name
    }
    fn path(&self) -> &str {
        &self.path
    }
    fn mime_type(&self) -> &str {
        &self.mime
    }
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(&self.file)?))
    }
    fn thumbnail(&self) -> Option<Vec<u8>> {
        // Only JPEG data is a valid icon as-is.
        if self.mime != "image/jpeg" || self.size > MAX_ICON_BYTES {
            return None;
        }
        fs::read(&self.file).ok()
    }
}

/// In-memory item. `unsized` hides the length, as a streamed source would.
pub struct MemoryEntity {
    name: String,
    path: String,
    mime: String,
    data: Vec<u8>,
    sized: bool,
    icon: Option<Vec<u8>>,
}

impl MemoryEntity {
    pub fn new(name: &str, mime: &str, data: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            path: archive_path(name),
            mime: mime.to_string(),
            data,
            sized: true,
            icon: None,
        }
    }

    pub fn r#unsized(mut self) -> Self {
        self.sized = false;
        self
    }

    pub fn with_icon(mut self, icon: Vec<u8>) -> Self {
        self.icon = Some(icon);
        self
    }
}

impl Entity for MemoryEntity {
    fn name(&self) -> &str {
        &self.name
    }
    fn path(&self) -> &str {
        &self.path
    }
    fn mime_type(&self) -> &str {
        &self.mime
    }
    fn size(&self) -> Option<u64> {
        self.sized.then_some(self.data.len() as u64)
    }
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }
    fn thumbnail(&self) -> Option<Vec<u8>> {
        self.icon.clone()
    }
}

/// Expand command-line paths into entities. Directories contribute their regular files
/// under `./<dir>/<relative>`; directory records themselves are never emitted.
pub fn entities_from_paths(paths: &[PathBuf]) -> Result<Vec<Arc<dyn Entity>>> {
    let mut out: Vec<Arc<dyn Entity>> = Vec::new();
    for p in paths {
        let md = fs::metadata(p).with_context(|| format!("stat {}", p.display()))?;
        if md.is_file() {
            out.push(Arc::new(FileEntity::new(p)?));
            continue;
        }
        let root_name = p
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("unusable directory name: {}", p.display()))?;
        for entry in WalkDir::new(p).sort_by_file_name() {
            let entry = entry.with_context(|| format!("walk {}", p.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(p).context("strip walk prefix")?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let path = format!("./{root_name}/{rel}");
            out.push(Arc::new(FileEntity::with_archive_path(entry.path(), path)?));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_entity_describes_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let f = dir.path().join("photo.PNG");
        fs::write(&f, b"12345")?;
        let e = FileEntity::new(&f)?;
        assert_eq!(e.name(), "photo.PNG");
        assert_eq!(e.path(), "./photo.PNG");
        assert_eq!(e.mime_type(), "image/png");
        assert_eq!(e.size(), Some(5));
        let mut s = String::new();
        e.open()?.read_to_string(&mut s)?;
        assert_eq!(s, "12345");
        assert!(e.thumbnail().is_none());
        Ok(())
    }

    #[test]
    fn memory_entity_can_hide_size() {
        let e = MemoryEntity::new("a.txt", "text/plain", vec![1, 2, 3]);
        assert_eq!(e.size(), Some(3));
        let e = e.r#unsized();
        assert_eq!(e.size(), None);
    }

    #[test]
    fn directories_expand_to_nested_paths() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("album");
        fs::create_dir_all(root.join("sub"))?;
        fs::write(root.join("b.txt"), b"b")?;
        fs::write(root.join("sub/c.txt"), b"cc")?;
        let single = dir.path().join("a.txt");
        fs::write(&single, b"a")?;

        let es = entities_from_paths(&[single, root])?;
        let paths: Vec<_> = es.iter().map(|e| e.path().to_string()).collect();
        assert_eq!(paths, vec!["./a.txt", "./album/b.txt", "./album/sub/c.txt"]);
        assert_eq!(es[2].name(), "c.txt");
        assert_eq!(es[2].size(), Some(2));
        Ok(())
    }
}
