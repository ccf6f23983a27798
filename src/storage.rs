#![forbid(unsafe_code)]

//! The storage directory: the only state the service keeps.
//!
//! Downloads land in a private staging directory first and are then moved to
//! their final, sanitized and de-duplicated name. Reads are confined to the
//! directory by a lexical containment check, and cleanup removes the regular
//! files directly inside it.

use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};

use parking_lot::Mutex;
use tempfile::TempDir;

use crate::error::{ServiceError, ServiceResult};

const STAGING_PREFIX: &str = ".incoming-";
const FALLBACK_STEM: &str = "video";
const UNSAFE_CHARS: [char; 9] = ['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

pub struct Storage {
    root: PathBuf,
    // Serializes "pick a free name" + "rename into place" within the process.
    reserve: Mutex<()>,
}

impl Storage {
    /// Opens the directory, creating it when absent. The root is stored in
    /// absolute, normalized form so containment checks compare like with like.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let root = normalize(&std::path::absolute(dir)?);
        Ok(Self {
            root,
            reserve: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fresh per-request directory inside the root. Removed when dropped.
    pub fn staging_dir(&self) -> io::Result<TempDir> {
        tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.root)
    }

    /// Moves a finished download into the root under a sanitized name that
    /// no existing file uses, and returns that name.
    pub fn persist(&self, downloaded: &Path) -> io::Result<String> {
        let original = downloaded
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no file name", downloaded.display()),
                )
            })?;
        let sanitized = self.root.join(sanitize_filename(&original));

        let _guard = self.reserve.lock();
        let target = unique_path(&sanitized);
        fs::rename(downloaded, &target)?;

        let name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        tracing::info!(from = %original, to = %name, "stored download");
        Ok(name)
    }

    /// Maps a requested name to a path strictly inside the root.
    pub fn resolve(&self, file_name: &str) -> ServiceResult<PathBuf> {
        let candidate = normalize(&self.root.join(file_name));
        if candidate == self.root || !candidate.starts_with(&self.root) {
            return Err(ServiceError::forbidden("Invalid file path"));
        }
        Ok(candidate)
    }

    /// Deletes every regular file directly inside the root and returns how
    /// many were removed. Stops at the first failure; files already deleted
    /// stay deleted.
    pub async fn clear(&self) -> ServiceResult<usize> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|err| {
            ServiceError::filesystem(format!("Failed to read storage directory: {err}"))
        })?;
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    return Err(ServiceError::filesystem(format!(
                        "Failed to read storage directory: {err}"
                    )));
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            let result = match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => tokio::fs::remove_file(&path).await.map(|_| true),
                Ok(_) => Ok(false),
                // Vanished between listing and stat.
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(err) => Err(err),
            };
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => {
                    return Err(ServiceError::filesystem(format!(
                        "Failed to delete {name}: {err}"
                    )));
                }
            }
        }
        tracing::info!(removed, root = %self.root.display(), "storage cleared");
        Ok(removed)
    }
}

/// Strips `\/*?:"<>|` and turns spaces into underscores.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !UNSAFE_CHARS.contains(c))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        return FALLBACK_STEM.to_string();
    }
    if cleaned.starts_with('.') {
        return format!("{FALLBACK_STEM}{cleaned}");
    }
    cleaned
}

/// Appends `_1`, `_2`, ... before the extension until the path is free.
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let mut counter = 1u32;
    loop {
        let candidate = path.with_file_name(format!("{stem}_{counter}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Resolves `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open_temp() -> (TempDir, Storage) {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("downloads")).unwrap();
        (dir, storage)
    }

    fn stage(storage: &Storage, name: &str) -> (TempDir, PathBuf) {
        let staging = storage.staging_dir().unwrap();
        let path = staging.path().join(name);
        fs::write(&path, b"data").unwrap();
        (staging, path)
    }

    #[test]
    fn sanitize_strips_unsafe_characters() {
        assert_eq!(
            sanitize_filename("My Video: Part 1?.mp4"),
            "My_Video_Part_1.mp4"
        );
        assert_eq!(
            sanitize_filename(r#"a\b/c*d?e:f"g<h>i|j.mp4"#),
            "abcdefghij.mp4"
        );
        assert_eq!(sanitize_filename("plain.mp4"), "plain.mp4");
    }

    #[test]
    fn sanitize_never_yields_hidden_or_empty_names() {
        assert_eq!(sanitize_filename("???"), "video");
        assert_eq!(sanitize_filename(".."), "video");
        assert_eq!(sanitize_filename("?.mp4"), "video.mp4");
    }

    #[test]
    fn unique_path_counts_up() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("video.mp4");
        assert_eq!(unique_path(&base), base);

        fs::write(&base, b"1").unwrap();
        let second = unique_path(&base);
        assert_eq!(second, dir.path().join("video_1.mp4"));

        fs::write(&second, b"2").unwrap();
        assert_eq!(unique_path(&base), dir.path().join("video_2.mp4"));
    }

    #[test]
    fn unique_path_without_extension() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("clip");
        fs::write(&base, b"1").unwrap();
        assert_eq!(unique_path(&base), dir.path().join("clip_1"));
    }

    #[test]
    fn open_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested").join("store");
        let storage = Storage::open(&target).unwrap();
        assert!(target.is_dir());
        assert!(storage.root().is_absolute());
    }

    #[test]
    fn persist_sanitizes_and_deduplicates() {
        let (_dir, storage) = open_temp();

        let (_s1, first) = stage(&storage, "My Video: Part 1?.mp4");
        assert_eq!(storage.persist(&first).unwrap(), "My_Video_Part_1.mp4");

        let (_s2, second) = stage(&storage, "My Video: Part 1?.mp4");
        assert_eq!(storage.persist(&second).unwrap(), "My_Video_Part_1_1.mp4");

        let (_s3, third) = stage(&storage, "My Video: Part 1?.mp4");
        assert_eq!(storage.persist(&third).unwrap(), "My_Video_Part_1_2.mp4");

        assert!(storage.root().join("My_Video_Part_1_2.mp4").is_file());
        assert!(!third.exists());
    }

    #[test]
    fn concurrent_persists_never_collide() {
        let (_dir, storage) = open_temp();
        let storage = Arc::new(storage);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let storage = Arc::clone(&storage);
                std::thread::spawn(move || {
                    let (_staging, path) = stage(&storage, "same title.mp4");
                    storage.persist(&path).unwrap()
                })
            })
            .collect();

        let mut names: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn resolve_accepts_plain_names() {
        let (_dir, storage) = open_temp();
        let path = storage.resolve("clip.mp4").unwrap();
        assert_eq!(path, storage.root().join("clip.mp4"));
    }

    #[test]
    fn resolve_rejects_escapes() {
        let (_dir, storage) = open_temp();
        for name in ["../../etc/passwd", "..", ".", "/etc/passwd", "a/../../b"] {
            let err = storage.resolve(name).unwrap_err();
            assert!(matches!(err, ServiceError::Forbidden(_)), "{name}");
        }
    }

    #[test]
    fn resolve_rejects_sibling_with_shared_prefix() {
        let (_dir, storage) = open_temp();
        let err = storage.resolve("../downloads_evil/x.mp4").unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn clear_on_empty_directory_succeeds() {
        let (_dir, storage) = open_temp();
        assert_eq!(storage.clear().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clear_removes_files_but_keeps_directories() {
        let (_dir, storage) = open_temp();
        fs::write(storage.root().join("a.mp4"), b"a").unwrap();
        fs::write(storage.root().join("b.mp4"), b"b").unwrap();
        fs::create_dir(storage.root().join("keep")).unwrap();

        assert_eq!(storage.clear().await.unwrap(), 2);
        assert!(!storage.root().join("a.mp4").exists());
        assert!(storage.root().join("keep").is_dir());
    }
}
