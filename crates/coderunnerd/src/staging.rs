//! Staging & Artifact Browser.
//!
//! Pre-start uploads land under `<root>/staging/<jobId>/` with a
//! collision-proof `<stem>_<uuid><ext>` name, then get materialized into the
//! job workspace once the pipeline reaches `staging`. Post-start browsing
//! (directories, file listing with mask filters, text content, binary
//! download) all resolve through `WorkspaceManager::resolve_inside`, so no
//! path here ever reaches the filesystem without the same safety check C2
//! applies everywhere else.

use std::path::{Path, PathBuf};

use coderunner_core::pathsafe::{self, MaskError};
use coderunner_core::wire::{DirectoryInfo, FileContentResponse, FileInfo};
use thiserror::Error;
use uuid::Uuid;

use crate::workspace::{WorkspaceError, WorkspaceManager};

#[derive(Debug, Error)]
pub enum StagingError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid mask: {0}")]
    Mask(#[from] MaskError),
    #[error("no staged file named '{0}' found")]
    NotFound(String),
    #[error("multiple staged files match '{0}'; resolve by exact stored name")]
    Ambiguous(String),
    #[error("file exceeds the maximum readable size for text content")]
    TooLarge,
    #[error("file is not valid UTF-8 text")]
    NotText,
    #[error("invalid type filter '{0}', expected 'files' or 'directories'")]
    InvalidType(String),
}

pub type Result<T> = std::result::Result<T, StagingError>;

/// Text content reads are capped ("size-limited... to avoid
/// loading arbitrarily large files into a JSON response").
const MAX_TEXT_CONTENT_BYTES: u64 = 5 * 1024 * 1024;

/// `uploadFile(jobId, originalFilename, bytes, overwrite) -> (storedFilename,
/// size, overwritten)` (Section 4.8, Section 6's `?overwrite=bool`). The
/// stored name is always a fresh `<stem>_<uuid><ext>`, so two uploads of the
/// same original filename never collide on disk; `overwrite=true` instead
/// controls whether an existing staged upload with the same original stem
/// and extension is deleted first, so a later `download`/`list` only ever
/// finds the newest one.
pub fn upload_file(
    workspace: &WorkspaceManager,
    job_id: &str,
    original_filename: &str,
    bytes: &[u8],
    overwrite: bool,
) -> Result<(String, u64, bool)> {
    pathsafe::validate_relative_path(original_filename).map_err(|e| {
        StagingError::Workspace(WorkspaceError::PathSafety(e))
    })?;
    let staging_dir = workspace.job_staging(job_id);
    std::fs::create_dir_all(&staging_dir)?;

    let mut overwrote = false;
    if overwrite {
        match resolve_staged_filename(workspace, job_id, original_filename) {
            Ok(existing) => {
                std::fs::remove_file(existing)?;
                overwrote = true;
            }
            Err(StagingError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let (stem, ext) = split_stem_ext(original_filename);
    let stored_name = format!("{stem}_{}{ext}", Uuid::now_v7());
    let dest = staging_dir.join(&stored_name);
    std::fs::write(&dest, bytes)?;
    Ok((stored_name, bytes.len() as u64, overwrote))
}

fn split_stem_ext(filename: &str) -> (&str, String) {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => (&filename[..idx], filename[idx..].to_string()),
        _ => (filename, String::new()),
    }
}

/// Resolve a client-supplied original filename (pre-upload-uniqueness name)
/// back to the single stored `<stem>_<uuid><ext>` file it matches. Errors
/// if zero or more than one staged file share that original stem+ext
/// ("ambiguous resolution is a validation error, not a guess").
pub fn resolve_staged_filename(
    workspace: &WorkspaceManager,
    job_id: &str,
    original_filename: &str,
) -> Result<PathBuf> {
    let staging_dir = workspace.job_staging(job_id);
    let (stem, ext) = split_stem_ext(original_filename);
    let prefix = format!("{stem}_");

    let mut matches = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&staging_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(&ext) {
                matches.push(entry.path());
            }
        }
    }
    match matches.len() {
        0 => Err(StagingError::NotFound(original_filename.to_string())),
        1 => Ok(matches.remove(0)),
        _ => Err(StagingError::Ambiguous(original_filename.to_string())),
    }
}

/// Image extensions accepted by `uploadImage` ("a whitelisted
/// set of image extensions, rejecting everything else up front").
const ALLOWED_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// `uploadImage(jobId, originalFilename, bytes) -> storedFilename` (Section
/// 4.8). Stored under `<staging>/<jobId>/images/` so teardown-free
/// materialization can move the whole subtree alongside ordinary uploads.
pub fn upload_image(
    workspace: &WorkspaceManager,
    job_id: &str,
    original_filename: &str,
    bytes: &[u8],
) -> Result<(String, String)> {
    pathsafe::validate_relative_path(original_filename)
        .map_err(|e| StagingError::Workspace(WorkspaceError::PathSafety(e)))?;
    let (stem, ext) = split_stem_ext(original_filename);
    let ext_lower = ext.trim_start_matches('.').to_ascii_lowercase();
    if !ALLOWED_IMAGE_EXTENSIONS.contains(&ext_lower.as_str()) {
        return Err(StagingError::Workspace(WorkspaceError::PathSafety(
            pathsafe::PathSafetyError::ReservedToken,
        )));
    }
    let images_dir = workspace.job_staging(job_id).join("images");
    std::fs::create_dir_all(&images_dir)?;
    let stored_name = format!("{stem}_{}{ext}", Uuid::now_v7());
    let dest = images_dir.join(&stored_name);
    std::fs::write(&dest, bytes)?;
    Ok((stored_name, dest.to_string_lossy().into_owned()))
}

/// Sorted list of materialized image paths for a job, for the Executor
/// Runner to pass as positional arguments.
pub fn image_paths(workspace: &WorkspaceManager, job_id: &str) -> Vec<PathBuf> {
    let images_dir = workspace.job_workspace(job_id).join("images");
    let Ok(entries) = std::fs::read_dir(&images_dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    paths
}

/// Move every staged upload into the job workspace root once the pipeline
/// reaches `staging`. Idempotent: a job with no staged
/// uploads is a no-op.
pub fn materialize_into_workspace(workspace: &WorkspaceManager, job_id: &str) -> Result<()> {
    let staging_dir = workspace.job_staging(job_id);
    if !staging_dir.exists() {
        return Ok(());
    }
    let job_workspace = workspace.job_workspace(job_id);
    std::fs::create_dir_all(&job_workspace)?;
    for entry in std::fs::read_dir(&staging_dir)? {
        let entry = entry?;
        let dest = job_workspace.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest)?;
        } else {
            std::fs::rename(entry.path(), dest)?;
        }
    }
    std::fs::remove_dir_all(&staging_dir)?;
    Ok(())
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dest = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest)?;
        } else {
            std::fs::rename(entry.path(), dest)?;
        }
    }
    Ok(())
}

/// `listDirectories(jobId, path)`.
pub fn list_directories(
    workspace: &WorkspaceManager,
    job_id: &str,
    relative_path: &str,
) -> Result<Vec<DirectoryInfo>> {
    let dir = workspace.resolve_inside(job_id, relative_path)?;
    let mut out = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let name = entry.file_name().to_string_lossy().into_owned();
            out.push(DirectoryInfo {
                path: join_display(relative_path, &name),
                name,
            });
        }
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Which kind of workspace entries `listFiles` returns
/// (`?type=files|directories`); defaults to `files`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Files,
    Directories,
}

impl EntryType {
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw {
            None | Some("files") => Ok(Self::Files),
            Some("directories") => Ok(Self::Directories),
            Some(other) => Err(StagingError::InvalidType(other.to_string())),
        }
    }
}

/// `listFiles(jobId, path, mask, type, depth)`. `mask` is a validated,
/// comma-separated glob list applied to both files and directories;
/// `type` restricts the returned entries to `files` (default) or
/// `directories`; `depth` recurses that many additional levels below
/// `path` (0 = the immediate directory only).
pub fn list_files(
    workspace: &WorkspaceManager,
    job_id: &str,
    relative_path: &str,
    mask: Option<&str>,
    entry_type: EntryType,
    depth: u32,
) -> Result<Vec<FileInfo>> {
    let patterns = mask.map(pathsafe::validate_mask).transpose()?;
    let mut out = Vec::new();
    collect_files(workspace, job_id, relative_path, &patterns, entry_type, depth, &mut out)?;
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

fn collect_files(
    workspace: &WorkspaceManager,
    job_id: &str,
    relative_path: &str,
    patterns: &Option<Vec<String>>,
    entry_type: EntryType,
    depth: u32,
    out: &mut Vec<FileInfo>,
) -> Result<()> {
    let dir = workspace.resolve_inside(job_id, relative_path)?;
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = metadata.is_dir();
        let child_path = join_display(relative_path, &name);
        let matches_mask = patterns
            .as_ref()
            .map_or(true, |p| pathsafe::mask_matches(p, &name));

        if is_dir {
            if entry_type == EntryType::Directories && matches_mask {
                out.push(FileInfo { path: child_path.clone(), name: name.clone(), size: 0, is_dir: true });
            }
            if depth > 0 {
                collect_files(workspace, job_id, &child_path, patterns, entry_type, depth - 1, out)?;
            }
        } else if entry_type == EntryType::Files && matches_mask {
            out.push(FileInfo { path: child_path, name, size: metadata.len(), is_dir: false });
        }
    }
    Ok(())
}

/// `readFileContent(jobId, path) -> text`. Rejects binary
/// content and anything above `MAX_TEXT_CONTENT_BYTES`.
pub fn read_file_content(
    workspace: &WorkspaceManager,
    job_id: &str,
    relative_path: &str,
) -> Result<FileContentResponse> {
    let path = workspace.resolve_inside(job_id, relative_path)?;
    let metadata = std::fs::metadata(&path)?;
    if metadata.len() > MAX_TEXT_CONTENT_BYTES {
        return Err(StagingError::TooLarge);
    }
    let bytes = std::fs::read(&path)?;
    let content = String::from_utf8(bytes).map_err(|_| StagingError::NotText)?;
    Ok(FileContentResponse {
        content,
        encoding: "utf-8".to_string(),
    })
}

/// `downloadFile(jobId, path) -> absolutePath`. Returns the
/// validated filesystem path for the HTTP layer to stream as a byte
/// response; does not read the file itself so large binaries are not
/// buffered twice. Falls back to the staging area (Section 6: "falls back
/// to staging if not yet in workspace") when the job has not started yet
/// and the path never made it into the workspace tree.
pub fn download_path(
    workspace: &WorkspaceManager,
    job_id: &str,
    relative_path: &str,
) -> Result<PathBuf> {
    if let Ok(path) = workspace.resolve_inside(job_id, relative_path) {
        if path.is_file() {
            return Ok(path);
        }
    }
    resolve_staged_filename(workspace, job_id, relative_path)
}

fn join_display(base: &str, name: &str) -> String {
    if base.is_empty() || base == "." {
        name.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderunner_core::config::CowMethod;

    fn workspace_with_job(tmp: &Path, job_id: &str) -> WorkspaceManager {
        let mgr = WorkspaceManager::new(tmp.to_path_buf(), CowMethod::Copy);
        std::fs::create_dir_all(mgr.job_workspace(job_id)).unwrap();
        mgr
    }

    #[test]
    fn upload_file_stores_under_stem_uuid_ext() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path().to_path_buf(), CowMethod::Copy);
        let (stored, size, overwritten) = upload_file(&mgr, "job-1", "notes.txt", b"hello", false).unwrap();
        assert!(!overwritten);
        assert!(stored.starts_with("notes_"));
        assert!(stored.ends_with(".txt"));
        assert_eq!(size, 5);
    }

    #[test]
    fn upload_file_with_overwrite_replaces_prior_staged_upload() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path().to_path_buf(), CowMethod::Copy);
        upload_file(&mgr, "job-1", "notes.txt", b"first", false).unwrap();
        let (stored, _, overwritten) = upload_file(&mgr, "job-1", "notes.txt", b"second", true).unwrap();
        assert!(overwritten);
        let remaining = resolve_staged_filename(&mgr, "job-1", "notes.txt").unwrap();
        assert_eq!(remaining.file_name().unwrap().to_string_lossy(), stored);
    }

    #[test]
    fn resolve_staged_filename_errors_on_ambiguous_match() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path().to_path_buf(), CowMethod::Copy);
        upload_file(&mgr, "job-1", "notes.txt", b"a", false).unwrap();
        upload_file(&mgr, "job-1", "notes.txt", b"b", false).unwrap();
        let err = resolve_staged_filename(&mgr, "job-1", "notes.txt").unwrap_err();
        assert!(matches!(err, StagingError::Ambiguous(_)));
    }

    #[test]
    fn materialize_moves_staged_files_into_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = workspace_with_job(tmp.path(), "job-1");
        let (stored, _, _) = upload_file(&mgr, "job-1", "notes.txt", b"hi", false).unwrap();
        materialize_into_workspace(&mgr, "job-1").unwrap();
        assert!(mgr.job_workspace("job-1").join(&stored).exists());
        assert!(!mgr.job_staging("job-1").exists());
    }

    #[test]
    fn list_files_filters_by_mask() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = workspace_with_job(tmp.path(), "job-1");
        std::fs::write(mgr.job_workspace("job-1").join("a.rs"), "x").unwrap();
        std::fs::write(mgr.job_workspace("job-1").join("b.md"), "x").unwrap();
        let files = list_files(&mgr, "job-1", "", Some("*.rs"), EntryType::Files, 0).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.rs");
    }

    #[test]
    fn list_files_recurses_with_depth() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = workspace_with_job(tmp.path(), "job-1");
        std::fs::create_dir_all(mgr.job_workspace("job-1").join("sub")).unwrap();
        std::fs::write(mgr.job_workspace("job-1").join("top.rs"), "x").unwrap();
        std::fs::write(mgr.job_workspace("job-1").join("sub/nested.rs"), "x").unwrap();

        let shallow = list_files(&mgr, "job-1", "", None, EntryType::Files, 0).unwrap();
        assert_eq!(shallow.len(), 1);

        let deep = list_files(&mgr, "job-1", "", None, EntryType::Files, 1).unwrap();
        assert_eq!(deep.len(), 2);
        assert!(deep.iter().any(|f| f.path == "sub/nested.rs"));
    }

    #[test]
    fn list_files_type_directories_returns_only_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = workspace_with_job(tmp.path(), "job-1");
        std::fs::create_dir_all(mgr.job_workspace("job-1").join("sub")).unwrap();
        std::fs::write(mgr.job_workspace("job-1").join("top.rs"), "x").unwrap();

        let dirs = list_files(&mgr, "job-1", "", None, EntryType::Directories, 0).unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].name, "sub");
        assert!(dirs[0].is_dir);
    }

    #[test]
    fn entry_type_rejects_unknown_value() {
        assert!(EntryType::parse(Some("bogus")).is_err());
        assert_eq!(EntryType::parse(None).unwrap(), EntryType::Files);
    }

    #[test]
    fn read_file_content_rejects_binary_data() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = workspace_with_job(tmp.path(), "job-1");
        std::fs::write(mgr.job_workspace("job-1").join("bin.dat"), [0xFF, 0xFE, 0x00]).unwrap();
        let err = read_file_content(&mgr, "job-1", "bin.dat").unwrap_err();
        assert!(matches!(err, StagingError::NotText));
    }

    #[test]
    fn upload_image_rejects_disallowed_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path().to_path_buf(), CowMethod::Copy);
        let err = upload_image(&mgr, "job-1", "payload.exe", b"x").unwrap_err();
        assert!(matches!(err, StagingError::Workspace(_)));
    }

    #[test]
    fn upload_image_then_materialize_is_visible_via_image_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = workspace_with_job(tmp.path(), "job-1");
        upload_image(&mgr, "job-1", "photo.png", b"fake-png-bytes").unwrap();
        materialize_into_workspace(&mgr, "job-1").unwrap();
        let images = image_paths(&mgr, "job-1");
        assert_eq!(images.len(), 1);
    }

    #[test]
    fn download_path_falls_back_to_staging_before_job_start() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path().to_path_buf(), CowMethod::Copy);
        upload_file(&mgr, "job-1", "notes.txt", b"hello", false).unwrap();
        let path = download_path(&mgr, "job-1", "notes.txt").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"hello");
    }

    #[test]
    fn download_path_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = workspace_with_job(tmp.path(), "job-1");
        assert!(download_path(&mgr, "job-1", "../../etc/passwd").is_err());
    }
}
