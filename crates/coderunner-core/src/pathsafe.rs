//! Path-safety resolution (`resolveInside`) and mask validation.
//!
//! Component-by-component normalization, generalized into the strict "never
//! let a client path leave the workspace root" contract every artifact
//! browser endpoint depends on.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathSafetyError {
    #[error("path contains a parent-directory component")]
    ParentTraversal,
    #[error("path is absolute")]
    AbsolutePath,
    #[error("path contains a NUL byte")]
    NulByte,
    #[error("path contains a reserved token")]
    ReservedToken,
    #[error("resolved path escapes the workspace root")]
    Escape,
}

/// Windows device names and other tokens that must never appear as a path
/// component, regardless of platform, since workspaces may be inspected
/// cross-platform by tooling.
const RESERVED_TOKENS: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "LPT1", "LPT2", "LPT3",
];

/// Reject a client-supplied relative path before it ever touches the
/// filesystem: no `..`, no absolute prefix, no NULs, no reserved tokens.
/// This is the syntactic half of `resolveInside`; the caller must still
/// canonicalize and check the result is a descendant of the workspace root
/// (the semantic half, which needs the actual filesystem and so lives in
/// `coderunnerd::workspace`).
pub fn validate_relative_path(user_path: &str) -> Result<(), PathSafetyError> {
    if user_path.contains('\0') {
        return Err(PathSafetyError::NulByte);
    }
    let path = Path::new(user_path);
    if path.is_absolute() {
        return Err(PathSafetyError::AbsolutePath);
    }
    for component in path.components() {
        match component {
            Component::ParentDir => return Err(PathSafetyError::ParentTraversal),
            Component::Normal(part) => {
                let part_str = part.to_string_lossy();
                let stem = part_str.split('.').next().unwrap_or(&part_str);
                if RESERVED_TOKENS
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(stem))
                {
                    return Err(PathSafetyError::ReservedToken);
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {
                // RootDir/Prefix cannot occur for a non-absolute path; CurDir is harmless.
            }
        }
    }
    Ok(())
}

/// Confirm that `candidate` (already canonicalized) is `root` or a
/// descendant of it. The only path entry point into workspace I/O - used
/// after canonicalization resolves any symlinks, so a symlink pointing
/// outside the workspace is caught here even though its text path looked
/// safe.
pub fn assert_descendant(root: &Path, candidate: &Path) -> Result<(), PathSafetyError> {
    if candidate.starts_with(root) {
        Ok(())
    } else {
        Err(PathSafetyError::Escape)
    }
}

/// Join and fully validate a client path against a workspace root,
/// returning the syntactic join (not yet canonicalized - callers that need
/// to follow symlinks should canonicalize and call `assert_descendant`).
pub fn resolve_inside(root: &Path, user_path: &str) -> Result<PathBuf, PathSafetyError> {
    validate_relative_path(user_path)?;
    let joined = root.join(user_path);
    assert_descendant(root, &joined)?;
    Ok(joined)
}

// --- Mask validation ---

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MaskError {
    #[error("mask contains an illegal character")]
    IllegalCharacter,
    #[error("mask is empty")]
    Empty,
}

/// Validate a comma-separated glob mask before it is ever interpreted.
/// Masks are opaque tokens checked against a strict allow-list of
/// characters - never handed to shell or filesystem globbing unsanitized.
pub fn validate_mask(mask: &str) -> Result<Vec<String>, MaskError> {
    if mask.trim().is_empty() {
        return Err(MaskError::Empty);
    }
    let mut patterns = Vec::new();
    for raw in mask.split(',') {
        let pattern = raw.trim();
        if pattern.is_empty() {
            continue;
        }
        if pattern.contains("..")
            || pattern.contains('/')
            || pattern.contains('\\')
            || pattern.chars().any(|c| c.is_control())
        {
            return Err(MaskError::IllegalCharacter);
        }
        if !pattern
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | '.' | '-' | '_'))
        {
            return Err(MaskError::IllegalCharacter);
        }
        patterns.push(pattern.to_string());
    }
    if patterns.is_empty() {
        return Err(MaskError::Empty);
    }
    Ok(patterns)
}

/// Match a filename against a single validated mask pattern. `*` matches
/// everything; `*.ext` matches by suffix, case-insensitively; any other
/// pattern matches literally (case-sensitively).
pub fn pattern_matches(pattern: &str, filename: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(ext) = pattern.strip_prefix("*.") {
        return filename
            .rsplit('.')
            .next()
            .is_some_and(|actual| actual.eq_ignore_ascii_case(ext));
    }
    pattern == filename
}

/// True if `filename` matches any pattern in a validated mask.
pub fn mask_matches(patterns: &[String], filename: &str) -> bool {
    patterns.iter().any(|p| pattern_matches(p, filename))
}
