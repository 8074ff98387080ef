//! Utility functions

use crate::error::{BuildError, BuildIoError};
use cfg_if::cfg_if;
use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

/// Canonicalize the path, returning an error if the file does not exist.
///
/// On windows this transforms the path to use `/` separators, same as the
/// generated `#include` lines handed to the compiler.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf, BuildIoError> {
    let path = path.as_ref();
    let res = dunce::canonicalize(path);
    #[cfg(windows)]
    let res = res.map(|p| {
        use path_slash::PathBufExt;
        PathBuf::from(p.to_slash_lossy().as_ref())
    });
    res.map_err(|err| BuildIoError::new(err, path))
}

/// Returns the same path but canonicalized, or unchanged if canonicalization fails.
pub fn canonicalized(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    canonicalize(&path).unwrap_or(path)
}

/// Rewrites `\` separators to `/` so module filenames compare and print the
/// same regardless of how the user spelled the import path.
pub fn normalize_separators(path: impl AsRef<Path>) -> PathBuf {
    PathBuf::from(path.as_ref().to_string_lossy().replace('\\', "/"))
}

/// Returns `path` relative to the process working directory if it lies under
/// it, otherwise the canonical absolute path. Keeps `file:line` diagnostics
/// short for project-local files.
pub fn relative_to_working_dir(path: impl AsRef<Path>) -> Result<PathBuf, BuildIoError> {
    let canonical = canonicalize(path)?;
    let cwd = std::env::current_dir()
        .and_then(dunce::canonicalize)
        .map_err(|err| BuildIoError::new(err, "."))?;
    match canonical.strip_prefix(&cwd) {
        Ok(relative) => Ok(relative.to_path_buf()),
        Err(_) => Ok(canonical),
    }
}

/// Derives the build-directory filename for an artifact generated from
/// `source`: separators are flattened to `_` so `a/b/c.cake` becomes
/// `a_b_c.cake` (plus `.{extension}` when one is given), keeping every
/// artifact of a build in a single flat directory.
pub fn flattened_output_path(
    output_dir: &Path,
    source: impl AsRef<Path>,
    extension: Option<&str>,
) -> Result<PathBuf, BuildError> {
    let source = source.as_ref().to_string_lossy().replace(['/', '\\', ':'], "_");
    if source.is_empty() {
        return Err(BuildError::msg("cannot derive output filename from empty source path"));
    }
    let file_name = match extension {
        Some(extension) => format!("{source}.{extension}"),
        None => source,
    };
    // Most filesystems cap name components at 255 bytes.
    if file_name.len() > 255 {
        return Err(BuildError::msg(format!("output filename too long: {file_name}")));
    }
    Ok(output_dir.join(file_name))
}

/// Last modification time, or `None` if the file cannot be inspected.
pub fn modified_time(path: impl AsRef<Path>) -> Option<SystemTime> {
    fs::metadata(path.as_ref()).and_then(|meta| meta.modified()).ok()
}

/// Whether `file` was modified more recently than `reference`. Errs on the
/// side of `true` when either file cannot be inspected, forcing a rebuild.
pub fn is_newer_than(file: impl AsRef<Path>, reference: impl AsRef<Path>) -> bool {
    match (modified_time(file), modified_time(reference)) {
        (Some(file), Some(reference)) => file > reference,
        _ => true,
    }
}

/// See [`fs::create_dir_all()`].
pub fn create_dir_all(dir: impl AsRef<Path>) -> Result<(), BuildError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|err| BuildError::io(err, dir))
}

pub fn copy_binary_file(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<(), BuildError> {
    let (from, to) = (from.as_ref(), to.as_ref());
    trace!("copying \"{}\" to \"{}\"", from.display(), to.display());
    fs::copy(from, to).map_err(|err| BuildError::io(err, from))?;
    Ok(())
}

cfg_if! {
    if #[cfg(unix)] {
        /// Marks the file executable.
        pub fn set_executable_permission(path: impl AsRef<Path>) -> Result<(), BuildError> {
            use std::os::unix::fs::PermissionsExt;
            let path = path.as_ref();
            let mut permissions = fs::metadata(path)
                .map_err(|err| BuildError::io(err, path))?
                .permissions();
            permissions.set_mode(permissions.mode() | 0o755);
            fs::set_permissions(path, permissions).map_err(|err| BuildError::io(err, path))
        }
    } else {
        /// Marks the file executable. No-op on platforms without permission bits.
        pub fn set_executable_permission(path: impl AsRef<Path>) -> Result<(), BuildError> {
            let _ = path.as_ref();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_backslash_separators() {
        assert_eq!(
            normalize_separators("runtime\\HotReloading.cake"),
            PathBuf::from("runtime/HotReloading.cake")
        );
        assert_eq!(normalize_separators("already/fine.cake"), PathBuf::from("already/fine.cake"));
    }

    #[test]
    fn flattens_source_paths_into_output_dir() {
        let out = Path::new("cakelisp_cache/default");
        assert_eq!(
            flattened_output_path(out, "a/b/c.cake", Some("cpp")).unwrap(),
            out.join("a_b_c.cake.cpp")
        );
        assert_eq!(
            flattened_output_path(out, "hello.cake", Some("hpp")).unwrap(),
            out.join("hello.cake.hpp")
        );
        // No extension keeps the flattened name as-is (cached executables).
        assert_eq!(flattened_output_path(out, "a.out", None).unwrap(), out.join("a.out"));
    }

    #[test]
    fn flattened_name_rejects_degenerate_input() {
        assert!(flattened_output_path(Path::new("out"), "", Some("cpp")).is_err());
        let long = "x/".repeat(200);
        assert!(flattened_output_path(Path::new("out"), long, Some("cpp")).is_err());
    }

    #[test]
    fn newer_than_errs_toward_rebuild() {
        assert!(is_newer_than("definitely-missing-file", "also-missing"));
    }
}
