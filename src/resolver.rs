//! Resolution of the headers a source file transitively includes.
//!
//! The builder needs an upper bound on "when did anything this object
//! depends on last change". Includes are discovered textually, resolved
//! against the search directories the compiler itself will be given, and
//! walked transitively. Headers that cannot be located are assumed to be
//! system headers and skipped; they do not invalidate caches.

use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use crate::utils;

/// Matches `#include "..."` and `#include <...>` lines with the groups
/// "quoted" and "angled". Angle-bracket includes are scanned too: the
/// underlying compiler is told the same search directories, so they may name
/// local headers as well, but only the quoted form resolves against the
/// including file's own directory.
static RE_INCLUDE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*#\s*include\s*(?:"(?P<quoted>[^"]+)"|<(?P<angled>[^>]+)>)"#).unwrap()
});

/// Per-build memo of every resolved file to the most recent modification
/// time in its include subtree. Shared across all objects of one run, so
/// each file is read and scanned at most once; re-entering a file that is
/// currently being scanned (an include cycle) observes its own mtime and
/// terminates.
#[derive(Debug, Default)]
pub struct ModificationCache {
    subtree_mtimes: HashMap<PathBuf, Option<SystemTime>>,
}

impl ModificationCache {
    /// Number of files whose modification times were inspected.
    pub fn len(&self) -> usize {
        self.subtree_mtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtree_mtimes.is_empty()
    }
}

/// Returns the maximum modification time among `source` and every local
/// header reachable from it through the given search directories, or `None`
/// if the source itself cannot be inspected.
pub fn most_recent_include_modification(
    source: impl AsRef<Path>,
    search_dirs: &[PathBuf],
    cache: &mut ModificationCache,
) -> Option<SystemTime> {
    scan_file(source.as_ref(), search_dirs, cache)
}

/// Whether `object` is at least as new as everything `source` transitively
/// includes. A missing or uninspectable object is never fresh.
pub fn object_is_fresh(
    object: impl AsRef<Path>,
    source: impl AsRef<Path>,
    search_dirs: &[PathBuf],
    cache: &mut ModificationCache,
) -> bool {
    let Some(object_mtime) = utils::modified_time(object.as_ref()) else {
        return false;
    };
    match most_recent_include_modification(source, search_dirs, cache) {
        Some(newest_dependency) => object_mtime >= newest_dependency,
        None => false,
    }
}

fn scan_file(
    file: &Path,
    search_dirs: &[PathBuf],
    cache: &mut ModificationCache,
) -> Option<SystemTime> {
    if let Some(memoized) = cache.subtree_mtimes.get(file) {
        return *memoized;
    }

    let own_mtime = utils::modified_time(file);
    // Seed the entry before descending so include cycles terminate.
    cache.subtree_mtimes.insert(file.to_path_buf(), own_mtime);
    let mut own_mtime = own_mtime?;

    let contents = match fs::read_to_string(file) {
        Ok(contents) => contents,
        Err(err) => {
            trace!("could not scan \"{}\" for includes: {err}", file.display());
            return Some(own_mtime);
        }
    };

    for line in contents.lines() {
        let Some(captures) = RE_INCLUDE.captures(line) else { continue };
        let (include, quoted) = match (captures.name("quoted"), captures.name("angled")) {
            (Some(path), _) => (path.as_str(), true),
            (_, Some(path)) => (path.as_str(), false),
            (None, None) => continue,
        };
        let Some(resolved) = resolve_include(include, quoted, file, search_dirs) else {
            // Not on the search path: a system header, assumed stable.
            continue;
        };
        if let Some(subtree) = scan_file(&resolved, search_dirs, cache) {
            own_mtime = own_mtime.max(subtree);
        }
    }

    cache.subtree_mtimes.insert(file.to_path_buf(), Some(own_mtime));
    Some(own_mtime)
}

/// Quoted includes try the including file's own directory first, the way the
/// compiler resolves them, then the supplied search directories.
/// Angle-bracket includes are searched only in the supplied directories.
fn resolve_include(
    include: &str,
    quoted: bool,
    including_file: &Path,
    search_dirs: &[PathBuf],
) -> Option<PathBuf> {
    let local_dir = quoted.then(|| including_file.parent().map(Path::to_path_buf)).flatten();
    local_dir
        .into_iter()
        .chain(search_dirs.iter().cloned())
        .map(|dir| dir.join(include))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn write_file(path: &Path, contents: &str) {
        File::create(path).unwrap().write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn scans_transitive_includes_in_both_forms() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_file(&root.join("main.cpp"), "#include \"a.hpp\"\nint main() {}\n");
        write_file(&root.join("a.hpp"), "#include <b.hpp>\n");
        write_file(&root.join("b.hpp"), "// leaf\n");

        let mut cache = ModificationCache::default();
        let newest = most_recent_include_modification(
            root.join("main.cpp"),
            &[root.to_path_buf()],
            &mut cache,
        );
        assert!(newest.is_some());
        // main.cpp, a.hpp, b.hpp all inspected exactly once.
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn unlocatable_includes_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_file(&root.join("main.cpp"), "#include <vector>\n#include \"missing.hpp\"\n");

        let mut cache = ModificationCache::default();
        let newest = most_recent_include_modification(
            root.join("main.cpp"),
            &[root.to_path_buf()],
            &mut cache,
        );
        assert_eq!(newest, utils::modified_time(root.join("main.cpp")));
    }

    #[test]
    fn angle_includes_ignore_the_including_files_directory() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local");
        std::fs::create_dir_all(&local).unwrap();
        write_file(&local.join("angled.cpp"), "#include <near.hpp>\n");
        write_file(&local.join("quoted.cpp"), "#include \"near.hpp\"\n");
        write_file(&local.join("near.hpp"), "// only next to the sources\n");

        // `local` is not a search dir, so the angle-bracket form stays
        // unresolved even though the header sits next to the source.
        let search_dirs = [dir.path().to_path_buf()];
        let mut cache = ModificationCache::default();
        most_recent_include_modification(local.join("angled.cpp"), &search_dirs, &mut cache);
        assert_eq!(cache.len(), 1);

        // The quoted form resolves through the including file's directory.
        let mut cache = ModificationCache::default();
        most_recent_include_modification(local.join("quoted.cpp"), &search_dirs, &mut cache);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn include_cycles_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_file(&root.join("a.hpp"), "#include \"b.hpp\"\n");
        write_file(&root.join("b.hpp"), "#include \"a.hpp\"\n");

        let mut cache = ModificationCache::default();
        let newest =
            most_recent_include_modification(root.join("a.hpp"), &[root.to_path_buf()], &mut cache);
        assert!(newest.is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn missing_object_is_never_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_file(&root.join("main.cpp"), "int main() {}\n");

        let mut cache = ModificationCache::default();
        assert!(!object_is_fresh(
            root.join("main.cpp.o"),
            root.join("main.cpp"),
            &[root.to_path_buf()],
            &mut cache,
        ));
    }

    #[test]
    fn object_newer_than_all_dependencies_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_file(&root.join("dep.hpp"), "// dep\n");
        write_file(&root.join("main.cpp"), "#include \"dep.hpp\"\n");
        write_file(&root.join("main.cpp.o"), "fake object\n");

        // The object was written last, so it is at least as new as both.
        let mut cache = ModificationCache::default();
        assert!(object_is_fresh(
            root.join("main.cpp.o"),
            root.join("main.cpp"),
            &[root.to_path_buf()],
            &mut cache,
        ));
    }
}
