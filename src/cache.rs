//! Support for caching build commands.
//!
//! Every produced artifact (object file, linked executable) is remembered
//! together with a CRC-32 of the exact argv that produced it. On the next
//! run the stored CRC decides, together with modification times, whether the
//! artifact can be reused or the command must be re-executed.
//!
//! Two instances coexist during a run: the *loaded* cache read at entry and
//! the *new* cache holding entries for artifacts produced (or re-validated)
//! this run. Writing merges the two, new entries winning, so partial
//! successes survive a failed build.

use crate::error::{BuildError, Result};
use std::{
    collections::BTreeMap,
    fs,
    io::{BufWriter, Read, Write},
    path::Path,
};

/// The file name of the cache file inside the build output directory.
pub const COMMAND_CACHE_FILENAME: &str = "command_crcs.cache";

/// CRC-32 over the UTF-8 bytes of the argv, with a single separator byte
/// between consecutive arguments. This is the identity a cached artifact is
/// keyed on; any reordering or edit of the command line changes it.
pub fn command_crc(argv: &[String]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for (index, argument) in argv.iter().enumerate() {
        if index > 0 {
            hasher.update(b" ");
        }
        hasher.update(argument.as_bytes());
    }
    hasher.finalize()
}

/// Mapping from artifact path to the CRC of the command that produced it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandCache {
    entries: BTreeMap<String, u32>,
}

impl CommandCache {
    fn key(artifact: impl AsRef<Path>) -> String {
        artifact.as_ref().to_string_lossy().into_owned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, artifact: impl AsRef<Path>) -> Option<u32> {
        self.entries.get(&Self::key(artifact)).copied()
    }

    pub fn insert(&mut self, artifact: impl AsRef<Path>, crc: u32) {
        self.entries.insert(Self::key(artifact), crc);
    }

    /// Forgets an artifact, used when its build failed so a later run
    /// re-evaluates the command.
    pub fn remove(&mut self, artifact: impl AsRef<Path>) {
        self.entries.remove(&Self::key(artifact));
    }

    /// Whether the stored CRC for `artifact` matches the command that would
    /// be used now. Also returns the candidate CRC so callers can stage it.
    pub fn command_matches(&self, artifact: impl AsRef<Path>, argv: &[String]) -> (bool, u32) {
        let crc = command_crc(argv);
        (self.get(artifact) == Some(crc), crc)
    }

    /// Reads the cache file from the given build output directory. A missing
    /// file is an empty cache (first build in this configuration).
    pub fn read(build_output_dir: impl AsRef<Path>) -> Result<Self> {
        let path = build_output_dir.as_ref().join(COMMAND_CACHE_FILENAME);
        if !path.exists() {
            trace!("no command cache at \"{}\"", path.display());
            return Ok(Self::default());
        }

        let mut bytes = Vec::new();
        fs::File::open(&path)
            .and_then(|mut file| file.read_to_end(&mut bytes))
            .map_err(|err| BuildError::io(err, &path))?;

        let mut entries = BTreeMap::new();
        let mut cursor = &bytes[..];
        while !cursor.is_empty() {
            let length = read_u32(&mut cursor, &path)? as usize;
            if cursor.len() < length {
                return Err(BuildError::msg(format!(
                    "corrupt command cache \"{}\": truncated record",
                    path.display()
                )));
            }
            let (name, rest) = cursor.split_at(length);
            cursor = rest;
            let artifact = std::str::from_utf8(name)
                .map_err(|_| {
                    BuildError::msg(format!(
                        "corrupt command cache \"{}\": non-UTF-8 artifact path",
                        path.display()
                    ))
                })?
                .to_string();
            let crc = read_u32(&mut cursor, &path)?;
            entries.insert(artifact, crc);
        }

        trace!("read command cache \"{}\" with {} entries", path.display(), entries.len());
        Ok(Self { entries })
    }

    /// Writes the merge of `loaded` and `new` (new entries win) to the cache
    /// file. Called on every exit path of the build entry point so that
    /// successes are remembered even when siblings failed.
    pub fn write(
        build_output_dir: impl AsRef<Path>,
        loaded: &CommandCache,
        new: &CommandCache,
    ) -> Result<()> {
        let path = build_output_dir.as_ref().join(COMMAND_CACHE_FILENAME);
        let mut merged = loaded.entries.clone();
        merged.extend(new.entries.iter().map(|(artifact, crc)| (artifact.clone(), *crc)));

        trace!("writing command cache with {} entries to \"{}\"", merged.len(), path.display());
        let file = fs::File::create(&path).map_err(|err| BuildError::io(err, &path))?;
        let mut writer = BufWriter::new(file);
        for (artifact, crc) in &merged {
            let name = artifact.as_bytes();
            writer
                .write_all(&(name.len() as u32).to_le_bytes())
                .and_then(|_| writer.write_all(name))
                .and_then(|_| writer.write_all(&crc.to_le_bytes()))
                .map_err(|err| BuildError::io(err, &path))?;
        }
        writer.flush().map_err(|err| BuildError::io(err, &path))?;
        Ok(())
    }
}

fn read_u32(cursor: &mut &[u8], path: &Path) -> Result<u32> {
    if cursor.len() < 4 {
        return Err(BuildError::msg(format!(
            "corrupt command cache \"{}\": truncated record",
            path.display()
        )));
    }
    let (word, rest) = cursor.split_at(4);
    *cursor = rest;
    Ok(u32::from_le_bytes(word.try_into().expect("4-byte slice")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn crc_is_stable_and_sensitive_to_argument_boundaries() {
        let first = command_crc(&argv(&["g++", "-c", "main.cpp"]));
        assert_eq!(first, command_crc(&argv(&["g++", "-c", "main.cpp"])));
        assert_ne!(first, command_crc(&argv(&["g++", "-c", "main.cpp", "-O2"])));
        // The separator keeps ["ab", "c"] distinct from ["a", "bc"].
        assert_ne!(command_crc(&argv(&["ab", "c"])), command_crc(&argv(&["a", "bc"])));
    }

    #[test]
    fn missing_cache_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CommandCache::read(dir.path()).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn round_trips_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut new = CommandCache::default();
        new.insert("cakelisp_cache/default/hello.cake.cpp.o", 0xdead_beef);
        new.insert("cakelisp_cache/default/a.out", 42);

        CommandCache::write(dir.path(), &CommandCache::default(), &new).unwrap();
        let reread = CommandCache::read(dir.path()).unwrap();
        assert_eq!(reread, new);
    }

    #[test]
    fn write_merges_loaded_and_new_with_new_winning() {
        let dir = tempfile::tempdir().unwrap();
        let mut loaded = CommandCache::default();
        loaded.insert("stale.o", 1);
        loaded.insert("kept.o", 2);
        let mut new = CommandCache::default();
        new.insert("stale.o", 3);

        CommandCache::write(dir.path(), &loaded, &new).unwrap();
        let merged = CommandCache::read(dir.path()).unwrap();
        assert_eq!(merged.get("stale.o"), Some(3));
        assert_eq!(merged.get("kept.o"), Some(2));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn command_matches_compares_stored_crc() {
        let mut cache = CommandCache::default();
        let command = argv(&["g++", "-c", "x.cpp"]);
        let (matches, crc) = cache.command_matches("x.o", &command);
        assert!(!matches);

        cache.insert("x.o", crc);
        let (matches, _) = cache.command_matches("x.o", &command);
        assert!(matches);

        let (matches, _) = cache.command_matches("x.o", &argv(&["g++", "-c", "x.cpp", "-O2"]));
        assert!(!matches);
    }
}
