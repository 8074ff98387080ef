#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;

pub mod cache;

pub mod command;

pub mod module;

pub mod process;

pub mod resolver;

pub mod utils;

pub mod writer;

mod build;
pub use build::{
    BuildObject, SharedBuildOptions, DEBUG_SYMBOLS_EXTENSION, DEFAULT_EXECUTABLE_NAME,
    OBJECT_EXTENSION,
};

pub use cache::{command_crc, CommandCache, COMMAND_CACHE_FILENAME};
pub use command::{ArgumentSlot, CommandArgument, CompilerDialect, ProcessCommand, SlotValues};
pub use error::{BuildError, BuildIoError, Result};
pub use module::{
    DependencyKind, Frontend, GeneratorOutput, Module, ModuleDependency, PreBuildHook,
    PreLinkHook, StringOutput, StringOutputModifier, Token, TokenIndex, TokenKind,
};
pub use process::ProcessPool;
pub use writer::{
    NameStyleSettings, OutputWriter, WriterFormatSettings, WriterOutputSettings,
};

use std::{
    collections::HashSet,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

/// Default root of the per-configuration build directories.
pub const CAKELISP_CACHE_DIR: &str = "cakelisp_cache";

/// Process-wide build settings shared by every module.
#[derive(Clone, Debug)]
pub struct Environment {
    /// Default compile command for build objects; modules may override it.
    pub build_command: ProcessCommand,
    /// Default link command for the final executable.
    pub link_command: ProcessCommand,
    /// Default header precompile command. Carried as configuration surface
    /// for the precompiled-header slots; the build pipeline never runs it.
    pub header_precompile_command: ProcessCommand,
    /// Global include search directories, appended after each module's own
    /// when compiling and when resolving foreign-source dependencies.
    pub c_search_dirs: Vec<PathBuf>,
    /// Where the final executable is advertised; `a.out` when unset.
    pub executable_output: Option<PathBuf>,
    /// Root under which per-configuration build directories are created.
    pub cache_root: PathBuf,
    pub pre_link_hooks: Vec<PreLinkHook>,
    /// When false, every artifact is rebuilt and relinked regardless of
    /// cache state.
    pub use_cached_files: bool,
    configuration_labels: Vec<String>,
    configuration_labels_final: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            build_command: command::default_build_command(),
            link_command: command::default_link_command(),
            header_precompile_command: command::default_header_precompile_command(),
            c_search_dirs: Vec::new(),
            executable_output: None,
            cache_root: PathBuf::from(CAKELISP_CACHE_DIR),
            pre_link_hooks: Vec::new(),
            use_cached_files: true,
            configuration_labels: Vec::new(),
            configuration_labels_final: false,
        }
    }
}

impl Environment {
    /// Appends a build configuration label. Label order matters: it decides
    /// the build output directory name.
    ///
    /// # Errors
    ///
    /// Once generated output has been written the directory is frozen and
    /// further labels are rejected rather than silently ignored.
    pub fn add_configuration_label(&mut self, label: impl Into<String>) -> Result<()> {
        if self.configuration_labels_final {
            return Err(BuildError::ConfigurationLabelsFinal);
        }
        self.configuration_labels.push(label.into());
        Ok(())
    }

    pub fn configuration_labels(&self) -> &[String] {
        &self.configuration_labels
    }

    pub fn configuration_labels_are_final(&self) -> bool {
        self.configuration_labels_final
    }

    fn freeze_configuration_labels(&mut self) {
        self.configuration_labels_final = true;
    }

    /// Directory named from the configuration labels, e.g.
    /// `cakelisp_cache/Debug-HotReload`, or `cakelisp_cache/default` when no
    /// labels exist.
    fn build_output_dir_name(&self) -> PathBuf {
        if self.configuration_labels.is_empty() {
            self.cache_root.join("default")
        } else {
            self.cache_root.join(self.configuration_labels.join("-"))
        }
    }
}

/// Stable handle to a loaded module within its manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleId(usize);

impl ModuleId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Owns the set of loaded modules and sequences the whole pipeline: load and
/// evaluate, write generated output, build, link, execute.
#[derive(Debug)]
pub struct ModuleManager<F, W> {
    frontend: F,
    writer: W,
    pub environment: Environment,
    modules: Vec<Module>,
    /// Decided exactly once per run, when generated output is written.
    build_output_dir: Option<PathBuf>,
    /// Command CRCs loaded from disk at build entry.
    cached_crcs: CommandCache,
    /// CRCs of artifacts produced (or re-validated) this run.
    new_crcs: CommandCache,
}

impl<F: Frontend, W: OutputWriter> ModuleManager<F, W> {
    pub fn new(frontend: F, writer: W) -> Self {
        Self::with_environment(frontend, writer, Environment::default())
    }

    pub fn with_environment(frontend: F, writer: W, environment: Environment) -> Self {
        Self {
            frontend,
            writer,
            environment,
            modules: Vec::new(),
            build_output_dir: None,
            cached_crcs: CommandCache::default(),
            new_crcs: CommandCache::default(),
        }
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id.0]
    }

    pub fn module_mut(&mut self, id: ModuleId) -> &mut Module {
        &mut self.modules[id.0]
    }

    pub fn frontend(&self) -> &F {
        &self.frontend
    }

    pub fn frontend_mut(&mut self) -> &mut F {
        &mut self.frontend
    }

    /// The per-configuration build directory, once decided.
    pub fn build_output_dir(&self) -> Option<&Path> {
        self.build_output_dir.as_deref()
    }

    /// Loads, tokenizes and evaluates the file, then loads any sibling
    /// modules it declared a dependency on.
    ///
    /// Loading is idempotent: a path that canonicalizes to an already loaded
    /// module returns the existing handle without re-tokenizing.
    pub fn add_evaluate_file(&mut self, path: impl AsRef<Path>) -> Result<ModuleId> {
        let path = utils::normalize_separators(path.as_ref());
        let canonical = utils::canonicalize(&path)?;

        if let Some(index) =
            self.modules.iter().position(|module| module.canonical_path == canonical)
        {
            trace!("already loaded \"{}\"", canonical.display());
            return Ok(ModuleId(index));
        }

        let filename = utils::relative_to_working_dir(&canonical)?;
        let tokens = self.load_tokenize_validate(&filename)?;
        let mut module = Module::new(filename, canonical, tokens);

        let error_count = self.frontend.evaluate_module(&mut self.environment, &mut module);
        if error_count > 0 {
            return Err(BuildError::msg(format!(
                "failed to evaluate \"{}\" ({error_count} error(s))",
                module.filename.display()
            )));
        }

        debug!("loaded \"{}\"", module.filename.display());
        self.modules.push(module);
        let id = ModuleId(self.modules.len() - 1);

        // The store satisfies sibling-module dependencies itself: each
        // sibling joins the module list and contributes its own objects.
        let siblings: Vec<(String, TokenIndex)> = self.modules[id.0]
            .dependencies
            .iter()
            .filter(|dependency| dependency.kind == DependencyKind::SiblingModule)
            .map(|dependency| (dependency.name.clone(), dependency.blame))
            .collect();
        for (sibling, blame) in siblings {
            if let Err(err) = self.add_evaluate_file(&sibling) {
                return Err(match err {
                    located @ BuildError::Source { .. } => located,
                    other => self.modules[id.0].error_at(blame, other),
                });
            }
        }

        Ok(id)
    }

    /// Reads and tokenizes the file line by line, skipping a leading `#!`
    /// so scripts can be executed directly, then validates the stream.
    fn load_tokenize_validate(&self, filename: &Path) -> Result<Vec<Token>> {
        let file = fs::File::open(filename).map_err(|err| BuildError::io(err, filename))?;
        let reader = BufReader::new(file);

        let mut tokens = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|err| BuildError::io(err, filename))?;
            let line_number = index as u32 + 1;
            if line_number == 1 && line.starts_with("#!") {
                trace!("skipping shebang in \"{}\"", filename.display());
                continue;
            }
            self.frontend
                .tokenize_line(&line, filename, line_number, &mut tokens)
                .map_err(|message| BuildError::at(filename, line_number, 0, message))?;
        }

        if tokens.is_empty() {
            return Err(BuildError::msg(format!(
                "empty file or tokenization error with \"{}\"; remove it or add (ignore)",
                filename.display()
            )));
        }

        if !self.frontend.validate_tokens(&tokens) {
            return Err(BuildError::msg(format!(
                "failed to validate tokens from \"{}\"",
                filename.display()
            )));
        }

        Ok(tokens)
    }

    /// Closes forward references across modules; call once everything the
    /// build needs has been loaded.
    pub fn evaluate_resolve_references(&mut self) -> Result<()> {
        if self.frontend.resolve_references(&mut self.environment) {
            Ok(())
        } else {
            Err(BuildError::msg("failed to resolve references"))
        }
    }

    /// Decides the build output directory (freezing configuration labels)
    /// and writes every module's generated `.cpp`/`.hpp` pair into it.
    pub fn write_generated_output(&mut self) -> Result<()> {
        let build_output_dir = self.decide_build_output_dir()?;
        let name_settings = NameStyleSettings::default();
        let format_settings = WriterFormatSettings::default();

        let mut written = HashSet::new();
        for module in &mut self.modules {
            writer::write_module_output(
                &self.writer,
                module,
                &build_output_dir,
                &name_settings,
                &format_settings,
            )?;
            if !written.insert(module.source_output_path.clone()) {
                return Err(BuildError::msg(format!(
                    "two modules map to the same generated output \"{}\"",
                    module.source_output_path.display()
                )));
            }
        }
        Ok(())
    }

    fn decide_build_output_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.build_output_dir {
            return Ok(dir.clone());
        }

        // As soon as we start writing we must commit to a directory; labels
        // can no longer change after this point.
        self.environment.freeze_configuration_labels();
        let dir = self.environment.build_output_dir_name();
        utils::create_dir_all(&dir)?;
        debug!("outputting artifacts to \"{}\"", dir.display());
        self.build_output_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Plans, builds and links everything, returning the built outputs.
    ///
    /// The command cache is loaded first and persisted on every exit path,
    /// including after a failure, so successful siblings are remembered.
    pub fn build_and_link(&mut self) -> Result<Vec<PathBuf>> {
        let build_output_dir = self.build_output_dir.clone().ok_or_else(|| {
            BuildError::msg("generated output must be written before building")
        })?;

        self.cached_crcs = CommandCache::read(&build_output_dir)?;
        self.new_crcs = CommandCache::default();

        let result = build::build_and_link(
            &self.environment,
            &mut self.modules,
            &build_output_dir,
            &self.cached_crcs,
            &mut self.new_crcs,
        );

        let persisted =
            CommandCache::write(&build_output_dir, &self.cached_crcs, &self.new_crcs);
        let outputs = result?;
        persisted?;
        Ok(outputs)
    }

    /// Runs each built executable from its own directory; any nonzero exit
    /// is a failure.
    pub fn execute_built_outputs(&self, outputs: &[PathBuf]) -> Result<()> {
        build::execute_built_outputs(outputs)
    }

    /// Releases per-module state. Unless `keep_dynamic_libraries` is set,
    /// also unloads compile-time dynamic libraries acquired during
    /// evaluation.
    pub fn destroy(mut self, keep_dynamic_libraries: bool) {
        if !keep_dynamic_libraries {
            self.frontend.close_dynamic_libraries();
        }
        self.modules.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_directory_is_derived_from_ordered_labels() {
        let mut environment = Environment::default();
        assert_eq!(
            environment.build_output_dir_name(),
            Path::new(CAKELISP_CACHE_DIR).join("default")
        );

        environment.add_configuration_label("Debug").unwrap();
        environment.add_configuration_label("HotReload").unwrap();
        assert_eq!(
            environment.build_output_dir_name(),
            Path::new(CAKELISP_CACHE_DIR).join("Debug-HotReload")
        );

        let mut reordered = Environment::default();
        reordered.add_configuration_label("HotReload").unwrap();
        reordered.add_configuration_label("Debug").unwrap();
        assert_ne!(environment.build_output_dir_name(), reordered.build_output_dir_name());
    }

    #[test]
    fn labels_cannot_change_once_final() {
        let mut environment = Environment::default();
        environment.add_configuration_label("Debug").unwrap();
        environment.freeze_configuration_labels();

        let err = environment.add_configuration_label("HotReload").unwrap_err();
        assert!(matches!(err, BuildError::ConfigurationLabelsFinal));
        assert_eq!(environment.configuration_labels(), ["Debug"]);
    }
}
