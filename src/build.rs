//! Manages building and linking of a loaded module set.
//!
//! The build of a module set is performed in several steps.
//!
//! First the planner enumerates [`BuildObject`]s: one per foreign-source
//! dependency and one per module that does not opt out with `skip_build`,
//! validating per-module command overrides and aggregating every module's
//! link contributions into a single [`SharedBuildOptions`].
//!
//! The builder then materializes one compile argv per object and decides,
//! per object, whether the cached artifact can be reused. An object is
//! rebuilt when its source or any transitively included header is newer
//! than the object, or when the argv CRC no longer matches the one stored
//! for it. Spawns run through the process pool in waves bounded by the
//! host parallelism; a wave barrier is the only blocking point.
//!
//! Finally the linker materializes the link argv (dialect-prefixed library
//! and search-dir arguments), lets every pre-link hook adjust it, and skips
//! the spawn entirely when no object is newer than the cached executable
//! and the command CRC is unchanged. The cached executable is copied to its
//! advertised location either way.
//!
//! The entry point persists the command cache on every exit path so that
//! artifacts built before a failure are remembered.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    cache::CommandCache,
    command::{ArgumentSlot, ProcessCommand, SlotValues},
    error::{BuildError, Result},
    module::{DependencyKind, Module},
    process::ProcessPool,
    resolver::{self, ModificationCache},
    utils, Environment,
};

/// Object file extension of the host compiler family.
pub const OBJECT_EXTENSION: &str = if cfg!(windows) { "obj" } else { "o" };

/// Separate debug-symbols extension; only MSVC toolchains produce one.
pub const DEBUG_SYMBOLS_EXTENSION: &str = "pdb";

/// Name used when the environment does not specify an executable output.
pub const DEFAULT_EXECUTABLE_NAME: &str = "a.out";

/// A single compilation unit planned for this run.
#[derive(Clone, Debug)]
pub struct BuildObject {
    /// Exit status of the compile, set once its wave has drained. Stays
    /// zero for cache hits, as if the compile ran and succeeded.
    pub status: Option<i32>,
    pub source_path: PathBuf,
    pub object_path: PathBuf,
    /// The owning module's validated build command override, if any.
    pub build_command_override: Option<ProcessCommand>,
    /// Module-local include search directories; also used when scanning
    /// headers to bound modification times.
    pub include_search_dirs: Vec<PathBuf>,
    pub additional_options: Vec<String>,
}

impl BuildObject {
    fn new(
        source_path: PathBuf,
        object_path: PathBuf,
        module: &Module,
        build_command_override: Option<ProcessCommand>,
    ) -> Self {
        Self {
            status: None,
            source_path,
            object_path,
            build_command_override,
            include_search_dirs: module.c_search_dirs.clone(),
            additional_options: module.additional_build_options.clone(),
        }
    }

    fn succeeded(&self) -> bool {
        self.status == Some(0) && self.object_path.exists()
    }
}

/// Link-side contributions aggregated across all modules, deduplicated by
/// string equality with first-seen order preserved.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SharedBuildOptions {
    pub link_libraries: Vec<String>,
    pub library_search_dirs: Vec<String>,
    pub library_runtime_search_dirs: Vec<String>,
    pub to_linker_options: Vec<String>,
    pub compiler_link_options: Vec<String>,
}

fn append_unique(target: &mut Vec<String>, value: &str) {
    if !target.iter().any(|existing| existing == value) {
        target.push(value.to_string());
    }
}

/// Object-file path for a source, derived deterministically: the source
/// path (already flat for generated sources, which live in the build
/// directory) is flattened into the build directory with the object
/// extension appended.
fn object_path_for_source(build_output_dir: &Path, source: &Path) -> Result<PathBuf> {
    let source_key = source.strip_prefix(build_output_dir).unwrap_or(source);
    utils::flattened_output_path(build_output_dir, source_key, Some(OBJECT_EXTENSION))
}

/// Enumerates build objects from the modules in registration order and
/// aggregates their link contributions.
pub(crate) fn plan_build_objects(
    environment: &Environment,
    modules: &mut [Module],
    build_output_dir: &Path,
) -> Result<(Vec<BuildObject>, SharedBuildOptions)> {
    let mut objects = Vec::new();
    let mut options = SharedBuildOptions::default();

    for module in modules.iter_mut() {
        for hook in module.pre_build_hooks.clone() {
            if !hook(environment, module) {
                return Err(BuildError::HookFailed { hook: "pre-build" });
            }
        }

        if module.build_command_override.is_partial() {
            let missing = if module.build_command_override.executable.is_empty() {
                "executable"
            } else {
                "arguments"
            };
            return Err(module.error_at(
                0,
                format!("module build command override must be completely defined. Missing {missing}"),
            ));
        }
        let build_command_override = (!module.build_command_override.is_unset())
            .then(|| module.build_command_override.clone());

        debug!("planning module \"{}\"", module.filename.display());

        // Module-local directories take priority over the global ones.
        let dependency_search_dirs: Vec<PathBuf> = module
            .c_search_dirs
            .iter()
            .chain(environment.c_search_dirs.iter())
            .cloned()
            .collect();

        for dependency in &module.dependencies {
            match dependency.kind {
                // Sibling cakelisp modules are in the module list themselves
                // and contribute their own build objects.
                DependencyKind::SiblingModule => continue,
                DependencyKind::SystemHeader => continue,
                DependencyKind::ForeignSource => {}
            }

            trace!("\"{}\" requires \"{}\"", module.filename.display(), dependency.name);
            let resolved = dependency_search_dirs
                .iter()
                .map(|dir| dir.join(&dependency.name))
                .find(|candidate| candidate.is_file())
                .ok_or_else(|| {
                    module.error_at(
                        dependency.blame,
                        format!(
                            "could not find dependency \"{}\" on any search path",
                            dependency.name
                        ),
                    )
                })?;

            let object_path = object_path_for_source(build_output_dir, &resolved)?;
            objects.push(BuildObject::new(
                resolved,
                object_path,
                module,
                build_command_override.clone(),
            ));
        }

        for library in &module.library_dependencies {
            append_unique(&mut options.link_libraries, library);
        }
        for dir in &module.library_search_dirs {
            append_unique(&mut options.library_search_dirs, &dir.to_string_lossy());
        }
        for dir in &module.library_runtime_search_dirs {
            append_unique(&mut options.library_runtime_search_dirs, &dir.to_string_lossy());
        }
        for option in &module.to_linker_options {
            append_unique(&mut options.to_linker_options, option);
        }
        for option in &module.compiler_link_options {
            append_unique(&mut options.compiler_link_options, option);
        }

        if module.skip_build {
            continue;
        }

        if module.source_output_path.as_os_str().is_empty() {
            return Err(BuildError::msg(format!(
                "generated output for \"{}\" has not been written; cannot plan its build",
                module.filename.display()
            )));
        }

        let object_path = object_path_for_source(build_output_dir, &module.source_output_path)?;
        objects.push(BuildObject::new(
            module.source_output_path.clone(),
            object_path,
            module,
            build_command_override,
        ));
    }

    Ok((objects, options))
}

fn drain_pool(pool: &mut ProcessPool, objects: &mut [BuildObject]) {
    for finished in pool.wait_all(|output| trace!("{output}")) {
        if !finished.success() && !finished.output.is_empty() {
            error!("{}", finished.output.trim_end());
        }
        objects[finished.key].status = Some(finished.status);
    }
}

/// Compiles every planned object, consulting the cache per object and
/// spawning misses through the pool in bounded waves.
pub(crate) fn build_objects(
    environment: &Environment,
    objects: &mut [BuildObject],
    cached_crcs: &CommandCache,
    new_crcs: &mut CommandCache,
) -> Result<()> {
    if objects.is_empty() {
        return Err(BuildError::msg(
            "nothing to build; this may break hooks which expect something to be built",
        ));
    }

    let mut pool = ProcessPool::with_recommended_limit();
    let mut header_mtimes = ModificationCache::default();

    for index in 0..objects.len() {
        let object = &objects[index];
        let build_command = object
            .build_command_override
            .as_ref()
            .unwrap_or(&environment.build_command);
        let dialect = build_command.dialect();

        let mut include_arguments: Vec<String> = object
            .include_search_dirs
            .iter()
            .chain(environment.c_search_dirs.iter())
            .map(|dir| dialect.include_dir_argument(&dir.to_string_lossy()))
            .collect();

        let debug_symbols_path = PathBuf::from(format!(
            "{}.{DEBUG_SYMBOLS_EXTENSION}",
            object.object_path.display()
        ));

        let mut values = SlotValues::default();
        values
            .set_one(ArgumentSlot::SourceInput, object.source_path.to_string_lossy())
            .set_one(
                ArgumentSlot::ObjectOutput,
                dialect.object_output_argument(&object.object_path.to_string_lossy()),
            )
            .set(ArgumentSlot::IncludeSearchDirs, std::mem::take(&mut include_arguments))
            .set(ArgumentSlot::AdditionalOptions, object.additional_options.clone());
        if let Some(argument) =
            dialect.debug_symbols_argument(&debug_symbols_path.to_string_lossy())
        {
            values.set_one(ArgumentSlot::DebugSymbolsOutput, argument);
        }

        let argv = build_command.expand(&values);

        // Can we use the cached version? The scan always includes `.` so
        // generated files in the build directory are findable.
        let mut scan_dirs = Vec::with_capacity(
            1 + object.include_search_dirs.len() + environment.c_search_dirs.len(),
        );
        scan_dirs.push(PathBuf::from("."));
        scan_dirs.extend(object.include_search_dirs.iter().cloned());
        scan_dirs.extend(environment.c_search_dirs.iter().cloned());

        let (command_matches, crc) = cached_crcs.command_matches(&object.object_path, &argv);
        if environment.use_cached_files
            && command_matches
            && resolver::object_is_fresh(
                &object.object_path,
                &object.source_path,
                &scan_dirs,
                &mut header_mtimes,
            )
        {
            debug!("\"{}\" is up to date", object.object_path.display());
            objects[index].status = Some(0);
            continue;
        }

        if environment.use_cached_files {
            debug!(
                "building \"{}\" ({})",
                object.object_path.display(),
                if command_matches { "file updated" } else { "command changed since last run" }
            );
        }

        // The CRC is staged now and dropped again if the compile fails.
        new_crcs.insert(&object.object_path, crc);

        // Delete a stale PDB so fastlink-style linking cannot trip over it.
        if dialect.is_msvc() && debug_symbols_path.exists() {
            let _ = fs::remove_file(&debug_symbols_path);
        }

        if let Err(err) = pool.spawn(index, &argv, None) {
            new_crcs.remove(&objects[index].object_path);
            drain_pool(&mut pool, objects);
            return Err(err);
        }

        if pool.at_capacity() {
            drain_pool(&mut pool, objects);
        }
    }

    trace!("{} files tested for modification times", header_mtimes.len());
    drain_pool(&mut pool, objects);

    let failed: Vec<PathBuf> = objects
        .iter()
        .filter(|object| !object.succeeded())
        .map(|object| object.object_path.clone())
        .collect();
    if !failed.is_empty() {
        for object_path in &failed {
            error!("failed to make target \"{}\"", object_path.display());
            // Forget the staged command so the artifact is re-evaluated.
            new_crcs.remove(object_path);
        }
        return Err(BuildError::BuildFailed { failed });
    }

    Ok(())
}

/// Copies the cached executable to its advertised location and marks it
/// executable. On Windows an import library produced next to the
/// executable travels along.
fn copy_executable_to_final_output(cached: &Path, final_output: &Path) -> Result<()> {
    utils::copy_binary_file(cached, final_output)?;

    #[cfg(windows)]
    {
        let cached_lib = cached.with_extension("lib");
        if cached_lib.is_file() {
            utils::copy_binary_file(&cached_lib, &final_output.with_extension("lib"))?;
        }
    }

    utils::set_executable_permission(final_output)
}

/// Links all built objects into the final executable, reusing the cached
/// one when neither objects nor the link command changed.
pub(crate) fn link_objects(
    environment: &Environment,
    objects: &[BuildObject],
    options: &SharedBuildOptions,
    build_output_dir: &Path,
    cached_crcs: &CommandCache,
    new_crcs: &mut CommandCache,
) -> Result<PathBuf> {
    if objects.is_empty() {
        return Err(BuildError::msg("no objects to link"));
    }

    let final_output = environment
        .executable_output
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_EXECUTABLE_NAME));
    let executable_name = final_output
        .file_name()
        .map(|name| PathBuf::from(name))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_EXECUTABLE_NAME));
    let cached_executable = utils::flattened_output_path(build_output_dir, &executable_name, None)?;

    // If every object is older than the cached executable, don't even link.
    let objects_dirty = objects.iter().any(|object| {
        !environment.use_cached_files
            || utils::is_newer_than(&object.object_path, &cached_executable)
    });

    let mut link_command = environment.link_command.clone();
    let dialect = link_command.dialect();

    let mut values = SlotValues::default();
    values
        .set_one(
            ArgumentSlot::ExecutableOutput,
            dialect.executable_output_argument(&cached_executable.to_string_lossy()),
        )
        .set(
            ArgumentSlot::ObjectInput,
            objects.iter().map(|object| object.object_path.to_string_lossy().into_owned()).collect(),
        )
        .set(ArgumentSlot::AdditionalOptions, options.compiler_link_options.clone())
        .set(
            ArgumentSlot::LibrarySearchDirs,
            options
                .library_search_dirs
                .iter()
                .map(|dir| dialect.library_search_dir_argument(dir))
                .collect(),
        )
        .set(
            ArgumentSlot::Libraries,
            options.link_libraries.iter().map(|library| dialect.library_argument(library)).collect(),
        )
        .set(
            ArgumentSlot::LibraryRuntimeSearchDirs,
            options
                .library_runtime_search_dirs
                .iter()
                .filter_map(|dir| dialect.runtime_search_dir_argument(dir))
                .collect(),
        )
        .set(
            ArgumentSlot::LinkerArguments,
            options
                .to_linker_options
                .iter()
                .map(|argument| dialect.linker_argument(argument))
                .collect(),
        );

    // Hooks cooperate with each other, i.e. they should only add things.
    for hook in environment.pre_link_hooks.iter().copied() {
        if !hook(environment, &mut link_command, &mut values) {
            return Err(BuildError::HookFailed { hook: "pre-link" });
        }
    }

    let argv = link_command.expand(&values);
    let (command_matches, crc) = cached_crcs.command_matches(&final_output, &argv);

    if !objects_dirty && command_matches {
        debug!(
            "skipping link: no objects newer than cached executable, command identical"
        );
        copy_executable_to_final_output(&cached_executable, &final_output)?;
        info!("no changes needed for \"{}\"", final_output.display());
        return Ok(final_output);
    }

    if objects_dirty {
        debug!("link \"{}\": object files updated", final_output.display());
    }
    if !command_matches {
        debug!("link \"{}\": command changed since last run", final_output.display());
        new_crcs.insert(&final_output, crc);
    }

    let mut pool = ProcessPool::new(1);
    pool.spawn(0, &argv, None)?;
    let finished = pool
        .wait_all(|output| trace!("{output}"))
        .pop()
        .expect("one spawned linker process");

    if !finished.success() {
        // Forget the staged command; the artifact was not produced.
        new_crcs.remove(&final_output);
        return Err(BuildError::LinkFailed { status: finished.status, output: finished.output });
    }

    copy_executable_to_final_output(&cached_executable, &final_output)?;
    info!("successfully built and linked \"{}\"", final_output.display());
    Ok(final_output)
}

/// Plans, builds and links the module set. The caller persists the command
/// cache whether or not this returns an error.
pub(crate) fn build_and_link(
    environment: &Environment,
    modules: &mut [Module],
    build_output_dir: &Path,
    cached_crcs: &CommandCache,
    new_crcs: &mut CommandCache,
) -> Result<Vec<PathBuf>> {
    let (mut objects, options) = plan_build_objects(environment, modules, build_output_dir)?;
    build_objects(environment, &mut objects, cached_crcs, new_crcs)?;
    let built =
        link_objects(environment, &objects, &options, build_output_dir, cached_crcs, new_crcs)?;
    Ok(vec![built])
}

/// Runs every built executable by absolute path from its own directory.
/// Any nonzero exit is a failure.
pub(crate) fn execute_built_outputs(outputs: &[PathBuf]) -> Result<()> {
    if outputs.is_empty() {
        return Err(BuildError::msg("trying to execute, but no executables were output"));
    }

    for output in outputs {
        let executable = utils::canonicalize(output)?;
        let working_dir = executable.parent().map(Path::to_path_buf).unwrap_or_default();

        debug!("executing \"{}\"", executable.display());
        let mut pool = ProcessPool::new(1);
        pool.spawn(0, &[executable.to_string_lossy().into_owned()], Some(&working_dir))?;
        let finished =
            pool.wait_all(|output| print!("{output}")).pop().expect("one spawned process");

        if !finished.success() {
            return Err(BuildError::ExecuteFailed {
                executable: output.clone(),
                status: finished.status,
            });
        }
    }

    Ok(())
}
