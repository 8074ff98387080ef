//! Command templates and their expansion into concrete compiler argv.
//!
//! A [`ProcessCommand`] is a program plus an ordered list of arguments, each
//! either a literal string or an abstract [`ArgumentSlot`]. Expanding the
//! template against a set of [`SlotValues`] yields the argv handed to the
//! process pool. Expansion is pure and order-preserving, which is what the
//! cached command CRCs depend on.

use std::{collections::HashMap, path::Path};

/// An abstract position in a command template, filled in at expansion time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArgumentSlot {
    SourceInput,
    ObjectOutput,
    DebugSymbolsOutput,
    IncludeSearchDirs,
    AdditionalOptions,
    ObjectInput,
    ExecutableOutput,
    LibrarySearchDirs,
    Libraries,
    LibraryRuntimeSearchDirs,
    LinkerArguments,
    CakelispHeadersInclude,
    PrecompiledHeaderInclude,
    PrecompiledHeaderOutput,
    DynamicLibraryOutput,
    ImportLibraries,
    ImportLibraryPaths,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandArgument {
    Literal(String),
    Slot(ArgumentSlot),
}

impl CommandArgument {
    pub fn literal(argument: impl Into<String>) -> Self {
        CommandArgument::Literal(argument.into())
    }
}

/// Values to substitute for abstract slots during expansion. A slot with no
/// value expands to zero arguments; a slot may expand to several.
#[derive(Clone, Debug, Default)]
pub struct SlotValues {
    values: HashMap<ArgumentSlot, Vec<String>>,
}

impl SlotValues {
    pub fn set(&mut self, slot: ArgumentSlot, values: Vec<String>) -> &mut Self {
        self.values.insert(slot, values);
        self
    }

    pub fn set_one(&mut self, slot: ArgumentSlot, value: impl Into<String>) -> &mut Self {
        self.set(slot, vec![value.into()])
    }

    /// Appends a value, keeping any already provided for the slot.
    pub fn push(&mut self, slot: ArgumentSlot, value: impl Into<String>) -> &mut Self {
        self.values.entry(slot).or_default().push(value.into());
        self
    }

    pub fn get(&self, slot: ArgumentSlot) -> &[String] {
        self.values.get(&slot).map_or(&[], Vec::as_slice)
    }
}

/// A build or link command template: the program to execute and the ordered
/// literal/slot arguments to expand.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessCommand {
    pub executable: String,
    pub arguments: Vec<CommandArgument>,
}

impl ProcessCommand {
    pub fn new(executable: impl Into<String>, arguments: Vec<CommandArgument>) -> Self {
        Self { executable: executable.into(), arguments }
    }

    /// `true` if neither the executable nor the arguments were set.
    pub fn is_unset(&self) -> bool {
        self.executable.is_empty() && self.arguments.is_empty()
    }

    /// `true` if exactly one of executable/arguments was set. Such a command
    /// is a configuration error: overrides must be completely defined.
    pub fn is_partial(&self) -> bool {
        self.executable.is_empty() != self.arguments.is_empty()
    }

    /// Materializes argv: the executable followed by every template argument
    /// in order, with slots replaced by their provided values.
    pub fn expand(&self, values: &SlotValues) -> Vec<String> {
        let mut argv = Vec::with_capacity(1 + self.arguments.len());
        argv.push(self.executable.clone());
        for argument in &self.arguments {
            match argument {
                CommandArgument::Literal(literal) => argv.push(literal.clone()),
                CommandArgument::Slot(slot) => argv.extend(values.get(*slot).iter().cloned()),
            }
        }
        argv
    }

    pub fn dialect(&self) -> CompilerDialect {
        CompilerDialect::for_program(&self.executable)
    }
}

/// How a compiler family spells its argv: POSIX-like tools take separated
/// arguments (`-o foo.o`), MSVC-like tools join them (`/Fofoo.obj`).
///
/// Selection is by program basename, not host OS, so cross-dialect
/// invocation stays correct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompilerDialect {
    Posix,
    Msvc,
}

impl CompilerDialect {
    pub fn for_program(program: &str) -> Self {
        let basename = Path::new(program)
            .file_name()
            .map(|name| name.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if basename == "cl.exe" || basename == "link.exe" {
            CompilerDialect::Msvc
        } else {
            CompilerDialect::Posix
        }
    }

    pub fn is_msvc(self) -> bool {
        matches!(self, CompilerDialect::Msvc)
    }

    /// Object-file output. MSVC joins the path onto `/Fo`; POSIX compilers
    /// take the bare path after a literal `-o` in the template.
    pub fn object_output_argument(self, object: &str) -> String {
        match self {
            CompilerDialect::Posix => object.to_string(),
            CompilerDialect::Msvc => format!("/Fo{object}"),
        }
    }

    /// Debug-symbols output. Only MSVC writes symbols to a separate file;
    /// POSIX compilers embed them, so the slot expands to nothing.
    pub fn debug_symbols_argument(self, symbols: &str) -> Option<String> {
        match self {
            CompilerDialect::Posix => None,
            CompilerDialect::Msvc => Some(format!("/Fd{symbols}")),
        }
    }

    pub fn include_dir_argument(self, dir: &str) -> String {
        match self {
            CompilerDialect::Posix => format!("-I{dir}"),
            CompilerDialect::Msvc => format!("/I{dir}"),
        }
    }

    pub fn library_argument(self, library: &str) -> String {
        match self {
            CompilerDialect::Posix => format!("-l{library}"),
            CompilerDialect::Msvc => format!("{library}.lib"),
        }
    }

    pub fn library_search_dir_argument(self, dir: &str) -> String {
        match self {
            CompilerDialect::Posix => format!("-L{dir}"),
            CompilerDialect::Msvc => format!("/LIBPATH:{dir}"),
        }
    }

    /// Runtime library search path. No MSVC equivalent: rpath is an ELF
    /// concept, so the slot expands to nothing there.
    pub fn runtime_search_dir_argument(self, dir: &str) -> Option<String> {
        match self {
            CompilerDialect::Posix => Some(format!("-Wl,-rpath,{dir}")),
            CompilerDialect::Msvc => None,
        }
    }

    /// Raw linker flags. POSIX compiler drivers need `-Wl,` forwarding;
    /// `link.exe` is invoked directly and takes them verbatim.
    pub fn linker_argument(self, argument: &str) -> String {
        match self {
            CompilerDialect::Posix => format!("-Wl,{argument}"),
            CompilerDialect::Msvc => argument.to_string(),
        }
    }

    pub fn executable_output_argument(self, executable: &str) -> String {
        match self {
            CompilerDialect::Posix => executable.to_string(),
            CompilerDialect::Msvc => format!("/OUT:{executable}"),
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        /// Default compile command for the host compiler family.
        pub fn default_build_command() -> ProcessCommand {
            ProcessCommand::new(
                "cl.exe",
                vec![
                    CommandArgument::literal("/nologo"),
                    CommandArgument::literal("/EHsc"),
                    CommandArgument::literal("/c"),
                    CommandArgument::Slot(ArgumentSlot::SourceInput),
                    CommandArgument::Slot(ArgumentSlot::ObjectOutput),
                    CommandArgument::Slot(ArgumentSlot::DebugSymbolsOutput),
                    CommandArgument::Slot(ArgumentSlot::IncludeSearchDirs),
                    CommandArgument::Slot(ArgumentSlot::AdditionalOptions),
                ],
            )
        }

        /// Default link command for the host compiler family.
        pub fn default_link_command() -> ProcessCommand {
            ProcessCommand::new(
                "link.exe",
                vec![
                    CommandArgument::literal("/nologo"),
                    CommandArgument::Slot(ArgumentSlot::AdditionalOptions),
                    CommandArgument::Slot(ArgumentSlot::ExecutableOutput),
                    CommandArgument::Slot(ArgumentSlot::ObjectInput),
                    CommandArgument::Slot(ArgumentSlot::LibrarySearchDirs),
                    CommandArgument::Slot(ArgumentSlot::Libraries),
                    CommandArgument::Slot(ArgumentSlot::LibraryRuntimeSearchDirs),
                    CommandArgument::Slot(ArgumentSlot::LinkerArguments),
                ],
            )
        }

        /// Default header precompile command. The build pipeline itself never
        /// runs this, but the configuration surface exists so hooks and
        /// overrides can reference the precompiled-header slots.
        pub fn default_header_precompile_command() -> ProcessCommand {
            ProcessCommand::new(
                "cl.exe",
                vec![
                    CommandArgument::literal("/nologo"),
                    CommandArgument::literal("/EHsc"),
                    CommandArgument::literal("/c"),
                    CommandArgument::Slot(ArgumentSlot::SourceInput),
                    CommandArgument::Slot(ArgumentSlot::PrecompiledHeaderOutput),
                    CommandArgument::Slot(ArgumentSlot::IncludeSearchDirs),
                    CommandArgument::Slot(ArgumentSlot::AdditionalOptions),
                ],
            )
        }
    } else {
        /// Default compile command for the host compiler family.
        pub fn default_build_command() -> ProcessCommand {
            ProcessCommand::new(
                "g++",
                vec![
                    CommandArgument::literal("-g"),
                    CommandArgument::literal("-c"),
                    CommandArgument::Slot(ArgumentSlot::SourceInput),
                    CommandArgument::literal("-o"),
                    CommandArgument::Slot(ArgumentSlot::ObjectOutput),
                    CommandArgument::literal("-fPIC"),
                    CommandArgument::Slot(ArgumentSlot::IncludeSearchDirs),
                    CommandArgument::Slot(ArgumentSlot::AdditionalOptions),
                ],
            )
        }

        /// Default link command for the host compiler family.
        pub fn default_link_command() -> ProcessCommand {
            ProcessCommand::new(
                "g++",
                vec![
                    CommandArgument::Slot(ArgumentSlot::AdditionalOptions),
                    CommandArgument::literal("-o"),
                    CommandArgument::Slot(ArgumentSlot::ExecutableOutput),
                    CommandArgument::Slot(ArgumentSlot::ObjectInput),
                    CommandArgument::Slot(ArgumentSlot::LibrarySearchDirs),
                    CommandArgument::Slot(ArgumentSlot::Libraries),
                    CommandArgument::Slot(ArgumentSlot::LibraryRuntimeSearchDirs),
                    CommandArgument::Slot(ArgumentSlot::LinkerArguments),
                ],
            )
        }

        /// Default header precompile command. The build pipeline itself never
        /// runs this, but the configuration surface exists so hooks and
        /// overrides can reference the precompiled-header slots.
        pub fn default_header_precompile_command() -> ProcessCommand {
            ProcessCommand::new(
                "g++",
                vec![
                    CommandArgument::literal("-g"),
                    CommandArgument::literal("-x"),
                    CommandArgument::literal("c++-header"),
                    CommandArgument::Slot(ArgumentSlot::SourceInput),
                    CommandArgument::literal("-o"),
                    CommandArgument::Slot(ArgumentSlot::PrecompiledHeaderOutput),
                    CommandArgument::Slot(ArgumentSlot::CakelispHeadersInclude),
                    CommandArgument::literal("-fPIC"),
                ],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_command() -> ProcessCommand {
        ProcessCommand::new(
            "g++",
            vec![
                CommandArgument::literal("-c"),
                CommandArgument::Slot(ArgumentSlot::SourceInput),
                CommandArgument::literal("-o"),
                CommandArgument::Slot(ArgumentSlot::ObjectOutput),
                CommandArgument::Slot(ArgumentSlot::IncludeSearchDirs),
            ],
        )
    }

    #[test]
    fn expansion_preserves_template_order() {
        let mut values = SlotValues::default();
        values
            .set_one(ArgumentSlot::SourceInput, "main.cake.cpp")
            .set_one(ArgumentSlot::ObjectOutput, "main.cake.cpp.o")
            .set(
                ArgumentSlot::IncludeSearchDirs,
                vec!["-Isrc".to_string(), "-I.".to_string()],
            );

        let argv = sample_command().expand(&values);
        assert_eq!(
            argv,
            vec!["g++", "-c", "main.cake.cpp", "-o", "main.cake.cpp.o", "-Isrc", "-I."]
        );
    }

    #[test]
    fn expansion_is_deterministic() {
        let mut values = SlotValues::default();
        values
            .set_one(ArgumentSlot::SourceInput, "a.cpp")
            .set_one(ArgumentSlot::ObjectOutput, "a.o");
        let command = sample_command();
        assert_eq!(command.expand(&values), command.expand(&values));
    }

    #[test]
    fn unprovided_slots_expand_to_nothing() {
        let argv = sample_command().expand(&SlotValues::default());
        assert_eq!(argv, vec!["g++", "-c", "-o"]);
    }

    #[test]
    fn dialect_keys_on_program_basename_case_insensitively() {
        assert_eq!(CompilerDialect::for_program("CL.exe"), CompilerDialect::Msvc);
        assert_eq!(
            CompilerDialect::for_program("C:/tools/msvc/Link.EXE"),
            CompilerDialect::Msvc
        );
        assert_eq!(CompilerDialect::for_program("g++"), CompilerDialect::Posix);
        assert_eq!(CompilerDialect::for_program("/usr/bin/clang++"), CompilerDialect::Posix);
    }

    #[test]
    fn msvc_joins_output_arguments() {
        let msvc = CompilerDialect::Msvc;
        assert_eq!(msvc.object_output_argument("foo.obj"), "/Fofoo.obj");
        assert_eq!(msvc.debug_symbols_argument("foo.pdb").as_deref(), Some("/Fdfoo.pdb"));
        assert_eq!(msvc.executable_output_argument("app.exe"), "/OUT:app.exe");
        assert_eq!(msvc.library_argument("m"), "m.lib");
        assert_eq!(msvc.library_search_dir_argument("lib"), "/LIBPATH:lib");
    }

    #[test]
    fn posix_prefixes_link_arguments() {
        let posix = CompilerDialect::Posix;
        assert_eq!(posix.object_output_argument("foo.o"), "foo.o");
        assert_eq!(posix.debug_symbols_argument("foo.pdb"), None);
        assert_eq!(posix.library_argument("m"), "-lm");
        assert_eq!(posix.library_search_dir_argument("lib"), "-Llib");
        assert_eq!(
            posix.runtime_search_dir_argument("bin").as_deref(),
            Some("-Wl,-rpath,bin")
        );
        assert_eq!(posix.linker_argument("--export-dynamic"), "-Wl,--export-dynamic");
    }

    #[test]
    fn partial_override_detection() {
        let mut command = ProcessCommand::default();
        assert!(command.is_unset());
        assert!(!command.is_partial());

        command.executable = "clang++".to_string();
        assert!(command.is_partial());

        command.arguments.push(CommandArgument::literal("-c"));
        assert!(!command.is_partial());
    }
}
