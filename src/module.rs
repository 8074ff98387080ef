//! The module data model and the seams to the language frontend.
//!
//! A [`Module`] is one loaded top-level cakelisp file: its token stream,
//! the generator output produced by evaluation, and every build option the
//! file declared for itself (dependencies, search directories, link
//! contributions, hooks). The tokenizer/evaluator pair lives behind the
//! [`Frontend`] trait; this crate never parses the language itself.

use std::path::{Path, PathBuf};

use crate::{
    command::{ProcessCommand, SlotValues},
    error::BuildError,
    Environment,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    OpenParen,
    CloseParen,
    Symbol,
    StringLiteral,
}

/// One token of a cakelisp source file. Tokens are produced once, held
/// immutably by their module, and referenced by index thereafter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub contents: String,
    pub source: PathBuf,
    pub line: u32,
    pub column_start: u32,
    pub column_end: u32,
}

/// Index into a module's token stream, attached to decisions so diagnostics
/// can point back at the source that caused them.
pub type TokenIndex = usize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StringOutputModifier {
    #[default]
    None,
    SpaceAfter,
    NewlineAfter,
    SurroundWithQuotes,
}

/// One emitted fragment of generated C/C++ text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StringOutput {
    pub contents: String,
    pub modifier: StringOutputModifier,
    pub blame: TokenIndex,
}

impl StringOutput {
    pub fn new(
        contents: impl Into<String>,
        modifier: StringOutputModifier,
        blame: TokenIndex,
    ) -> Self {
        Self { contents: contents.into(), modifier, blame }
    }
}

/// The structured output the evaluator produces for a module and the writer
/// serializes into the generated `.cpp`/`.hpp` pair.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeneratorOutput {
    pub source: Vec<StringOutput>,
    pub header: Vec<StringOutput>,
}

impl GeneratorOutput {
    pub fn is_empty(&self) -> bool {
        self.source.is_empty() && self.header.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DependencyKind {
    /// Another cakelisp module; built by the module store itself.
    SiblingModule,
    /// A C/C++ source file compiled alongside the module's generated output.
    ForeignSource,
    /// A system header; carried for bookkeeping, never built.
    SystemHeader,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleDependency {
    pub kind: DependencyKind,
    pub name: String,
    /// The token that introduced the dependency.
    pub blame: TokenIndex,
}

/// Pre-build hook, invoked once per module while planning. Returning `false`
/// aborts the build. Receives the shared environment and the module, the
/// two disjoint halves of the manager a hook may observe and mutate.
pub type PreBuildHook = fn(&Environment, &mut Module) -> bool;

/// Pre-link hook, invoked with the materialized link command and its slot
/// values, both mutable; convention is additive. Returning `false` aborts.
pub type PreLinkHook = fn(&Environment, &mut ProcessCommand, &mut SlotValues) -> bool;

/// A single loaded translation unit.
#[derive(Clone, Debug)]
pub struct Module {
    /// Normalized filename, relative to the working directory when the file
    /// lies under it. Used for diagnostics and derived output names.
    pub filename: PathBuf,
    /// Canonicalized absolute path with `/` separators; the identity key.
    /// Computed once at insertion.
    pub canonical_path: PathBuf,
    /// Immutable token stream, never re-tokenized.
    pub tokens: Vec<Token>,
    pub generated_output: GeneratorOutput,
    /// Where the generated `.cpp`/`.hpp` were written, set by the output
    /// writer driver.
    pub source_output_path: PathBuf,
    pub header_output_path: PathBuf,
    /// Per-module build command override. Either both executable and
    /// arguments are set, or neither; partial overrides are rejected at
    /// planning time.
    pub build_command_override: ProcessCommand,
    pub dependencies: Vec<ModuleDependency>,
    /// Include search directories for this module's compiles, also used to
    /// resolve foreign-source dependencies.
    pub c_search_dirs: Vec<PathBuf>,
    pub additional_build_options: Vec<String>,
    pub library_dependencies: Vec<String>,
    pub library_search_dirs: Vec<PathBuf>,
    pub library_runtime_search_dirs: Vec<PathBuf>,
    /// Raw flags forwarded to the linker (`-Wl,` on POSIX drivers).
    pub to_linker_options: Vec<String>,
    /// Flags passed to the compiler driver at link time, verbatim.
    pub compiler_link_options: Vec<String>,
    pub pre_build_hooks: Vec<PreBuildHook>,
    /// Consume the module as header only; no build object is planned for it.
    pub skip_build: bool,
}

impl Module {
    pub(crate) fn new(filename: PathBuf, canonical_path: PathBuf, tokens: Vec<Token>) -> Self {
        Self {
            filename,
            canonical_path,
            tokens,
            generated_output: GeneratorOutput::default(),
            source_output_path: PathBuf::new(),
            header_output_path: PathBuf::new(),
            build_command_override: ProcessCommand::default(),
            dependencies: Vec::new(),
            c_search_dirs: Vec::new(),
            additional_build_options: Vec::new(),
            library_dependencies: Vec::new(),
            library_search_dirs: Vec::new(),
            library_runtime_search_dirs: Vec::new(),
            to_linker_options: Vec::new(),
            compiler_link_options: Vec::new(),
            pre_build_hooks: Vec::new(),
            skip_build: false,
        }
    }

    pub fn add_dependency(&mut self, kind: DependencyKind, name: impl Into<String>, blame: TokenIndex) {
        self.dependencies.push(ModuleDependency { kind, name: name.into(), blame });
    }

    /// Builds a diagnostic located at the given blame token, falling back to
    /// the start of the file when the index is out of range.
    pub(crate) fn error_at(&self, blame: TokenIndex, message: impl std::fmt::Display) -> BuildError {
        match self.tokens.get(blame) {
            Some(token) => {
                BuildError::at(token.source.clone(), token.line, token.column_start, message)
            }
            None => BuildError::at(self.filename.clone(), 1, 0, message),
        }
    }
}

/// The external tokenizer/evaluator pair that populates modules. The build
/// orchestrator drives it but knows nothing about the language.
pub trait Frontend {
    /// Tokenizes one source line, appending to `tokens`. An `Err` carries
    /// the tokenizer's message; the caller attributes file and line.
    fn tokenize_line(
        &self,
        line: &str,
        source: &Path,
        line_number: u32,
        tokens: &mut Vec<Token>,
    ) -> std::result::Result<(), String>;

    /// Structural validation of a freshly tokenized stream.
    fn validate_tokens(&self, tokens: &[Token]) -> bool;

    /// Evaluates a tokenized module at module scope, populating its
    /// generator output and build options. Returns the number of errors
    /// encountered; zero means success.
    fn evaluate_module(&mut self, environment: &mut Environment, module: &mut Module) -> usize;

    /// Closes forward references across modules once everything is loaded.
    fn resolve_references(&mut self, environment: &mut Environment) -> bool;

    /// Unloads any compile-time dynamic libraries acquired during
    /// evaluation. Default: nothing to unload.
    fn close_dynamic_libraries(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blame_errors_carry_token_location() {
        let tokens = vec![Token {
            kind: TokenKind::Symbol,
            contents: "c-import".to_string(),
            source: PathBuf::from("app.cake"),
            line: 7,
            column_start: 2,
            column_end: 10,
        }];
        let module = Module::new(PathBuf::from("app.cake"), PathBuf::from("/proj/app.cake"), tokens);

        let err = module.error_at(0, "missing dependency");
        assert_eq!(err.to_string(), "app.cake:7:2: error: missing dependency");

        // Out-of-range blame still produces a located diagnostic.
        let err = module.error_at(99, "missing dependency");
        assert_eq!(err.to_string(), "app.cake:1:0: error: missing dependency");
    }
}
