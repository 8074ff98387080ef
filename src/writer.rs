//! Driving the external writer that turns generator output into text.
//!
//! The writer itself lives outside this crate; the driver here prepares
//! everything it needs per module: the flattened `.cpp`/`.hpp` cache paths
//! inside the build output directory and a synthesized heading that makes
//! each generated source include its own generated header.

use std::path::Path;

use crate::{
    error::Result,
    module::{GeneratorOutput, Module, StringOutput, StringOutputModifier},
    utils,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NameStyleMode {
    #[default]
    CamelCase,
    PascalCase,
    SnakeCase,
}

/// How cakelisp identifiers are converted into C identifiers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NameStyleSettings {
    pub variable_name_mode: NameStyleMode,
    pub function_name_mode: NameStyleMode,
    pub type_name_mode: NameStyleMode,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BraceStyle {
    #[default]
    Allman,
    KernighanRitchie,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterFormatSettings {
    pub brace_style: BraceStyle,
    pub indent_with_tabs: bool,
}

/// Everything the writer needs to serialize one module.
#[derive(Debug)]
pub struct WriterOutputSettings<'a> {
    /// The cakelisp file this output was generated from.
    pub source_cakelisp_filename: &'a Path,
    /// Cached source output path, `<build-dir>/<flattened>.cpp`.
    pub source_output_path: &'a Path,
    /// Cached header output path, `<build-dir>/<flattened>.hpp`.
    pub header_output_path: &'a Path,
    /// Emitted before the module's own source output.
    pub heading: &'a GeneratorOutput,
    /// Emitted after it.
    pub footer: &'a GeneratorOutput,
}

/// Serializes generator output to disk. External collaborator; the build
/// orchestrator only decides where files go and what surrounds them.
///
/// Implementations must leave an output file untouched when its content is
/// unchanged: object-file caching compares modification times against the
/// written sources.
pub trait OutputWriter {
    fn write_generator_output(
        &self,
        output: &GeneratorOutput,
        name_settings: &NameStyleSettings,
        format_settings: &WriterFormatSettings,
        output_settings: &WriterOutputSettings<'_>,
    ) -> Result<()>;
}

/// Writes one module's generated output pair into the build directory,
/// recording the written paths on the module.
pub fn write_module_output<W: OutputWriter>(
    writer: &W,
    module: &mut Module,
    build_output_dir: &Path,
    name_settings: &NameStyleSettings,
    format_settings: &WriterFormatSettings,
) -> Result<()> {
    let source_output = utils::flattened_output_path(build_output_dir, &module.filename, Some("cpp"))?;
    let header_output = utils::flattened_output_path(build_output_dir, &module.filename, Some("hpp"))?;

    // Every generated source starts by including its own generated header.
    let mut heading = GeneratorOutput::default();
    let header_include = header_output.file_name().unwrap_or_default().to_string_lossy();
    heading.source.push(StringOutput::new("#include", StringOutputModifier::SpaceAfter, 0));
    heading.source.push(StringOutput::new(
        header_include.as_ref(),
        StringOutputModifier::SurroundWithQuotes,
        0,
    ));
    heading.source.push(StringOutput::new("", StringOutputModifier::NewlineAfter, 0));
    let footer = GeneratorOutput::default();

    module.source_output_path = source_output;
    module.header_output_path = header_output;

    let output_settings = WriterOutputSettings {
        source_cakelisp_filename: &module.filename,
        source_output_path: &module.source_output_path,
        header_output_path: &module.header_output_path,
        heading: &heading,
        footer: &footer,
    };

    trace!(
        "writing generated output for \"{}\" to \"{}\"",
        module.filename.display(),
        module.source_output_path.display()
    );
    writer.write_generator_output(
        &module.generated_output,
        name_settings,
        format_settings,
        &output_settings,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;
    use std::{cell::RefCell, path::PathBuf};

    #[derive(Default)]
    struct RecordingWriter {
        headings: RefCell<Vec<String>>,
    }

    impl OutputWriter for RecordingWriter {
        fn write_generator_output(
            &self,
            _output: &GeneratorOutput,
            _name_settings: &NameStyleSettings,
            _format_settings: &WriterFormatSettings,
            output_settings: &WriterOutputSettings<'_>,
        ) -> Result<()> {
            let heading = output_settings
                .heading
                .source
                .iter()
                .map(|out| out.contents.clone())
                .collect::<Vec<_>>()
                .join(" ");
            self.headings.borrow_mut().push(heading);
            Ok(())
        }
    }

    #[test]
    fn derives_flattened_output_pair_and_self_include() {
        let mut module = Module::new(
            PathBuf::from("runtime/hot_reload.cake"),
            PathBuf::from("/proj/runtime/hot_reload.cake"),
            Vec::new(),
        );
        let writer = RecordingWriter::default();
        let build_dir = Path::new("cakelisp_cache/default");

        write_module_output(
            &writer,
            &mut module,
            build_dir,
            &NameStyleSettings::default(),
            &WriterFormatSettings::default(),
        )
        .unwrap();

        assert_eq!(module.source_output_path, build_dir.join("runtime_hot_reload.cake.cpp"));
        assert_eq!(module.header_output_path, build_dir.join("runtime_hot_reload.cake.hpp"));
        let headings = writer.headings.borrow();
        assert!(headings[0].contains("runtime_hot_reload.cake.hpp"));
    }
}
