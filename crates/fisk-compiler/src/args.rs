//! Compiler command line rewriting.
//!
//! The client preprocesses locally and ships the result. The builder must
//! compile that stream without touching headers, so every include-path and
//! dependency-generation flag is removed, the language is switched to its
//! preprocessed form and the source file is replaced by stdin.

use std::path::Path;
use thiserror::Error;

/// Include and preprocessor flags that take a value and are dropped.
const STRIPPED_FLAGS_WITH_VALUES: &[&str] = &[
    "-I",
    "-isystem",
    "-iquote",
    "-idirafter",
    "-include",
    "-imacros",
    "-iprefix",
    "-iwithprefix",
    "-iwithprefixbefore",
    "-iframework",
    "-F",
    "-MF",
    "-MT",
    "-MQ",
    "-MJ",
];

/// Dependency-generation flags without a value, dropped.
const STRIPPED_BOOLEAN_FLAGS: &[&str] = &["-M", "-MM", "-MD", "-MMD", "-MG", "-MP"];

/// Joined-form prefixes dropped together with their attached value.
const STRIPPED_PREFIXES: &[&str] = &[
    "-isystem",
    "-iquote",
    "-idirafter",
    "-iframework",
    "-MF",
    "-MT",
    "-MQ",
    "-MJ",
    "-I",
    "-F",
];

/// Flags that are kept but consume the following argument.
const FLAGS_WITH_VALUES: &[&str] = &[
    "-arch",
    "-target",
    "-isysroot",
    "-Xclang",
    "-Xassembler",
    "-Xlinker",
    "-Xpreprocessor",
    "-mllvm",
    "-gcc-toolchain",
    "--param",
    "-aux-info",
    "-D",
    "-U",
    "-L",
    "-l",
];

/// Extra arguments gcc needs to accept preprocessed input.
const GCC_FLAGS: &[&str] = &["-fpreprocessed"];

/// Extra arguments clang needs to accept preprocessed input quietly.
const CLANG_FLAGS: &[&str] = &["-Wno-unused-command-line-argument", "-Wno-gnu-line-marker"];

/// Errors that make a command line unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("no source file in command line")]
    NoSource,

    #[error("more than one source file: {first} and {second}")]
    MultipleSources { first: String, second: String },

    #[error("flag {0} requires a value")]
    MissingValue(String),

    #[error("cannot compile language '{0}' from preprocessed input")]
    UnknownLanguage(String),
}

/// Compiler family, which decides the extra flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerKind {
    Clang,
    Gcc,
}

impl CompilerKind {
    /// Guess from the compiler executable name.
    pub fn detect(argv0: &str) -> Self {
        let name = Path::new(argv0)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(argv0);
        if name.contains("clang") {
            CompilerKind::Clang
        } else {
            CompilerKind::Gcc
        }
    }

    fn extra_flags(self) -> &'static [&'static str] {
        match self {
            CompilerKind::Clang => CLANG_FLAGS,
            CompilerKind::Gcc => GCC_FLAGS,
        }
    }
}

/// Options for [`rewrite`].
#[derive(Debug, Clone)]
pub struct RewriteOptions {
    /// Compiler executable as the client named it.
    pub argv0: String,
    pub kind: CompilerKind,
}

impl RewriteOptions {
    pub fn for_compiler(argv0: &str) -> Self {
        Self {
            argv0: argv0.to_string(),
            kind: CompilerKind::detect(argv0),
        }
    }
}

/// A rewritten compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub compiler: String,
    pub kind: CompilerKind,
    /// Arguments to pass after the compiler, reading source from stdin.
    pub args: Vec<String>,
    /// Source path as the client named it.
    pub source: String,
    /// Preprocessed language token passed with `-x`.
    pub language: &'static str,
    /// Output file name inside the sandbox directory.
    pub output: String,
    /// Output path the client asked for.
    pub requested_output: String,
}

/// Map a `-x` language to its preprocessed form.
pub fn preprocessed_language(language: &str) -> Option<&'static str> {
    match language {
        "c" | "cpp-output" => Some("cpp-output"),
        "c++" | "c++-cpp-output" => Some("c++-cpp-output"),
        "objective-c" | "objective-c-cpp-output" | "objc-cpp-output" => {
            Some("objective-c-cpp-output")
        }
        "objective-c++" | "objective-c++-cpp-output" | "objc++-cpp-output" => {
            Some("objective-c++-cpp-output")
        }
        _ => None,
    }
}

/// Map a source extension to its preprocessed language.
pub fn language_for_extension(extension: &str) -> Option<&'static str> {
    match extension {
        "c" | "i" => Some("cpp-output"),
        "cc" | "cp" | "cxx" | "cpp" | "CPP" | "c++" | "C" | "ii" => Some("c++-cpp-output"),
        "m" | "mi" => Some("objective-c-cpp-output"),
        "mm" | "M" | "mii" => Some("objective-c++-cpp-output"),
        _ => None,
    }
}

fn stripped_joined(arg: &str) -> bool {
    STRIPPED_PREFIXES
        .iter()
        .any(|prefix| arg.len() > prefix.len() && arg.starts_with(prefix))
}

/// Rewrite `command_line` (arguments after the compiler) for stdin input.
pub fn rewrite(command_line: &[String], options: &RewriteOptions) -> Result<Invocation, ArgumentError> {
    let mut kept: Vec<String> = Vec::with_capacity(command_line.len() + 6);
    let mut source: Option<(usize, String)> = None;
    let mut output: Option<(usize, String)> = None;
    let mut explicit_language: Option<String> = None;
    let mut assembly = false;

    let mut i = 0;
    while i < command_line.len() {
        let arg = &command_line[i];
        let next = || {
            command_line
                .get(i + 1)
                .cloned()
                .ok_or_else(|| ArgumentError::MissingValue(arg.clone()))
        };

        if STRIPPED_FLAGS_WITH_VALUES.contains(&arg.as_str()) {
            next()?;
            i += 2;
            continue;
        }
        if STRIPPED_BOOLEAN_FLAGS.contains(&arg.as_str()) || stripped_joined(arg) {
            i += 1;
            continue;
        }

        match arg.as_str() {
            "-o" => {
                let value = next()?;
                output = Some((kept.len(), value));
                kept.push(String::new());
                i += 2;
                continue;
            }
            "-x" => {
                explicit_language = Some(next()?);
                i += 2;
                continue;
            }
            "-S" => assembly = true,
            _ => {}
        }

        if let Some(value) = arg.strip_prefix("-o").filter(|v| !v.is_empty()) {
            output = Some((kept.len(), value.to_string()));
            kept.push(String::new());
            i += 1;
            continue;
        }
        if let Some(value) = arg.strip_prefix("-x").filter(|v| !v.is_empty()) {
            explicit_language = Some(value.to_string());
            i += 1;
            continue;
        }

        if FLAGS_WITH_VALUES.contains(&arg.as_str()) {
            let value = next()?;
            kept.push(arg.clone());
            kept.push(value);
            i += 2;
            continue;
        }

        if arg == "-" || !arg.starts_with('-') {
            if let Some((_, first)) = &source {
                return Err(ArgumentError::MultipleSources {
                    first: first.clone(),
                    second: arg.clone(),
                });
            }
            source = Some((kept.len(), arg.clone()));
            kept.push(String::new());
            i += 1;
            continue;
        }

        kept.push(arg.clone());
        i += 1;
    }

    let (source_slot, source) = source.ok_or(ArgumentError::NoSource)?;

    let language = match &explicit_language {
        Some(language) => preprocessed_language(language)
            .ok_or_else(|| ArgumentError::UnknownLanguage(language.clone()))?,
        None => {
            let extension = Path::new(&source)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("");
            language_for_extension(extension)
                .ok_or_else(|| ArgumentError::UnknownLanguage(extension.to_string()))?
        }
    };

    let requested_output = match &output {
        Some((_, path)) => path.clone(),
        None => {
            let stem = Path::new(&source)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("out");
            format!("{}.{}", stem, if assembly { "s" } else { "o" })
        }
    };
    let local_output = Path::new(&requested_output)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("out.o")
        .to_string();

    let mut args = Vec::with_capacity(kept.len() + 8);
    for (slot, arg) in kept.into_iter().enumerate() {
        if slot == source_slot {
            args.push("-x".to_string());
            args.push(language.to_string());
            args.push("-".to_string());
        } else if output.as_ref().map(|(s, _)| *s) == Some(slot) {
            args.push("-o".to_string());
            args.push(local_output.clone());
        } else {
            args.push(arg);
        }
    }
    if output.is_none() {
        args.push("-o".to_string());
        args.push(local_output.clone());
    }
    args.extend(options.kind.extra_flags().iter().map(|f| f.to_string()));

    Ok(Invocation {
        compiler: options.argv0.clone(),
        kind: options.kind,
        args,
        source,
        language,
        output: local_output,
        requested_output,
    })
}
