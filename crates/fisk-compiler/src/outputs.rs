//! Mapping produced files back to the paths the client expects.

use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::args::Invocation;

/// Auxiliary outputs that follow the object file's location.
const SIDE_OUTPUT_SUFFIXES: &[&str] = &["gcno", "gcda", "dwo"];

/// One produced file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedOutput {
    /// Path reported to the client.
    pub path: String,
    /// Where the file lives now.
    pub local: PathBuf,
    pub bytes: u64,
}

/// Walk `workdir` and name every produced file.
///
/// The declared output and same-stem side outputs are reported under the
/// directory of the requested output; anything else keeps its path relative
/// to `workdir`. Results are ordered by the local path.
pub fn collect_outputs(workdir: &Path, invocation: &Invocation) -> io::Result<Vec<CollectedOutput>> {
    let requested = Path::new(&invocation.requested_output);
    let requested_dir = requested.parent().unwrap_or_else(|| Path::new(""));
    let output_stem = Path::new(&invocation.output)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");

    let mut outputs = Vec::new();
    for entry in WalkDir::new(workdir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let local = entry.path().to_path_buf();
        let relative = local.strip_prefix(workdir).unwrap_or(&local).to_path_buf();

        let path = if relative == Path::new(&invocation.output) {
            invocation.requested_output.clone()
        } else if is_side_output(&relative, output_stem) {
            requested_dir.join(&relative).to_string_lossy().into_owned()
        } else {
            relative.to_string_lossy().into_owned()
        };

        outputs.push(CollectedOutput {
            path,
            bytes: entry.metadata().map_err(io::Error::from)?.len(),
            local,
        });
    }
    Ok(outputs)
}

fn is_side_output(relative: &Path, stem: &str) -> bool {
    if relative.parent().map_or(false, |p| !p.as_os_str().is_empty()) {
        return false;
    }
    let file_stem = relative.file_stem().and_then(|s| s.to_str());
    let extension = relative.extension().and_then(|e| e.to_str());
    match (file_stem, extension) {
        (Some(file_stem), Some(extension)) => {
            file_stem == stem && SIDE_OUTPUT_SUFFIXES.contains(&extension)
        }
        _ => false,
    }
}
