//! Running one compile job.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use fisk_compiler::{
    collect_outputs, rewrite, run, Invocation, Isolation, RewriteOptions, UserIdentity,
};
use fisk_protocol::{JobResponse, OutputEntry};
use tokio_util::sync::CancellationToken;

use crate::error::BuilderResult;
use crate::job::Job;

/// A finished compilation: the response and the output bytes in index
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compiled {
    pub response: JobResponse,
    pub contents: Vec<u8>,
}

/// Per-job scratch directory, removed on drop.
struct Sandbox(PathBuf);

impl Sandbox {
    fn create(path: PathBuf) -> io::Result<Self> {
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(Self(path))
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.0) {
            tracing::debug!(path = %self.0.display(), error = %e, "sandbox cleanup failed");
        }
    }
}

#[derive(Debug, Clone)]
pub struct Executor {
    jobs_dir: PathBuf,
    isolate: bool,
    user: Option<UserIdentity>,
}

impl Executor {
    /// `jobs_dir` holds sandboxes of non-isolated jobs and is emptied here.
    pub fn new(jobs_dir: PathBuf, isolate: bool, user: Option<UserIdentity>) -> io::Result<Self> {
        if jobs_dir.exists() {
            fs::remove_dir_all(&jobs_dir)?;
        }
        fs::create_dir_all(&jobs_dir)?;
        Ok(Self {
            jobs_dir,
            isolate,
            user,
        })
    }

    fn sandbox_path(&self, job: &Job, env_root: &Path) -> PathBuf {
        let name = format!("fisk-{}-{}", std::process::id(), job.id);
        if self.isolate {
            env_root.join("tmp").join(name)
        } else {
            self.jobs_dir.join(name)
        }
    }

    /// Compile `source` for `job` inside the environment at `env_root`.
    ///
    /// A failing compiler is a normal response; only unusable requests and
    /// infrastructure failures are errors. Outputs are returned only when
    /// the compiler succeeded.
    pub async fn compile(
        &self,
        job: &Job,
        digest: &str,
        env_root: &Path,
        source: Vec<u8>,
        cancel: CancellationToken,
    ) -> BuilderResult<Compiled> {
        let invocation = rewrite(&job.command_line, &RewriteOptions::for_compiler(&job.argv0))?;
        let sandbox = Sandbox::create(self.sandbox_path(job, env_root))?;
        let isolation = self.isolate.then(|| Isolation {
            root: env_root.to_path_buf(),
            user: self.user,
        });

        tracing::debug!(
            job = job.id,
            compiler = %invocation.compiler,
            source = %invocation.source,
            language = invocation.language,
            "compiling"
        );
        let output = run(&invocation, &sandbox.0, isolation.as_ref(), source, cancel).await?;

        let (index, contents) = if output.success() {
            read_outputs(&sandbox.0, &invocation).await?
        } else {
            (Vec::new(), Vec::new())
        };

        tracing::info!(
            job = job.id,
            exit_code = output.exit_code,
            outputs = index.len(),
            bytes = contents.len(),
            "compile finished"
        );
        Ok(Compiled {
            response: JobResponse::new(
                index,
                output.exit_code,
                digest.to_string(),
                output.stdout,
                output.stderr,
            ),
            contents,
        })
    }
}

async fn read_outputs(
    workdir: &Path,
    invocation: &Invocation,
) -> BuilderResult<(Vec<OutputEntry>, Vec<u8>)> {
    let collected = collect_outputs(workdir, invocation)?;
    let mut index = Vec::with_capacity(collected.len());
    let mut contents = Vec::new();
    for output in collected {
        let data = tokio::fs::read(&output.local).await?;
        index.push(OutputEntry {
            path: output.path,
            bytes: data.len() as u64,
        });
        contents.extend_from_slice(&data);
    }
    Ok((index, contents))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::BuilderError;
    use fisk_protocol::{JobHeaders, JobStart};
    use std::os::unix::fs::PermissionsExt;

    fn fake_compiler(dir: &Path, body: &str) -> String {
        let path = dir.join("cc");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn job(argv0: &str, args: &[&str]) -> Job {
        let headers = JobHeaders {
            environment: "env".into(),
            reservation: None,
            digest: None,
            source_file: Some("main.c".into()),
            name: None,
            hostname: None,
            user: None,
        };
        let start = JobStart {
            command_line: args.iter().map(|s| s.to_string()).collect(),
            argv0: argv0.into(),
            bytes: 0,
            wait: false,
        };
        Job::new(5, "127.0.0.1".into(), &headers, &start)
    }

    const COPY_TO_OUTPUT: &str = r#"out=""; prev=""
for a in "$@"; do [ "$prev" = "-o" ] && out="$a"; prev="$a"; done
cat > "$out"
printf 'notes' > "${out%.o}.gcno"
echo done"#;

    #[tokio::test]
    async fn test_outputs_in_index_order() {
        let tools = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let cc = fake_compiler(tools.path(), COPY_TO_OUTPUT);
        let executor = Executor::new(state.path().join("jobs"), false, None).unwrap();

        let compiled = executor
            .compile(
                &job(&cc, &["-c", "main.c", "-o", "build/main.o"]),
                "d1",
                state.path(),
                b"int x;".to_vec(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let response = &compiled.response;
        assert!(response.success);
        assert_eq!(response.digest, "d1");
        assert_eq!(response.stdout.trim(), "done");
        let paths: Vec<&str> = response.index.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["build/main.gcno", "build/main.o"]);
        assert_eq!(compiled.contents, b"notesint x;");
        assert_eq!(response.bytes, 11);
        assert_eq!(fs::read_dir(state.path().join("jobs")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failure_has_no_outputs() {
        let tools = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let cc = fake_compiler(tools.path(), "cat > main.o; echo 'error: bad' >&2; exit 1");
        let executor = Executor::new(state.path().join("jobs"), false, None).unwrap();

        let compiled = executor
            .compile(
                &job(&cc, &["-c", "main.c"]),
                "d2",
                state.path(),
                b"x".to_vec(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!compiled.response.success);
        assert_eq!(compiled.response.exit_code, 1);
        assert!(compiled.response.index.is_empty());
        assert!(compiled.response.stderr.contains("error: bad"));
    }

    #[tokio::test]
    async fn test_two_sources_rejected() {
        let state = tempfile::tempdir().unwrap();
        let executor = Executor::new(state.path().join("jobs"), false, None).unwrap();
        let err = executor
            .compile(
                &job("gcc", &["-c", "a.c", "b.c"]),
                "d3",
                state.path(),
                Vec::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BuilderError::Arguments(_)));
        assert_eq!(err.to_protocol().code, fisk_protocol::ErrorCode::InvalidJob);
    }
}
