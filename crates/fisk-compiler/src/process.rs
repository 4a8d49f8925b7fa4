//! Compiler subprocess lifecycle.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::args::Invocation;

/// Exit code reported when the OS gives none (killed by a signal).
pub const ABNORMAL_EXIT_CODE: i32 = 110;

/// Time between SIGTERM and SIGKILL on cancellation.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// Unprivileged identity to drop to inside the isolated root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIdentity {
    pub uid: u32,
    pub gid: u32,
}

/// Filesystem root (and optional identity) the compiler runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Isolation {
    /// Extracted environment; becomes `/` for the compiler.
    pub root: PathBuf,
    pub user: Option<UserIdentity>,
}

impl Isolation {
    /// Path of `workdir` as seen from inside the root.
    pub fn inner_path(&self, workdir: &Path) -> Result<PathBuf, ProcessError> {
        let relative = workdir
            .strip_prefix(&self.root)
            .map_err(|_| ProcessError::OutsideRoot {
                workdir: workdir.to_path_buf(),
                root: self.root.clone(),
            })?;
        Ok(Path::new("/").join(relative))
    }
}

/// Errors from running a compiler.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {compiler}: {source}")]
    Spawn {
        compiler: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error talking to compiler: {0}")]
    Io(#[from] io::Error),

    #[error("working directory {workdir} is not inside isolation root {root}")]
    OutsideRoot { workdir: PathBuf, root: PathBuf },

    #[error("compilation cancelled")]
    Cancelled,
}

/// What a finished compiler produced on its standard streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    /// Terminating signal, if the process was killed.
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

fn build_command(
    invocation: &Invocation,
    workdir: &Path,
    isolation: Option<&Isolation>,
) -> Result<Command, ProcessError> {
    let mut cmd = Command::new(&invocation.compiler);
    cmd.args(&invocation.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match isolation {
        None => {
            cmd.current_dir(workdir);
        }
        Some(isolation) => {
            let inner = isolation.inner_path(workdir)?;
            apply_isolation(&mut cmd, isolation.root.clone(), inner, isolation.user)?;
        }
    }
    Ok(cmd)
}

#[cfg(unix)]
fn c_path(path: PathBuf) -> Result<std::ffi::CString, ProcessError> {
    use std::os::unix::ffi::OsStringExt;

    std::ffi::CString::new(path.into_os_string().into_vec()).map_err(|e| {
        ProcessError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("isolation path contains a NUL byte at {}", e.nul_position()),
        ))
    })
}

#[cfg(unix)]
fn apply_isolation(
    cmd: &mut Command,
    root: PathBuf,
    inner: PathBuf,
    user: Option<UserIdentity>,
) -> Result<(), ProcessError> {
    use nix::unistd::{chdir, chroot, setgid, setuid, Gid, Uid};

    let root = c_path(root)?;
    let inner = c_path(inner)?;
    let ids = user.map(|u| (Gid::from_raw(u.gid), Uid::from_raw(u.uid)));

    // SAFETY: everything the closure touches is built above. Inside it only
    // passes `CStr`s and stack values to async-signal-safe syscalls, and
    // errno converts into an `io::Error` without allocating.
    unsafe {
        cmd.pre_exec(move || {
            chroot(root.as_c_str()).map_err(io::Error::from)?;
            chdir(inner.as_c_str()).map_err(io::Error::from)?;
            if let Some((gid, uid)) = ids {
                #[cfg(target_os = "linux")]
                nix::unistd::setgroups(&[gid]).map_err(io::Error::from)?;
                setgid(gid).map_err(io::Error::from)?;
                setuid(uid).map_err(io::Error::from)?;
            }
            Ok(())
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_isolation(
    cmd: &mut Command,
    root: PathBuf,
    inner: PathBuf,
    _user: Option<UserIdentity>,
) -> Result<(), ProcessError> {
    cmd.current_dir(root.join(inner.strip_prefix("/").unwrap_or(&inner)));
    Ok(())
}

/// Run `invocation` in `workdir` with `source` on stdin.
///
/// Cancelling `cancel` terminates the compiler (SIGTERM, then SIGKILL after
/// [`TERMINATION_GRACE`]) and returns [`ProcessError::Cancelled`].
pub async fn run(
    invocation: &Invocation,
    workdir: &Path,
    isolation: Option<&Isolation>,
    source: Vec<u8>,
    cancel: CancellationToken,
) -> Result<ProcessOutput, ProcessError> {
    let mut cmd = build_command(invocation, workdir, isolation)?;
    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        compiler: invocation.compiler.clone(),
        source,
    })?;
    tracing::debug!(
        compiler = %invocation.compiler,
        pid = ?child.id(),
        args = ?invocation.args,
        "compiler started"
    );

    let stdin = child.stdin.take();
    let stdin_task = tokio::spawn(async move {
        if let Some(mut stdin) = stdin {
            // A compiler that exits early closes the pipe; its exit status
            // tells the real story.
            let _ = stdin.write_all(&source).await;
            let _ = stdin.shutdown().await;
        }
    });
    let stdout_task = tokio::spawn(read_all(child.stdout.take()));
    let stderr_task = tokio::spawn(read_all(child.stderr.take()));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            terminate(&mut child).await;
            stdin_task.abort();
            return Err(ProcessError::Cancelled);
        }
    };

    let _ = stdin_task.await;
    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    let signal = exit_signal(&status);
    let exit_code = status.code().unwrap_or(ABNORMAL_EXIT_CODE);
    tracing::debug!(compiler = %invocation.compiler, exit_code, ?signal, "compiler exited");

    Ok(ProcessOutput {
        exit_code,
        signal,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_end(&mut buf).await;
    }
    buf
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Terminate gracefully, then forcefully.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(TERMINATION_GRACE, child.wait()).await.is_ok() {
                return;
            }
        }
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
}
