use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info};

use crate::listener::{ListenerHandle, INHERITED_FD};

/// Tells a new process to adopt its listener from [`INHERITED_FD`].
pub const REBORN_FLAG: &str = "-g";
const REBORN_LONG_FLAG: &str = "--graceful";

#[derive(Error, Debug)]
pub enum SuccessorError {
    #[error("Unable to extract the listener descriptor: {0}")]
    DescriptorExtraction(#[source] io::Error),
    #[error("Unable to spawn successor {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A detached child started with the listener at [`INHERITED_FD`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessorProcess {
    pub pid: u32,
    pub inherited_fd: RawFd,
    pub reborn: bool,
}

pub trait Launch: Send + Sync {
    fn launch(&self, listener: &ListenerHandle) -> Result<SuccessorProcess, SuccessorError>;
}

/// Re-runs this program with the current arguments.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: PathBuf, args: Vec<OsString>) -> Self {
        Self { program, args }
    }

    pub fn from_env() -> io::Result<Self> {
        Ok(Self::new(current_program()?, successor_args(std::env::args_os())))
    }
}

impl Launch for ProcessLauncher {
    fn launch(&self, listener: &ListenerHandle) -> Result<SuccessorProcess, SuccessorError> {
        spawn_successor(listener, &self.program, &self.args)
    }
}

/// Starts `program` with `base_args` plus [`REBORN_FLAG`] and a duplicate of
/// the listener at [`INHERITED_FD`]. The child is not waited on.
pub fn spawn_successor(
    listener: &ListenerHandle,
    program: &Path,
    base_args: &[OsString],
) -> Result<SuccessorProcess, SuccessorError> {
    let descriptor = listener
        .duplicate()
        .map_err(SuccessorError::DescriptorExtraction)?;
    let source_fd = descriptor.as_raw_fd();

    let mut cmd = Command::new(program);
    cmd.args(base_args)
        .arg(REBORN_FLAG)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    debug!(?cmd, source_fd, "Spawning successor");

    unsafe {
        cmd.pre_exec(move || place_inherited(source_fd));
    }

    let child = cmd.spawn().map_err(|source| SuccessorError::Spawn {
        program: program.to_path_buf(),
        source,
    })?;
    let pid = child.id();

    // Detached: the successor outlives us and is never waited on.
    drop(child);
    drop(descriptor);

    info!(pid, program = %program.display(), "Forked successor");

    Ok(SuccessorProcess {
        pid,
        inherited_fd: INHERITED_FD,
        reborn: true,
    })
}

/// Runs in the forked child before exec, so only async-signal-safe calls.
fn place_inherited(source_fd: RawFd) -> io::Result<()> {
    if source_fd == INHERITED_FD {
        // dup2 onto itself keeps close-on-exec set.
        let flags = unsafe { libc::fcntl(source_fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(source_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    } else if unsafe { libc::dup2(source_fd, INHERITED_FD) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Arguments for the successor: everything after the program name, minus
/// any reborn flag already present.
pub fn successor_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .skip(1)
        .filter(|arg| {
            arg.as_os_str() != OsStr::new(REBORN_FLAG)
                && arg.as_os_str() != OsStr::new(REBORN_LONG_FLAG)
        })
        .collect()
}

pub fn current_program() -> io::Result<PathBuf> {
    match std::env::args_os().next() {
        Some(program) if !program.is_empty() => Ok(PathBuf::from(program)),
        _ => std::env::current_exe(),
    }
}
