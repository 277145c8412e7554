//! Fork-and-exec of the handover child with an explicit descriptor table.
//!
//! Descriptors are staged in two phases so no source is clobbered:
//! 1. In the parent, each table entry is duplicated with `F_DUPFD_CLOEXEC`
//!    to a slot at or above the table length
//! 2. In the forked child, each staged slot is `dup2`'d onto its table
//!    position (which clears CLOEXEC on the target)
//!
//! Staged slots and everything else opened through `std` are close-on-exec,
//! so the exec'd image sees exactly the table and nothing more.

use crate::fdtable::DescriptorTable;
use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tracing::{debug, info};

/// What to execute for the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTarget {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Variables added to (or overriding) the inherited environment.
    pub env: Vec<(OsString, OsString)>,
}

impl LaunchTarget {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// The running executable with the arguments it was started with.
    pub fn current_process() -> io::Result<Self> {
        let program = std::env::current_exe()?;
        let args = std::env::args_os().skip(1).collect();
        Ok(Self {
            program,
            args,
            env: Vec::new(),
        })
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Launch `target` with `table` as its descriptors 0..N.
///
/// Returns as soon as the child has exec'd; the child is not waited on.
/// On error no child exists and none of the table's descriptors have been
/// consumed.
pub fn launch(target: &LaunchTarget, table: &DescriptorTable) -> io::Result<Child> {
    let floor = RawFd::try_from(table.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "descriptor table too large"))?;

    let staged = table
        .fds()
        .map(|fd| dup_above(fd, floor))
        .collect::<io::Result<Vec<OwnedFd>>>()?;
    let slots: Vec<RawFd> = staged.iter().map(|fd| fd.as_raw_fd()).collect();

    debug!(staged = ?slots, "Staged descriptors for child");

    let mut command = Command::new(&target.program);
    command
        .args(&target.args)
        .envs(target.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    // SAFETY: the closure runs between fork and exec and only calls dup2,
    // which is async-signal-safe. `slots` is allocated before the fork and
    // only read here.
    unsafe {
        command.pre_exec(move || {
            for (position, &slot) in slots.iter().enumerate() {
                if libc::dup2(slot, position as RawFd) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    drop(staged);

    info!(
        pid = child.id(),
        program = %target.program.display(),
        inherited = table.len(),
        "Launched handover child"
    );

    Ok(child)
}

fn dup_above(fd: BorrowedFd<'_>, floor: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: fcntl on a borrowed, open descriptor.
    let dup = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `dup` is a fresh descriptor nothing else refers to.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}
