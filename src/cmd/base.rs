// ============================================================================
// src/cmd/base.rs – Allowlisted external command runner (storage + boot tools)
// ============================================================================

use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{RecoveryError, Result, Step};

/// Helpers the workflow is allowed to spawn, matched on the program basename
/// so staged copies (`/tmp/reboot`, `<medium>/misc/kexec`) stay permitted.
const ALLOWED: &[&str] = &[
    "ata_id",
    "casper-new-uuid",
    "dd",
    "debconf-communicate",
    "eject",
    "fdisk",
    "grub-install",
    "gzip",
    "kexec",
    "ln",
    "mkfs.msdos",
    "mount",
    "parted",
    "reboot",
    "rsync",
    "sfdisk",
    "swapoff",
    "udevadm",
    "umount",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    /// Elevated for the duration of this single invocation only.
    Root,
}

/// One external command: program, arguments, optional stdin bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub privilege: Privilege,
}

impl Invocation {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            stdin: None,
            privilege: Privilege::User,
        }
    }

    pub fn root(program: impl AsRef<str>) -> Self {
        Self {
            privilege: Privilege::Root,
            ..Self::new(program)
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Basename of the program, used for allowlisting and test matching.
    pub fn program_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.program)
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputData {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl OutputData {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// The only boundary between the workflow and the host's storage tooling.
pub trait CommandRunner: Send + Sync {
    fn run(&self, step: Step, invocation: &Invocation) -> Result<OutputData>;

    /// Stream `from`'s stdout into `into`'s stdin. A failure of either side
    /// is reported as the returned status.
    fn pipe(&self, step: Step, from: &Invocation, into: &Invocation) -> Result<OutputData>;
}

/// Run and turn a non-zero exit into a step-tagged error.
pub fn run_checked(
    runner: &dyn CommandRunner,
    step: Step,
    invocation: &Invocation,
) -> Result<OutputData> {
    let out = runner.run(step, invocation)?;
    ensure_success(step, &invocation.command_line(), out)
}

pub fn pipe_checked(
    runner: &dyn CommandRunner,
    step: Step,
    from: &Invocation,
    into: &Invocation,
) -> Result<OutputData> {
    let out = runner.pipe(step, from, into)?;
    let command = format!("{} | {}", from.command_line(), into.command_line());
    ensure_success(step, &command, out)
}

fn ensure_success(step: Step, command: &str, out: OutputData) -> Result<OutputData> {
    if out.success() {
        return Ok(out);
    }
    Err(RecoveryError::CommandFailed {
        step,
        command: command.to_string(),
        status: out.status,
        stdout: out.stdout.trim().to_string(),
        stderr: out.stderr.trim().to_string(),
    })
}

/// Real runner backed by `std::process`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    elevate: Vec<String>,
    timeout: Option<Duration>,
    extra_allowed: Vec<String>,
}

impl SystemRunner {
    pub fn new(elevate: Vec<String>, timeout: Option<Duration>) -> Self {
        Self {
            elevate,
            timeout,
            extra_allowed: Vec::new(),
        }
    }

    /// Permit one more program basename (e.g. a configured vendor check).
    pub fn allow(mut self, program: impl AsRef<str>) -> Self {
        let name = Path::new(program.as_ref())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.as_ref().to_string());
        self.extra_allowed.push(name);
        self
    }

    fn check_allowed(&self, step: Step, invocation: &Invocation) -> Result<()> {
        let name = invocation.program_name();
        if ALLOWED.contains(&name) || self.extra_allowed.iter().any(|p| p == name) {
            return Ok(());
        }
        Err(RecoveryError::NotAllowed {
            step,
            command: invocation.command_line(),
        })
    }

    fn command(&self, invocation: &Invocation) -> Command {
        let needs_prefix = invocation.privilege == Privilege::Root
            && !self.elevate.is_empty()
            && !nix::unistd::geteuid().is_root();
        let mut cmd = if needs_prefix {
            let mut cmd = Command::new(&self.elevate[0]);
            cmd.args(&self.elevate[1..]).arg(&invocation.program);
            cmd
        } else {
            Command::new(&invocation.program)
        };
        cmd.args(&invocation.args);
        cmd
    }

    fn spawn(&self, step: Step, invocation: &Invocation, stdin: Stdio) -> Result<Child> {
        self.check_allowed(step, invocation)?;
        debug!(step = %step, command = %invocation.command_line(), "spawn");
        self.command(invocation)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RecoveryError::Spawn {
                step,
                command: invocation.command_line(),
                source,
            })
    }

    /// Start a long-running command whose stdout the caller reads line by
    /// line. The caller owns the child and must kill and reap it.
    pub fn stream(&self, step: Step, invocation: &Invocation) -> Result<Child> {
        self.check_allowed(step, invocation)?;
        debug!(step = %step, command = %invocation.command_line(), "stream");
        self.command(invocation)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| RecoveryError::Spawn {
                step,
                command: invocation.command_line(),
                source,
            })
    }

    fn wait(&self, step: Step, command: &str, mut child: Child) -> Result<OutputData> {
        let io_err = |source: std::io::Error| {
            RecoveryError::io(step, format!("waiting for `{command}`"), source)
        };

        if let Some(timeout) = self.timeout {
            let start = Instant::now();
            while child.try_wait().map_err(io_err)?.is_none() {
                if start.elapsed() > timeout {
                    // Best effort terminate, then kill.
                    {
                        use nix::sys::signal::{kill, Signal::SIGTERM};
                        use nix::unistd::Pid;
                        let _ = kill(Pid::from_raw(child.id() as i32), SIGTERM);
                    }
                    thread::sleep(Duration::from_millis(200));
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RecoveryError::Timeout {
                        step,
                        command: command.to_string(),
                        secs: timeout.as_secs(),
                    });
                }
                thread::sleep(Duration::from_millis(30));
            }
        }

        let out = child.wait_with_output().map_err(io_err)?;
        Ok(OutputData {
            status: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, step: Step, invocation: &Invocation) -> Result<OutputData> {
        let stdin = if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut child = self.spawn(step, invocation, stdin)?;

        if let Some(bytes) = &invocation.stdin {
            if let Some(mut sin) = child.stdin.take() {
                sin.write_all(bytes)
                    .map_err(|e| RecoveryError::io(step, "writing stdin", e))?;
            }
        }

        self.wait(step, &invocation.command_line(), child)
    }

    fn pipe(&self, step: Step, from: &Invocation, into: &Invocation) -> Result<OutputData> {
        self.check_allowed(step, into)?;
        let mut producer = self.spawn(step, from, Stdio::null())?;
        let stream = producer.stdout.take().ok_or_else(|| {
            RecoveryError::io(
                step,
                format!("capturing stdout of `{}`", from.command_line()),
                std::io::Error::from(std::io::ErrorKind::BrokenPipe),
            )
        })?;

        let consumer = match self.spawn(step, into, Stdio::from(stream)) {
            Ok(child) => child,
            Err(err) => {
                let _ = producer.kill();
                let _ = producer.wait();
                return Err(err);
            }
        };
        let consumed = self.wait(step, &into.command_line(), consumer)?;
        let produced = self.wait(step, &from.command_line(), producer)?;

        if !produced.success() {
            return Ok(produced);
        }
        Ok(consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_tools_are_allowlisted() {
        let runner = SystemRunner::new(Vec::new(), None);
        for program in ["/sbin/fdisk", "mkfs.msdos", "/tmp/reboot", "/cdrom/misc/kexec"] {
            assert!(
                runner
                    .check_allowed(Step::Partition, &Invocation::new(program))
                    .is_ok(),
                "expected {program} to be allowlisted"
            );
        }
    }

    #[test]
    fn unknown_programs_are_refused() {
        let runner = SystemRunner::new(Vec::new(), None);
        let err = runner
            .run(Step::CopyTree, &Invocation::new("/bin/sh").arg("-c"))
            .unwrap_err();
        assert!(matches!(err, RecoveryError::NotAllowed { .. }));
    }

    #[test]
    fn extra_programs_can_be_permitted() {
        let runner = SystemRunner::new(Vec::new(), None).allow("/usr/sbin/vendor-check");
        assert!(runner
            .check_allowed(Step::GenuineCheck, &Invocation::new("vendor-check"))
            .is_ok());
    }

    #[test]
    fn root_invocations_are_prefixed_when_unprivileged() {
        let runner = SystemRunner::new(vec!["sudo".into(), "-n".into()], None);
        let cmd = runner.command(&Invocation::root("swapoff").arg("/dev/sda5"));
        if nix::unistd::geteuid().is_root() {
            assert_eq!(cmd.get_program(), "swapoff");
        } else {
            assert_eq!(cmd.get_program(), "sudo");
            let args: Vec<_> = cmd.get_args().collect();
            assert_eq!(args, ["-n", "swapoff", "/dev/sda5"]);
        }
    }

    #[test]
    fn refused_consumer_starts_nothing() {
        let runner = SystemRunner::new(Vec::new(), None);
        let err = runner
            .pipe(
                Step::RestoreUtility,
                &Invocation::new("dd").arg("if=/dev/zero"),
                &Invocation::new("/bin/sh"),
            )
            .unwrap_err();
        assert!(matches!(err, RecoveryError::NotAllowed { .. }));
    }

    #[test]
    fn producer_is_reaped_when_consumer_cannot_spawn() {
        let runner = SystemRunner::new(Vec::new(), Some(Duration::from_secs(5)));
        let start = Instant::now();
        let err = runner
            .pipe(
                Step::RestoreUtility,
                &Invocation::new("dd").arg("if=/dev/zero"),
                &Invocation::new("/nonexistent/bin/dd").arg("of=/dev/null"),
            )
            .unwrap_err();
        assert!(matches!(err, RecoveryError::Spawn { .. }), "{err:?}");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn stream_respects_allowlist() {
        let runner = SystemRunner::new(Vec::new(), None);
        let err = runner
            .stream(Step::Eject, &Invocation::new("tail").arg("-f"))
            .unwrap_err();
        assert!(matches!(err, RecoveryError::NotAllowed { .. }));
        assert!(runner
            .check_allowed(Step::Eject, &Invocation::new("/bin/udevadm"))
            .is_ok());
    }

    #[test]
    fn non_zero_exit_is_step_tagged() {
        let out = OutputData {
            status: 2,
            stdout: "partial\n".into(),
            stderr: "boom\n".into(),
        };
        let err = ensure_success(Step::Partition, "fdisk /dev/sda", out).unwrap_err();
        match err {
            RecoveryError::CommandFailed {
                step,
                command,
                status,
                stdout,
                stderr,
            } => {
                assert_eq!(step, Step::Partition);
                assert_eq!(command, "fdisk /dev/sda");
                assert_eq!(status, 2);
                assert_eq!(stdout, "partial");
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn command_line_joins_arguments() {
        let inv = Invocation::root("dd")
            .arg("if=/dev/zero")
            .args(["of=/dev/sda", "bs=1024", "count=1"]);
        assert_eq!(inv.command_line(), "dd if=/dev/zero of=/dev/sda bs=1024 count=1");
        assert_eq!(inv.privilege, Privilege::Root);
    }
}
