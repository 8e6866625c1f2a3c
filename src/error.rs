// ============================================================================
// src/error.rs – Step-tagged error taxonomy for the recovery workflow
// ============================================================================

use std::fmt;
use std::io;

use crate::mode::RecoveryMode;

/// Every externally visible operation the workflow performs. Errors carry the
/// step so the orchestrator can tell the operator exactly where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    GenuineCheck,
    ResolveDevice,
    DisableSwap,
    MeasureUtility,
    MeasureTree,
    ZeroBootSector,
    Partition,
    WriteMbr,
    RestoreUtility,
    MakeFilesystem,
    MountRecovery,
    CopyTree,
    InstallBootloader,
    RegenerateUuid,
    StageKernel,
    UnmountRecovery,
    SetActive,
    RemovePartition,
    RemountSource,
    BindSource,
    ReleaseSource,
    StageHelpers,
    Eject,
    KernelExec,
    Reboot,
    AnswerStore,
}

impl Step {
    pub fn label(self) -> &'static str {
        match self {
            Step::GenuineCheck => "genuine platform check",
            Step::ResolveDevice => "resolve target device",
            Step::DisableSwap => "disable swap",
            Step::MeasureUtility => "measure utility image",
            Step::MeasureTree => "measure recovery tree",
            Step::ZeroBootSector => "zero boot sector",
            Step::Partition => "write partition table",
            Step::WriteMbr => "write MBR bootstrap",
            Step::RestoreUtility => "restore utility partition",
            Step::MakeFilesystem => "create recovery filesystem",
            Step::MountRecovery => "mount recovery partition",
            Step::CopyTree => "copy recovery tree",
            Step::InstallBootloader => "install bootloader",
            Step::RegenerateUuid => "regenerate live UUID",
            Step::StageKernel => "stage kernel reload",
            Step::UnmountRecovery => "unmount recovery partition",
            Step::SetActive => "mark recovery partition active",
            Step::RemovePartition => "remove extra partition",
            Step::RemountSource => "remount installation medium",
            Step::BindSource => "bind installation medium",
            Step::ReleaseSource => "release installation medium",
            Step::StageHelpers => "stage reboot helpers",
            Step::Eject => "eject installation medium",
            Step::KernelExec => "execute staged kernel",
            Step::Reboot => "reboot",
            Step::AnswerStore => "answer store",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("{step}: `{command}` failed (exit {status})\nstdout: {stdout}\nstderr: {stderr}")]
    CommandFailed {
        step: Step,
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    #[error("{step}: unable to spawn `{command}`: {source}")]
    Spawn {
        step: Step,
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{step}: `{command}` is not in the command allowlist")]
    NotAllowed { step: Step, command: String },

    #[error("{step}: `{command}` timed out after {secs}s")]
    Timeout {
        step: Step,
        command: String,
        secs: u64,
    },

    #[error("{step}: `{command}` produced unexpected output: {output}")]
    UnexpectedOutput {
        step: Step,
        command: String,
        output: String,
    },

    #[error("{step}: {context}: {source}")]
    Io {
        step: Step,
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid tree filter: {0}")]
    Filter(#[from] regex::Error),

    #[error("answer store: {0}")]
    Store(String),

    #[error("recovery mode `{0}` cannot proceed until a recovery type is selected")]
    ModeBlocked(RecoveryMode),

    #[error("recovery mode `{0}` is not offered on this platform")]
    NotGenuine(RecoveryMode),

    #[error("build worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("build worker exited without reporting an outcome")]
    WorkerLost,
}

impl RecoveryError {
    pub fn io(step: Step, context: impl Into<String>, source: io::Error) -> Self {
        RecoveryError::Io {
            step,
            context: context.into(),
            source,
        }
    }

    /// The step that failed, when the failure belongs to one.
    pub fn step(&self) -> Option<Step> {
        match self {
            RecoveryError::CommandFailed { step, .. }
            | RecoveryError::Spawn { step, .. }
            | RecoveryError::NotAllowed { step, .. }
            | RecoveryError::Timeout { step, .. }
            | RecoveryError::UnexpectedOutput { step, .. }
            | RecoveryError::Io { step, .. } => Some(*step),
            RecoveryError::Store(_) => Some(Step::AnswerStore),
            RecoveryError::NotGenuine(_) => Some(Step::GenuineCheck),
            RecoveryError::Filter(_) => Some(Step::MeasureTree),
            RecoveryError::ModeBlocked(_)
            | RecoveryError::WorkerPanicked(_)
            | RecoveryError::WorkerLost => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
