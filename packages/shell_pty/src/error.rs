use std::fmt;
use std::time::Duration;

/// Which identity lookup was running when credential resolution failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupStep {
    /// Numeric uid of the restricted user
    Uid,
    /// Numeric primary gid of the restricted user
    Gid,
    /// Group membership list of the restricted user
    Groups,
    /// Numeric id of one group from the membership list
    GroupId,
}

impl fmt::Display for LookupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            LookupStep::Uid => "uid",
            LookupStep::Gid => "gid",
            LookupStep::Groups => "group membership",
            LookupStep::GroupId => "group id",
        };
        f.write_str(step)
    }
}

/// Errors raised while resolving the restricted user's identity
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to retrieve {step} for {name}: {reason}")]
    Query {
        step: LookupStep,
        name: String,
        reason: String,
    },

    #[error("invalid uid and gid for {name}: uid={uid} gid={gid}")]
    Invalid { name: String, uid: u32, gid: u32 },

    #[error("failed to provision {name}: {reason}")]
    Provision { name: String, reason: String },
}

impl CredentialError {
    pub(crate) fn query(step: LookupStep, name: &str, reason: impl fmt::Display) -> Self {
        CredentialError::Query {
            step,
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors that can occur during PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    /// Allocating the PTY or spawning the shell failed
    #[error("failed to start pty: {0}")]
    Start(String),

    /// Privilege drop was requested but the identity could not be resolved
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("set pty size failed: {0}")]
    Resize(String),

    #[error("unable to close pty: {0}")]
    Close(String),

    #[error("failed to wait for shell: {0}")]
    Wait(String),

    /// The operation needs a session and none was ever started
    #[error("no active pty session")]
    NotActive,
}

/// Errors produced while recording a transcript
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("shadow session failed: {0}")]
    Pty(#[from] PtyError),

    #[error("step '{step}' failed to write: {source}")]
    Write {
        step: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("step '{step}' did not complete within {after:?}")]
    Timeout { step: &'static str, after: Duration },

    /// The shell's output closed before the step's marker appeared
    #[error("session output closed during step '{step}'")]
    OutputClosed { step: &'static str },
}
