//! Shell PTY - one PTY-backed shell at a time, optionally as a restricted user
//!
//! This crate starts an interactive shell (or a single command line) on a
//! pseudo-terminal and hands the caller the PTY master as input/output
//! streams. It can drop the shell to a restricted local account, resolving the
//! account's uid, gid and supplementary groups first, and it can record a
//! transcript by scripting a disposable shell through `screen` and `script`.
//!
//! # Example
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use shell_pty::{PtySessionManager, ShellConfig};
//!
//! let mut manager = PtySessionManager::new(ShellConfig::default());
//! let mut streams = manager.start(false, "").unwrap();
//!
//! manager.set_size(120, 40).unwrap();
//! streams.input.write_all(b"echo hello\n").unwrap();
//!
//! let mut buf = [0u8; 1024];
//! let n = streams.output.read(&mut buf).unwrap();
//! println!("{}", String::from_utf8_lossy(&buf[..n]));
//!
//! manager.stop().unwrap();
//! ```

pub mod config;
pub mod credentials;
mod error;
pub mod pty;
pub mod recorder;

pub use config::{IdentityLookup, RecorderConfig, RecordingTarget, ShellConfig};
pub use credentials::{
    CommandIdentityDb, CredentialResolver, IdentityDatabase, NativeIdentityDb, PreprovisionedUser,
    UserCredential, UserProvisioner,
};
pub use error::{CredentialError, LookupStep, PtyError, RecordError};
pub use pty::{PtySession, PtySessionManager, PtyStreams, SessionState, ShellCommand};
pub use recorder::SessionRecorder;
