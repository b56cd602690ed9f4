use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::{CommandIdentityDb, IdentityDatabase, NativeIdentityDb};

/// Where the restricted user's identity is looked up
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityLookup {
    /// passwd/group database calls
    #[default]
    Native,
    /// `id`, `groups` and `getent` output
    Command,
}

impl IdentityLookup {
    pub fn database(self) -> Box<dyn IdentityDatabase> {
        match self {
            IdentityLookup::Native => Box::new(NativeIdentityDb),
            IdentityLookup::Command => Box::new(CommandIdentityDb),
        }
    }
}

/// How the interactive shell is launched (lives under `[shell]` in config.toml).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Program used for both the interactive shell and single command lines
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Flag that makes `shell` interpret its next argument as a command line
    #[serde(default = "default_command_flag")]
    pub command_flag: String,
    /// Restricted local account the shell drops to when asked
    #[serde(default = "default_run_as_user")]
    pub run_as_user: String,
    #[serde(default)]
    pub identity_lookup: IdentityLookup,
    /// HOME handed to the child. Defaults to `/home/<run_as_user>`.
    #[serde(default)]
    pub home_dir: Option<PathBuf>,
    #[serde(default = "default_term")]
    pub term: String,
    /// LANG used only when the parent environment has none
    #[serde(default = "default_lang")]
    pub default_lang: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            command_flag: default_command_flag(),
            run_as_user: default_run_as_user(),
            identity_lookup: IdentityLookup::default(),
            home_dir: None,
            term: default_term(),
            default_lang: default_lang(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

impl ShellConfig {
    pub fn home_dir(&self) -> PathBuf {
        self.home_dir
            .clone()
            .unwrap_or_else(|| Path::new("/home").join(&self.run_as_user))
    }
}

fn default_shell() -> String {
    "sh".to_string()
}
fn default_command_flag() -> String {
    "-c".to_string()
}
fn default_run_as_user() -> String {
    "session-user".to_string()
}
fn default_term() -> String {
    "xterm-256color".to_string()
}
fn default_lang() -> String {
    "C.UTF-8".to_string()
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}

/// Tunables for transcript recording (lives under `[recorder]` in config.toml).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default = "default_screen_program")]
    pub screen_program: String,
    /// Scrollback lines requested from the screen program
    #[serde(default = "default_screen_buffer_size")]
    pub screen_buffer_size: u32,
    #[serde(default = "default_record_program")]
    pub record_program: String,
    /// Helper that replays the real session's IPC file into the recording
    #[serde(default = "default_session_logger")]
    pub session_logger: PathBuf,
    #[serde(default = "default_prompt_timeout_secs")]
    pub prompt_timeout_secs: u64,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_logger_timeout_secs")]
    pub logger_timeout_secs: u64,
    #[serde(default = "default_exit_timeout_secs")]
    pub exit_timeout_secs: u64,
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            screen_program: default_screen_program(),
            screen_buffer_size: default_screen_buffer_size(),
            record_program: default_record_program(),
            session_logger: default_session_logger(),
            prompt_timeout_secs: default_prompt_timeout_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            logger_timeout_secs: default_logger_timeout_secs(),
            exit_timeout_secs: default_exit_timeout_secs(),
            flush_timeout_secs: default_flush_timeout_secs(),
        }
    }
}

impl RecorderConfig {
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn logger_timeout(&self) -> Duration {
        Duration::from_secs(self.logger_timeout_secs)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_timeout_secs)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout_secs)
    }
}

fn default_screen_program() -> String {
    "screen".to_string()
}
fn default_screen_buffer_size() -> u32 {
    30000
}
fn default_record_program() -> String {
    "script".to_string()
}
fn default_session_logger() -> PathBuf {
    PathBuf::from("/usr/bin/session-logger")
}
fn default_prompt_timeout_secs() -> u64 {
    30
}
fn default_step_timeout_secs() -> u64 {
    60
}
fn default_logger_timeout_secs() -> u64 {
    300
}
fn default_exit_timeout_secs() -> u64 {
    60
}
fn default_flush_timeout_secs() -> u64 {
    30
}

/// Where a recording lands
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingTarget {
    /// Transcript written by the record program
    pub log_file: PathBuf,
    /// IPC file the session logger reads the real session from
    pub ipc_file: PathBuf,
    /// Whether the session logger runs in blocking mode
    #[serde(default)]
    pub logger_blocking: bool,
}
