use nix::pty::{Winsize, openpty};
use nix::unistd::{Gid, Uid, close, setgid, setgroups, setsid, setuid};
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use tracing::{error, info, warn};

use crate::config::ShellConfig;
use crate::credentials::{
    CredentialResolver, IdentityDatabase, NativeIdentityDb, PreprovisionedUser, UserCredential,
    UserProvisioner, to_gids,
};
use crate::error::PtyError;

nix::ioctl_write_ptr_bad!(set_window_size, nix::libc::TIOCSWINSZ, Winsize);

const TERM_KEY: &str = "TERM";
const HOME_KEY: &str = "HOME";
const LANG_KEY: &str = "LANG";

/// Program, arguments and environment for one shell spawn
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(OsString, OsString)>,
}

impl ShellCommand {
    /// Describe the shell for `shell_command` on top of `parent_env`.
    ///
    /// A blank command starts the interactive shell with no arguments. Anything
    /// else is handed to the shell as the single argument after the command
    /// flag, so the shell interprets it as a command line.
    pub fn new<I>(config: &ShellConfig, shell_command: &str, parent_env: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let args = if shell_command.trim().is_empty() {
            Vec::new()
        } else {
            vec![config.command_flag.clone(), shell_command.to_string()]
        };

        let mut env: Vec<(OsString, OsString)> = parent_env
            .into_iter()
            .filter(|(key, _)| key != TERM_KEY && key != HOME_KEY)
            .collect();

        // PTYs default to a minimal TERM that leaves full-screen editors garbled
        env.push((TERM_KEY.into(), config.term.clone().into()));
        env.push((HOME_KEY.into(), config.home_dir().into_os_string()));

        // Without LANG the shell falls back to a single-byte POSIX locale
        let has_lang = env.iter().any(|(key, value)| key == LANG_KEY && !value.is_empty());
        if !has_lang {
            env.retain(|(key, _)| key != LANG_KEY);
            env.push((LANG_KEY.into(), config.default_lang.clone().into()));
        }

        Self {
            program: config.shell.clone(),
            args,
            env,
        }
    }

    /// Value this command will see for `key`
    pub fn env_var(&self, key: &str) -> Option<&OsStr> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }
}

/// Caller-side handles onto the PTY master: one to write, one to read.
#[derive(Debug)]
pub struct PtyStreams {
    pub input: File,
    pub output: File,
}

/// One live PTY and the process on its subordinate side
#[derive(Debug)]
pub struct PtySession {
    master: Option<OwnedFd>,
    child: Child,
    cols: u16,
    rows: u16,
}

impl PtySession {
    /// Allocate a PTY and start `command` on it, under `credential` if given.
    pub fn spawn(
        command: &ShellCommand,
        credential: Option<&UserCredential>,
        cols: u16,
        rows: u16,
    ) -> Result<(Self, PtyStreams), PtyError> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pair = openpty(Some(&winsize), None)
            .map_err(|e| PtyError::Start(format!("openpty failed: {}", e)))?;
        // Neither end may survive exec: the child only gets its stdio copies
        set_cloexec(&pair.master)?;
        set_cloexec(&pair.slave)?;

        let subordinate = |fd: &OwnedFd| {
            fd.try_clone()
                .map(Stdio::from)
                .map_err(|e| PtyError::Start(format!("failed to duplicate pty: {}", e)))
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .env_clear()
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(subordinate(&pair.slave)?)
            .stdout(subordinate(&pair.slave)?)
            .stderr(subordinate(&pair.slave)?);

        let identity = credential.map(|c| {
            (
                Uid::from_raw(c.uid()),
                Gid::from_raw(c.gid()),
                to_gids(c.groups()),
            )
        });

        // Runs in the forked child: only async-signal-safe calls from here on.
        // Groups go first because setuid gives up the right to change them.
        let enter_session = move || -> io::Result<()> {
            setsid()?;
            if unsafe { nix::libc::ioctl(0, nix::libc::TIOCSCTTY as _, 0) } == -1 {
                return Err(io::Error::last_os_error());
            }
            if let Some((uid, gid, groups)) = &identity {
                setgroups(groups)?;
                setgid(*gid)?;
                setuid(*uid)?;
            }
            Ok(())
        };
        unsafe {
            cmd.pre_exec(enter_session);
        }

        info!(
            "Spawning pty command: {} with args: {:?}",
            command.program, command.args
        );
        let child = cmd.spawn().map_err(|e| {
            error!("Failed to start pty: {}", e);
            PtyError::Start(format!("failed to spawn {}: {}", command.program, e))
        })?;
        // The child holds its own copies of the subordinate side now
        drop(cmd);
        drop(pair.slave);

        info!("Pty process started with PID: {}", child.id());

        let duplicate = |fd: &OwnedFd| {
            fd.try_clone()
                .map(File::from)
                .map_err(|e| PtyError::Start(format!("failed to duplicate pty master: {}", e)))
        };
        let streams = PtyStreams {
            input: duplicate(&pair.master)?,
            output: duplicate(&pair.master)?,
        };

        let session = Self {
            master: Some(pair.master),
            child,
            cols,
            rows,
        };
        Ok((session, streams))
    }

    pub fn is_open(&self) -> bool {
        self.master.is_some()
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Current window size as `(cols, rows)`
    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    pub fn resize(&mut self, cols: u32, rows: u32) -> Result<(), PtyError> {
        let fd = self
            .master
            .as_ref()
            .ok_or_else(|| PtyError::Resize("pty is closed".into()))?;

        let ws_col = u16::try_from(cols)
            .map_err(|_| PtyError::Resize(format!("{} columns exceeds the platform limit", cols)))?;
        let ws_row = u16::try_from(rows)
            .map_err(|_| PtyError::Resize(format!("{} rows exceeds the platform limit", rows)))?;
        let winsize = Winsize {
            ws_row,
            ws_col,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        unsafe { set_window_size(fd.as_raw_fd(), &winsize) }
            .map_err(|e| PtyError::Resize(e.to_string()))?;

        self.cols = ws_col;
        self.rows = ws_row;
        Ok(())
    }

    /// Close the master. The child is neither signalled nor waited for.
    pub fn close(&mut self) -> Result<(), PtyError> {
        let fd = self
            .master
            .take()
            .ok_or_else(|| PtyError::Close("pty already closed".into()))?;
        close(fd.into_raw_fd()).map_err(|e| PtyError::Close(e.to_string()))
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait()
    }
}

fn set_cloexec(fd: &OwnedFd) -> Result<(), PtyError> {
    let rc = unsafe {
        nix::libc::fcntl(fd.as_raw_fd(), nix::libc::F_SETFD, nix::libc::FD_CLOEXEC)
    };
    if rc == -1 {
        return Err(PtyError::Start(format!(
            "failed to set close-on-exec on pty: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Lifecycle of the manager's session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Closed,
}

/// Owns at most one PTY-backed shell at a time
pub struct PtySessionManager<P = PreprovisionedUser, D = NativeIdentityDb> {
    config: ShellConfig,
    provisioner: P,
    resolver: CredentialResolver<D>,
    session: Option<PtySession>,
}

impl PtySessionManager {
    pub fn new(config: ShellConfig) -> Self {
        Self::with_identity(config, PreprovisionedUser, NativeIdentityDb)
    }
}

impl<P: UserProvisioner, D: IdentityDatabase> PtySessionManager<P, D> {
    pub fn with_identity(config: ShellConfig, provisioner: P, db: D) -> Self {
        let resolver = CredentialResolver::new(db, config.run_as_user.clone());
        Self {
            config,
            provisioner,
            resolver,
            session: None,
        }
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Start a shell on a fresh PTY and return handles onto its master.
    ///
    /// With `run_as_restricted_user` the shell runs as the configured account;
    /// if that identity cannot be resolved nothing is spawned.
    pub fn start(
        &mut self,
        run_as_restricted_user: bool,
        shell_command: &str,
    ) -> Result<PtyStreams, PtyError> {
        info!("Starting pty");
        let command = ShellCommand::new(&self.config, shell_command, std::env::vars_os());

        let credential = if run_as_restricted_user {
            self.provisioner.ensure_user(self.resolver.username())?;
            Some(self.resolver.resolve()?)
        } else {
            None
        };

        let (session, streams) = PtySession::spawn(
            &command,
            credential.as_ref(),
            self.config.cols,
            self.config.rows,
        )?;

        if let Some(mut previous) = self.session.replace(session) {
            if previous.is_open() {
                warn!("Replacing active pty (pid {})", previous.pid());
                if let Err(e) = previous.close() {
                    warn!("Failed to close replaced pty: {}", e);
                }
            }
        }

        Ok(streams)
    }

    pub fn stop(&mut self) -> Result<(), PtyError> {
        info!("Stopping pty");
        match self.session.as_mut() {
            Some(session) => session.close(),
            None => Err(PtyError::Close("no pty has been started".into())),
        }
    }

    pub fn set_size(&mut self, cols: u32, rows: u32) -> Result<(), PtyError> {
        match self.session.as_mut() {
            Some(session) => session.resize(cols, rows),
            None => Err(PtyError::Resize("no active pty session".into())),
        }
    }

    pub fn state(&self) -> SessionState {
        match &self.session {
            None => SessionState::Uninitialized,
            Some(session) if session.is_open() => SessionState::Active,
            Some(_) => SessionState::Closed,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.session.as_ref().map(PtySession::pid)
    }

    pub fn size(&self) -> Option<(u16, u16)> {
        self.session.as_ref().map(PtySession::size)
    }

    /// Exit status of the shell if it has already exited
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, PtyError> {
        let session = self.session.as_mut().ok_or(PtyError::NotActive)?;
        session
            .try_wait()
            .map_err(|e| PtyError::Wait(e.to_string()))
    }

    /// Block until the shell exits
    pub fn wait(&mut self) -> Result<ExitStatus, PtyError> {
        let session = self.session.as_mut().ok_or(PtyError::NotActive)?;
        session
            .wait()
            .map_err(|e| PtyError::Wait(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent(vars: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        vars.iter().map(|(k, v)| ((*k).into(), (*v).into())).collect()
    }

    #[test]
    fn test_blank_command_starts_interactive_shell() {
        let config = ShellConfig::default();
        for blank in ["", "   ", "\t\n"] {
            let cmd = ShellCommand::new(&config, blank, parent(&[]));
            assert_eq!(cmd.program, "sh");
            assert!(cmd.args.is_empty());
        }
    }

    #[test]
    fn test_command_line_is_single_argument() {
        let config = ShellConfig::default();
        let cmd = ShellCommand::new(&config, "ls -la /tmp | wc -l", parent(&[]));
        assert_eq!(cmd.args, vec!["-c", "ls -la /tmp | wc -l"]);
    }

    #[test]
    fn test_term_and_home_are_forced() {
        let config = ShellConfig {
            run_as_user: "auditor".into(),
            ..Default::default()
        };
        let cmd = ShellCommand::new(
            &config,
            "",
            parent(&[("TERM", "linux"), ("HOME", "/root"), ("PATH", "/bin")]),
        );
        assert_eq!(cmd.env_var("TERM"), Some(OsStr::new("xterm-256color")));
        assert_eq!(cmd.env_var("HOME"), Some(OsStr::new("/home/auditor")));
        assert_eq!(cmd.env_var("PATH"), Some(OsStr::new("/bin")));
        assert_eq!(cmd.env.iter().filter(|(k, _)| k == "TERM").count(), 1);
        assert_eq!(cmd.env.iter().filter(|(k, _)| k == "HOME").count(), 1);
    }

    #[test]
    fn test_existing_lang_is_kept() {
        let config = ShellConfig::default();
        let cmd = ShellCommand::new(&config, "", parent(&[("LANG", "de_DE.UTF-8")]));
        assert_eq!(cmd.env.iter().filter(|(k, _)| k == "LANG").count(), 1);
        assert_eq!(cmd.env_var("LANG"), Some(OsStr::new("de_DE.UTF-8")));
    }

    #[test]
    fn test_missing_or_empty_lang_gets_default() {
        let config = ShellConfig::default();
        let cmd = ShellCommand::new(&config, "", parent(&[]));
        assert_eq!(cmd.env_var("LANG"), Some(OsStr::new("C.UTF-8")));

        let cmd = ShellCommand::new(&config, "", parent(&[("LANG", "")]));
        assert_eq!(cmd.env.iter().filter(|(k, _)| k == "LANG").count(), 1);
        assert_eq!(cmd.env_var("LANG"), Some(OsStr::new("C.UTF-8")));
    }

    #[test]
    fn test_manager_starts_uninitialized() {
        let mut manager = PtySessionManager::new(ShellConfig::default());
        assert_eq!(manager.state(), SessionState::Uninitialized);
        assert!(manager.pid().is_none());
        assert!(matches!(manager.try_wait(), Err(PtyError::NotActive)));
    }
}
