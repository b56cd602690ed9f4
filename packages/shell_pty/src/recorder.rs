//! Transcript recording through a disposable shell.
//!
//! The recorder drives its own PTY shell through a fixed script: enlarge the
//! screen buffer, start the record program on the transcript file, replay the
//! real session with the session logger, then unwind the three shell layers.
//!
//! Every step is confirmed before the next one is sent, by waiting for a
//! marker that only a shell executing `printf` can produce:
//!
//! - a command that opens a nested shell is followed by a `printf` typed into
//!   that new shell, and carries a second `printf` on its own line that the
//!   outer shell runs once the layer ends;
//! - a command that stays in the current shell carries its marker on the same
//!   line;
//! - `exit` is never followed by typed-ahead input, since a layer on its way
//!   out may swallow it. It waits for the leave marker of the layer it closes,
//!   or for end of output when it closes the outermost shell.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::{RecorderConfig, RecordingTarget, ShellConfig};
use crate::error::{PtyError, RecordError};
use crate::pty::{PtySessionManager, SessionState};

const MARKER_PREFIX: &str = "__shell_pty_";
const READ_CHUNK: usize = 4096;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a scripted step is known to be finished
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Opens a nested shell; done when that shell answers a typed marker
    EnterLayer,
    /// Runs in the current shell; done when the marker chained after it prints
    Inline,
    /// `exit`; done when the enclosing shell reports the layer has ended
    LeaveLayer,
}

/// One line typed into the disposable shell
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptedCommand {
    pub label: &'static str,
    pub text: String,
    pub completion: Completion,
    pub timeout: Duration,
}

/// The ordered commands that produce a transcript of `target`
pub fn recording_script(config: &RecorderConfig, target: &RecordingTarget) -> Vec<ScriptedCommand> {
    let step = |label, text: String, completion, limit| ScriptedCommand {
        label,
        text,
        completion,
        timeout: limit,
    };

    vec![
        step(
            "screen buffer",
            format!("{} -h {}", config.screen_program, config.screen_buffer_size),
            Completion::EnterLayer,
            config.step_timeout(),
        ),
        step(
            "start recording",
            format!("{} {}", config.record_program, quote_path(&target.log_file)),
            Completion::EnterLayer,
            config.step_timeout(),
        ),
        step(
            "session logger",
            format!(
                "{} {} {}",
                quote_path(&config.session_logger),
                quote_path(&target.ipc_file),
                target.logger_blocking
            ),
            Completion::Inline,
            config.logger_timeout(),
        ),
        step(
            "exit recording",
            "exit".to_string(),
            Completion::LeaveLayer,
            config.exit_timeout(),
        ),
        step(
            "exit screen",
            "exit".to_string(),
            Completion::LeaveLayer,
            config.exit_timeout(),
        ),
        step(
            "exit shell",
            "exit".to_string(),
            Completion::LeaveLayer,
            config.exit_timeout(),
        ),
    ]
}

/// Command that prints the `kind` marker for `seq`, and the marker itself.
///
/// The marker is split across two `printf` arguments so the terminal's echo of
/// the typed line never contains it.
pub(crate) fn marker(kind: &str, seq: usize) -> (String, String) {
    let suffix = format!("{}_{}__", kind, seq);
    let command = format!("printf '%s%s\\n' '{}' '{}'", MARKER_PREFIX, suffix);
    (command, format!("{}{}", MARKER_PREFIX, suffix))
}

fn quote_path(path: &Path) -> String {
    let text = path.to_string_lossy();
    let plain = text
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@%".contains(c));
    if plain && !text.is_empty() {
        text.into_owned()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}

/// Output of the disposable shell, fed by a blocking reader thread
struct OutputWatcher {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl OutputWatcher {
    fn spawn(mut output: File) -> Self {
        let (tx, rx) = mpsc::channel(256);
        std::thread::spawn(move || {
            let mut buffer = vec![0u8; READ_CHUNK];
            loop {
                match output.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO once every process on the subordinate side is gone
                    Err(e) => {
                        debug!("Recorder pty read ended: {}", e);
                        break;
                    }
                }
            }
            debug!("Recorder reader thread exiting");
        });
        Self {
            rx,
            pending: Vec::new(),
        }
    }

    /// Consume output up to and including `needle`. False if output ended first.
    async fn wait_for(&mut self, needle: &[u8]) -> bool {
        loop {
            if let Some(pos) = self
                .pending
                .windows(needle.len())
                .position(|window| window == needle)
            {
                self.pending.drain(..pos + needle.len());
                return true;
            }
            let keep = needle.len().saturating_sub(1).min(self.pending.len());
            self.pending.drain(..self.pending.len() - keep);

            match self.rx.recv().await {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => return false,
            }
        }
    }

    async fn wait_for_eof(&mut self) {
        while self.rx.recv().await.is_some() {}
        self.pending.clear();
    }
}

/// The disposable session, released on every way out of a recording
struct ShadowSession {
    manager: PtySessionManager,
    input: Option<File>,
}

impl ShadowSession {
    fn write_line(&mut self, step: &'static str, text: &str) -> Result<(), RecordError> {
        let input = self.input.as_mut().ok_or_else(|| RecordError::Write {
            step,
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pty input closed"),
        })?;
        input
            .write_all(format!("{}\n", text).as_bytes())
            .and_then(|_| input.flush())
            .map_err(|source| RecordError::Write { step, source })
    }

    fn close_input(&mut self) {
        self.input.take();
    }

    fn release(&mut self) -> Result<(), PtyError> {
        self.close_input();
        if self.manager.state() == SessionState::Active {
            self.manager.stop()
        } else {
            Ok(())
        }
    }
}

impl Drop for ShadowSession {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!("Error occurred while closing pty: {}", e);
        }
    }
}

async fn await_marker(
    watcher: &mut OutputWatcher,
    step: &'static str,
    expected: &str,
    after: Duration,
) -> Result<(), RecordError> {
    match timeout(after, watcher.wait_for(expected.as_bytes())).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(RecordError::OutputClosed { step }),
        Err(_) => Err(RecordError::Timeout { step, after }),
    }
}

/// Records a transcript by scripting a throwaway shell
pub struct SessionRecorder {
    shell: ShellConfig,
    config: RecorderConfig,
}

impl SessionRecorder {
    pub fn new(shell: ShellConfig, config: RecorderConfig) -> Self {
        Self { shell, config }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Produce the transcript at `target.log_file`.
    ///
    /// Returns once the disposable shell has exited and been reaped, so the
    /// record program has flushed the file.
    pub async fn generate_log_data(&self, target: &RecordingTarget) -> Result<(), RecordError> {
        info!(
            "Recording session transcript to {}",
            target.log_file.display()
        );

        let mut manager = PtySessionManager::new(self.shell.clone());
        let streams = manager.start(false, "")?;
        let mut shadow = ShadowSession {
            manager,
            input: Some(streams.input),
        };
        let mut watcher = OutputWatcher::spawn(streams.output);

        if let Err(e) = self.run_script(&mut shadow, &mut watcher, target).await {
            warn!("Recording aborted: {}", e);
            if let Err(close_err) = shadow.release() {
                error!("Error occurred while closing pty: {}", close_err);
            }
            return Err(e);
        }

        shadow.release()?;
        self.await_shell_exit(&mut shadow).await?;

        info!("Session transcript written to {}", target.log_file.display());
        Ok(())
    }

    async fn run_script(
        &self,
        shadow: &mut ShadowSession,
        watcher: &mut OutputWatcher,
        target: &RecordingTarget,
    ) -> Result<(), RecordError> {
        let (ready, expected) = marker("ready", 0);
        shadow.write_line("shell prompt", &ready)?;
        await_marker(watcher, "shell prompt", &expected, self.config.prompt_timeout()).await?;

        // Sequence numbers of the nested shells still open, innermost last
        let mut layers = Vec::new();

        for (i, step) in recording_script(&self.config, target).into_iter().enumerate() {
            let seq = i + 1;
            debug!(step = step.label, "Sending {:?}", step.text);

            match step.completion {
                Completion::EnterLayer => {
                    let (leave, _) = marker("left", seq);
                    shadow.write_line(step.label, &format!("{}; {}", step.text, leave))?;
                    let (ready, expected) = marker("ready", seq);
                    shadow.write_line(step.label, &ready)?;
                    await_marker(watcher, step.label, &expected, step.timeout).await?;
                    layers.push(seq);
                }
                Completion::Inline => {
                    let (ready, expected) = marker("ready", seq);
                    shadow.write_line(step.label, &format!("{}; {}", step.text, ready))?;
                    await_marker(watcher, step.label, &expected, step.timeout).await?;
                }
                Completion::LeaveLayer => {
                    shadow.write_line(step.label, &step.text)?;
                    match layers.pop() {
                        Some(entered) => {
                            let (_, expected) = marker("left", entered);
                            await_marker(watcher, step.label, &expected, step.timeout).await?;
                        }
                        None => {
                            timeout(step.timeout, watcher.wait_for_eof())
                                .await
                                .map_err(|_| RecordError::Timeout {
                                    step: step.label,
                                    after: step.timeout,
                                })?;
                        }
                    }
                }
            }
            debug!(step = step.label, "Step complete");
        }

        shadow.close_input();
        Ok(())
    }

    async fn await_shell_exit(&self, shadow: &mut ShadowSession) -> Result<(), RecordError> {
        let after = self.config.flush_timeout();
        let reaped = timeout(after, async {
            loop {
                match shadow.manager.try_wait() {
                    Ok(Some(status)) => return Ok(status),
                    Ok(None) => sleep(EXIT_POLL_INTERVAL).await,
                    Err(e) => return Err(e),
                }
            }
        })
        .await
        .map_err(|_| RecordError::Timeout {
            step: "flush transcript",
            after,
        })??;

        debug!("Recorder shell exited with {}", reaped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn target() -> RecordingTarget {
        RecordingTarget {
            log_file: PathBuf::from("/var/log/sessions/s-1.log"),
            ipc_file: PathBuf::from("/var/lib/sessions/s-1/ipcTempFile.log"),
            logger_blocking: false,
        }
    }

    #[test]
    fn test_script_order_and_text() {
        let script = recording_script(&RecorderConfig::default(), &target());
        let lines: Vec<&str> = script.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(
            lines,
            vec![
                "screen -h 30000",
                "script /var/log/sessions/s-1.log",
                "/usr/bin/session-logger /var/lib/sessions/s-1/ipcTempFile.log false",
                "exit",
                "exit",
                "exit",
            ]
        );
    }

    #[test]
    fn test_every_entered_layer_is_left() {
        let script = recording_script(&RecorderConfig::default(), &target());
        let completions: Vec<Completion> = script.iter().map(|s| s.completion).collect();
        assert_eq!(
            completions,
            vec![
                Completion::EnterLayer,
                Completion::EnterLayer,
                Completion::Inline,
                Completion::LeaveLayer,
                Completion::LeaveLayer,
                Completion::LeaveLayer,
            ]
        );
    }

    #[test]
    fn test_logger_step_uses_logger_timeout() {
        let config = RecorderConfig {
            logger_timeout_secs: 120,
            ..Default::default()
        };
        let script = recording_script(&config, &target());
        assert_eq!(script[2].label, "session logger");
        assert_eq!(script[2].timeout, Duration::from_secs(120));
        assert_eq!(script[0].timeout, config.step_timeout());
    }

    #[test]
    fn test_blocking_flag_is_rendered() {
        let target = RecordingTarget {
            logger_blocking: true,
            ..target()
        };
        let script = recording_script(&RecorderConfig::default(), &target);
        assert!(script[2].text.ends_with(" true"));
    }

    #[test]
    fn test_paths_with_spaces_are_quoted() {
        assert_eq!(quote_path(Path::new("/tmp/a b.log")), "'/tmp/a b.log'");
        assert_eq!(quote_path(Path::new("/tmp/it's")), r"'/tmp/it'\''s'");
        assert_eq!(quote_path(Path::new("/tmp/plain.log")), "/tmp/plain.log");
    }

    #[test]
    fn test_marker_not_in_typed_command() {
        let (command, expected) = marker("ready", 3);
        assert_eq!(expected, "__shell_pty_ready_3__");
        assert!(!command.contains(&expected));

        let (command, expected) = marker("left", 1);
        assert_eq!(expected, "__shell_pty_left_1__");
        assert!(!command.contains(&expected));
    }

    #[tokio::test]
    async fn test_watcher_finds_marker_across_chunks() {
        let (tx, rx) = mpsc::channel(8);
        let mut watcher = OutputWatcher {
            rx,
            pending: Vec::new(),
        };
        tx.send(b"$ printf ... __shell_pty_re".to_vec()).await.unwrap();
        tx.send(b"ady_1__\r\n$ ".to_vec()).await.unwrap();
        assert!(watcher.wait_for(b"__shell_pty_ready_1__").await);
        assert_eq!(watcher.pending, b"\r\n$ ");

        drop(tx);
        assert!(!watcher.wait_for(b"__shell_pty_ready_2__").await);
    }
}
