use nix::pty::Winsize;
use nix::sys::termios::{self, SetArg, Termios};
use std::io::{self, IsTerminal};
use std::os::fd::AsRawFd;

nix::ioctl_read_bad!(get_window_size, nix::libc::TIOCGWINSZ, Winsize);

// RAII guard to restore terminal settings on drop
pub struct TerminalGuard {
    original: Option<Termios>,
}

impl TerminalGuard {
    /// Put stdin in raw mode if it is a terminal
    pub fn raw() -> Self {
        let stdin = io::stdin();
        let original = if stdin.is_terminal() {
            termios::tcgetattr(&stdin).ok()
        } else {
            None
        };

        if let Some(ref saved) = original {
            let mut raw = saved.clone();
            termios::cfmakeraw(&mut raw);
            let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw);
        }
        Self { original }
    }

    pub fn is_raw(&self) -> bool {
        self.original.is_some()
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Some(ref saved) = self.original {
            let _ = termios::tcsetattr(&io::stdin(), SetArg::TCSANOW, saved);
        }
    }
}

/// Size of the controlling terminal as `(cols, rows)`
pub fn window_size() -> Option<(u32, u32)> {
    let stdout = io::stdout();
    if !stdout.is_terminal() {
        return None;
    }

    let mut ws = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe { get_window_size(stdout.as_raw_fd(), &mut ws) }.ok()?;

    if ws.ws_col == 0 || ws.ws_row == 0 {
        None
    } else {
        Some((u32::from(ws.ws_col), u32::from(ws.ws_row)))
    }
}
