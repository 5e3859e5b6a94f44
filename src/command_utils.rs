// Cross-platform command utilities
// Helpers for running adb without flashing terminal windows on Windows

use std::ffi::OsStr;
use tokio::process::Command;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Extension trait for `tokio::process::Command` to hide the console window
/// on Windows. A no-op elsewhere.
pub trait CommandWindowExt {
    fn hide_window(&mut self) -> &mut Self;
}

impl CommandWindowExt for Command {
    #[cfg(target_os = "windows")]
    fn hide_window(&mut self) -> &mut Self {
        self.creation_flags(CREATE_NO_WINDOW);
        self
    }

    #[cfg(not(target_os = "windows"))]
    fn hide_window(&mut self) -> &mut Self {
        self
    }
}

/// Create a new command with the console window hidden on Windows.
pub fn hidden_command<S: AsRef<OsStr>>(program: S) -> Command {
    let mut cmd = Command::new(program);
    cmd.hide_window();
    cmd
}
