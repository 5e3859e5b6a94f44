// ADB Client - Low-level adb process execution
// Locates the adb binary, runs one-shot commands with a wall-clock timeout,
// spawns streaming shells, and exposes the file/port plumbing sessions need.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::adb::command_builder::{AdbCommand, AdbCommandBuilder};
use crate::command_utils::hidden_command;
use crate::error::{Error, Result};

/// Wall-clock timeout for one-shot adb commands.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Platform-specific adb executable name.
fn adb_executable_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "adb.exe"
    } else {
        "adb"
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// A long-running `adb shell` child with line-streamed output.
#[derive(Debug)]
pub struct ShellChild {
    child: Option<Child>,
    pub stdout: mpsc::UnboundedReceiver<String>,
    pub stderr: mpsc::UnboundedReceiver<String>,
}

impl ShellChild {
    fn from_child(mut child: Child) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, out_tx);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, err_tx);
        }
        Self {
            child: Some(child),
            stdout: out_rx,
            stderr: err_rx,
        }
    }

    /// A handle with no underlying process. Used by transport test doubles.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let (_err_tx, err_rx) = mpsc::unbounded_channel();
        Self {
            child: None,
            stdout: out_rx,
            stderr: err_rx,
        }
    }

    /// Whether the child process has already exited.
    pub fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => false,
        }
    }

    /// Kill the child and reap it.
    pub async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!("shell child kill: {e}");
            }
            let _ = child.wait().await;
        }
    }
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Production adb transport. Owns the resolved adb path; every operation is
/// a child-process invocation against it.
pub struct AdbClient {
    adb_path: PathBuf,
}

impl AdbClient {
    /// Initialize a client, resolving the adb path through the locate chain.
    pub fn new(configured: Option<&Path>) -> Self {
        Self {
            adb_path: Self::locate(configured),
        }
    }

    /// Initialize a client with a specific adb path, bypassing locate().
    pub fn with_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            adb_path: path.as_ref().to_path_buf(),
        }
    }

    /// The adb path in use.
    pub fn adb_path(&self) -> &Path {
        &self.adb_path
    }

    /// Resolve the adb binary: explicit override, then the bundled copy in
    /// the per-user data directory, then well-known SDK locations, then the
    /// bare name resolved through PATH.
    pub fn locate(configured: Option<&Path>) -> PathBuf {
        if let Some(path) = configured {
            if is_executable(path) {
                return path.to_path_buf();
            }
            warn!("configured adb path {} is not executable", path.display());
        }

        if let Some(data_dir) = dirs::data_dir() {
            let bundled = data_dir
                .join("devicecast")
                .join("platform-tools")
                .join(adb_executable_name());
            if is_executable(&bundled) {
                return bundled;
            }
        }

        for candidate in Self::sdk_candidates() {
            if is_executable(&candidate) {
                return candidate;
            }
        }

        PathBuf::from(adb_executable_name())
    }

    /// Well-known SDK install locations for the current OS.
    fn sdk_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        for var in ["ANDROID_HOME", "ANDROID_SDK_ROOT"] {
            if let Some(root) = std::env::var_os(var) {
                candidates.push(
                    PathBuf::from(root)
                        .join("platform-tools")
                        .join(adb_executable_name()),
                );
            }
        }
        if cfg!(target_os = "macos") {
            if let Some(home) = dirs::home_dir() {
                candidates.push(
                    home.join("Library")
                        .join("Android")
                        .join("sdk")
                        .join("platform-tools")
                        .join(adb_executable_name()),
                );
            }
        } else if cfg!(target_os = "windows") {
            if let Some(local) = dirs::data_local_dir() {
                candidates.push(
                    local
                        .join("Android")
                        .join("Sdk")
                        .join("platform-tools")
                        .join(adb_executable_name()),
                );
            }
        } else if let Some(home) = dirs::home_dir() {
            candidates.push(
                home.join("Android")
                    .join("Sdk")
                    .join("platform-tools")
                    .join(adb_executable_name()),
            );
        }
        candidates
    }

    /// Run one adb command to completion, enforcing the 30 s timeout.
    async fn run(&self, args: Vec<String>) -> Result<std::process::Output> {
        trace!("adb {}", args.join(" "));
        let mut cmd = hidden_command(&self.adb_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::AdbMissing
            } else {
                Error::Io(e)
            }
        })?;

        let output = match timeout(EXEC_TIMEOUT, child.wait_with_output()).await {
            Ok(result) => result?,
            // kill_on_drop reaps the abandoned child
            Err(_) => return Err(Error::AdbTimeout),
        };

        if !output.status.success() {
            return Err(Error::AdbInvocation {
                exit: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    fn build_args(command: AdbCommand, serial: Option<&str>) -> Vec<String> {
        let mut builder = AdbCommandBuilder::new();
        if let Some(serial) = serial {
            builder = builder.target(serial);
        }
        builder.build(command)
    }

    /// Run a command and capture stdout as text.
    pub async fn exec(&self, command: AdbCommand, serial: Option<&str>) -> Result<String> {
        let output = self.run(Self::build_args(command, serial)).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a command and capture raw stdout bytes (`exec-out` payloads).
    pub async fn exec_bytes(&self, command: AdbCommand, serial: Option<&str>) -> Result<Vec<u8>> {
        let output = self.run(Self::build_args(command, serial)).await?;
        Ok(output.stdout)
    }

    /// Capture a PNG screenshot via `exec-out screencap -p`. Decoding is the
    /// caller's concern.
    pub async fn screencap(&self, serial: &str) -> Result<Vec<u8>> {
        self.exec_bytes(
            AdbCommand::ExecOut(vec!["screencap".into(), "-p".into()]),
            Some(serial),
        )
        .await
    }

    /// Start the host-side adb server.
    pub async fn start_server(&self) -> Result<()> {
        self.exec(AdbCommand::StartServer, None).await.map(|_| ())
    }

    /// Kill the host-side adb server.
    pub async fn kill_server(&self) -> Result<()> {
        self.exec(AdbCommand::KillServer, None).await.map(|_| ())
    }
}

/// The transport abstraction the session engine depends on. Implemented by
/// [`AdbClient`] in production and by counting doubles in tests.
pub trait Transport: Send + Sync + 'static {
    /// Run a shell command on the device and capture its output.
    fn shell(
        &self,
        serial: &str,
        cmd: &str,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Spawn a long-running shell; output is surfaced as line streams.
    fn spawn_shell(&self, serial: &str, cmd: &str) -> Result<ShellChild>;

    /// Push a local file to a device path.
    fn push(
        &self,
        serial: &str,
        local: &Path,
        remote: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Forward a local TCP port to a device socket spec.
    fn forward(
        &self,
        serial: &str,
        local_tcp: u16,
        remote_spec: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Remove a previously established forward.
    fn unforward(
        &self,
        serial: &str,
        local_tcp: u16,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Raw output of `adb devices -l`.
    fn devices_list(&self) -> impl std::future::Future<Output = Result<String>> + Send;
}

impl Transport for AdbClient {
    async fn shell(&self, serial: &str, cmd: &str) -> Result<String> {
        self.exec(AdbCommand::Shell(cmd.to_string()), Some(serial))
            .await
    }

    fn spawn_shell(&self, serial: &str, cmd: &str) -> Result<ShellChild> {
        debug!("spawning shell on {serial}: {cmd}");
        let args = Self::build_args(AdbCommand::Shell(cmd.to_string()), Some(serial));
        let mut command = hidden_command(&self.adb_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::AdbMissing
            } else {
                Error::Io(e)
            }
        })?;
        Ok(ShellChild::from_child(child))
    }

    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<()> {
        self.exec(
            AdbCommand::Push {
                local: local.to_string_lossy().into_owned(),
                remote: remote.to_string(),
            },
            Some(serial),
        )
        .await
        .map(|_| ())
    }

    async fn forward(&self, serial: &str, local_tcp: u16, remote_spec: &str) -> Result<()> {
        self.exec(
            AdbCommand::Forward {
                local_tcp,
                remote_spec: remote_spec.to_string(),
            },
            Some(serial),
        )
        .await
        .map(|_| ())
    }

    async fn unforward(&self, serial: &str, local_tcp: u16) -> Result<()> {
        self.exec(AdbCommand::ForwardRemove { local_tcp }, Some(serial))
            .await
            .map(|_| ())
    }

    async fn devices_list(&self) -> Result<String> {
        self.exec(AdbCommand::Devices { long: true }, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_custom_path() {
        let path = PathBuf::from("/usr/local/bin/adb_test");
        let client = AdbClient::with_path(&path);
        assert_eq!(client.adb_path(), path.as_path());
    }

    #[test]
    fn test_locate_falls_back_to_path_name() {
        // A non-existent override falls through to the bare executable name.
        let missing = PathBuf::from("/definitely/not/here/adb");
        let resolved = AdbClient::locate(Some(&missing));
        assert!(
            resolved == PathBuf::from(adb_executable_name()) || resolved.exists(),
            "fallback must be the PATH name or a real install"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_prefers_executable_override() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("adb");
        std::fs::write(&fake, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(AdbClient::locate(Some(&fake)), fake);
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_skips_non_executable_override() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("adb");
        std::fs::write(&fake, b"").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o644)).unwrap();

        assert_ne!(AdbClient::locate(Some(&fake)), fake);
    }

    #[tokio::test]
    async fn test_missing_binary_maps_to_adb_missing() {
        let client = AdbClient::with_path("/definitely/not/here/adb");
        let err = client.devices_list().await.unwrap_err();
        assert!(matches!(err, Error::AdbMissing));
    }
}
