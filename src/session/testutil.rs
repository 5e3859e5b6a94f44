// Shared test doubles for the session engine.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::adb::client::{ShellChild, Transport};
use crate::error::{Error, Result};

/// Install a subscriber so failing async tests can be rerun with RUST_LOG.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Counting transport double. Shell behavior mirrors what the launcher and
/// registry expect from a healthy device unless a failure flag is set.
pub(crate) struct MockTransport {
    pub push_count: AtomicUsize,
    pub forward_count: AtomicUsize,
    pub unforward_count: AtomicUsize,
    pub spawn_count: AtomicUsize,
    pub staged: AtomicBool,
    pub fail_push: AtomicBool,
    pub fail_forward: AtomicBool,
    pub sdk_level: Mutex<String>,
    pub spawned_commands: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            push_count: AtomicUsize::new(0),
            forward_count: AtomicUsize::new(0),
            unforward_count: AtomicUsize::new(0),
            spawn_count: AtomicUsize::new(0),
            staged: AtomicBool::new(false),
            fail_push: AtomicBool::new(false),
            fail_forward: AtomicBool::new(false),
            sdk_level: Mutex::new("34".to_string()),
            spawned_commands: Mutex::new(Vec::new()),
        }
    }
}

impl Transport for MockTransport {
    async fn shell(&self, _serial: &str, cmd: &str) -> Result<String> {
        if cmd.starts_with("ls -l ") {
            return if self.staged.load(Ordering::SeqCst) {
                Ok("-rw-r--r-- 1 shell shell 90000 scrcpy-server.jar".to_string())
            } else {
                Err(Error::AdbInvocation {
                    exit: 1,
                    stderr: "No such file or directory".to_string(),
                })
            };
        }
        if cmd == "getprop ro.build.version.sdk" {
            return Ok(self.sdk_level.lock().unwrap().clone());
        }
        Ok(String::new())
    }

    fn spawn_shell(&self, _serial: &str, cmd: &str) -> Result<ShellChild> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        self.spawned_commands.lock().unwrap().push(cmd.to_string());
        Ok(ShellChild::detached())
    }

    async fn push(&self, _serial: &str, _local: &Path, _remote: &str) -> Result<()> {
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(Error::AdbInvocation {
                exit: 1,
                stderr: "couldn't read from device".to_string(),
            });
        }
        self.push_count.fetch_add(1, Ordering::SeqCst);
        self.staged.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn forward(&self, _serial: &str, _local: u16, _spec: &str) -> Result<()> {
        if self.fail_forward.load(Ordering::SeqCst) {
            return Err(Error::AdbInvocation {
                exit: 1,
                stderr: "cannot bind listener".to_string(),
            });
        }
        self.forward_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unforward(&self, _serial: &str, _local: u16) -> Result<()> {
        self.unforward_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn devices_list(&self) -> Result<String> {
        Ok("List of devices attached\n".to_string())
    }
}
