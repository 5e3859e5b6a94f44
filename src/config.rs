// Host-provided configuration
// The core receives paths and tunables by construction; nothing is read
// from process-wide state.

use std::path::PathBuf;
use std::time::Duration;

/// Default version literal passed as the first server argument. Must match
/// the artifact bundled on the host.
pub const DEFAULT_SERVER_VERSION: &str = "2.7";

/// First local TCP port used for session forwards.
pub const DEFAULT_PORT_BASE: u16 = 27183;

/// Default device registry poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Configuration handed to the engine by the host application.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Explicit adb path override; `None` falls through the locate() chain.
    pub adb_path: Option<PathBuf>,
    /// Host-side path of the server artifact pushed to devices.
    pub server_jar: PathBuf,
    /// Version literal passed verbatim to the on-device server.
    pub server_version: String,
    /// Device registry poll period.
    pub poll_interval: Duration,
    /// First local TCP port allocated for sessions.
    pub port_base: u16,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            adb_path: None,
            server_jar: PathBuf::from("scrcpy-server.jar"),
            server_version: DEFAULT_SERVER_VERSION.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            port_base: DEFAULT_PORT_BASE,
        }
    }
}
