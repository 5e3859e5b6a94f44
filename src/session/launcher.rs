// Server Launcher - Stages and supervises the on-device server process
// Pushes the server artifact when absent, forwards a local TCP port to the
// session's abstract socket, and launches the server inside an adb shell
// with a fully specified argument vector.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::adb::client::{ShellChild, Transport};
use crate::error::{Error, Result};

/// On-device location of the server artifact, shared by all sessions on a
/// device.
pub const SERVER_DEVICE_PATH: &str = "/data/local/tmp/scrcpy-server.jar";

/// Settle time between spawning the server and dialing the first socket,
/// so the device can create its abstract socket.
pub const SPAWN_SETTLE: Duration = Duration::from_secs(1);

/// Devices below this SDK level (Android 11) cannot capture audio.
const MIN_AUDIO_SDK: u32 = 30;

/// Abstract socket name for a session id.
pub fn socket_name(scid: u32) -> String {
    format!("scrcpy_{scid:08x}")
}

/// Audio codec requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum AudioCodec {
    /// 16-bit signed PCM, stereo, 48 kHz.
    Raw,
    Aac,
    Opus,
}

impl AudioCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioCodec::Raw => "raw",
            AudioCodec::Aac => "aac",
            AudioCodec::Opus => "opus",
        }
    }
}

/// Per-session options recognized by the launcher.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionOptions {
    /// Video bit rate in bits per second.
    pub bitrate: u32,
    /// Longest dimension of the encoded video; 0 keeps the native size.
    pub max_size: u32,
    pub max_fps: u32,
    pub audio: bool,
    pub audio_codec: AudioCodec,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            bitrate: 8_000_000,
            max_size: 0,
            max_fps: 60,
            audio: true,
            audio_codec: AudioCodec::Raw,
        }
    }
}

/// A launched server: its identity, forward port and shell child.
#[derive(Debug)]
pub struct LaunchedServer {
    pub scid: u32,
    pub port: u16,
    /// Whether audio was actually requested from the server, after the
    /// per-device capability downgrade.
    pub audio: bool,
    pub child: ShellChild,
}

/// Builds the single server command line. Argument order is fixed; the
/// server rejects unknown orderings.
fn server_command(version: &str, options: &SessionOptions, scid: u32, audio: bool) -> String {
    format!(
        "CLASSPATH={SERVER_DEVICE_PATH} app_process / com.genymobile.scrcpy.Server {version} \
         scid={scid:08x} log_level=info video=true audio={audio} \
         audio_codec={audio_codec} control=true max_size={max_size} max_fps={max_fps} \
         video_bit_rate={bitrate} video_codec=h264 video_encoder= tunnel_forward=true \
         send_device_meta=true send_codec_meta=true send_frame_meta=true \
         send_dummy_byte=true raw_stream=false",
        audio_codec = options.audio_codec.as_str(),
        max_size = options.max_size,
        max_fps = options.max_fps,
        bitrate = options.bitrate,
    )
}

/// Stages and launches the on-device server for one session.
pub struct Launcher<T: Transport> {
    transport: Arc<T>,
    server_jar: PathBuf,
    server_version: String,
}

impl<T: Transport> Launcher<T> {
    pub fn new(transport: Arc<T>, server_jar: PathBuf, server_version: String) -> Self {
        Self {
            transport,
            server_jar,
            server_version,
        }
    }

    /// Run the launch procedure: stage, prepare, forward, spawn, settle.
    /// A failure after the forward is rolled back; `launch` never leaves
    /// partial state behind.
    pub async fn launch(
        &self,
        serial: &str,
        options: &SessionOptions,
        scid: u32,
        port: u16,
    ) -> Result<LaunchedServer> {
        self.stage(serial).await?;

        // Keep the soft keyboard usable while a hardware keyboard is
        // attached through the control stream. Not fatal if rejected.
        if let Err(e) = self
            .transport
            .shell(serial, "settings put secure show_ime_with_hard_keyboard 0")
            .await
        {
            debug!("show_ime_with_hard_keyboard setting failed on {serial}: {e}");
        }

        let audio = options.audio && self.audio_supported(serial).await;

        self.transport
            .forward(serial, port, &format!("localabstract:{}", socket_name(scid)))
            .await
            .map_err(|e| Error::PortForward(e.to_string()))?;

        let command = server_command(&self.server_version, options, scid, audio);
        let child = match self.transport.spawn_shell(serial, &command) {
            Ok(child) => child,
            Err(e) => {
                let _ = self.transport.unforward(serial, port).await;
                return Err(Error::ServerSpawn(e.to_string()));
            }
        };
        info!("launched server {} on {serial}, port {port}", socket_name(scid));

        // Give the server time to create its abstract socket before the
        // connector dials.
        sleep(SPAWN_SETTLE).await;
        Ok(LaunchedServer {
            scid,
            port,
            audio,
            child,
        })
    }

    /// Stop procedure: kill the shell child, drop the forward, and
    /// best-effort kill any server left on the device.
    pub async fn stop(&self, serial: &str, port: u16, child: &mut ShellChild) {
        child.kill().await;
        if let Err(e) = self.transport.unforward(serial, port).await {
            debug!("forward removal for {serial}:{port} failed: {e}");
        }
        if let Err(e) = self.transport.shell(serial, "pkill -f scrcpy-server").await {
            debug!("server pkill on {serial} failed: {e}");
        }
    }

    /// Ensure the artifact is on the device, pushing it on first use. The
    /// staged copy is shared by later sessions to the same device.
    async fn stage(&self, serial: &str) -> Result<()> {
        let staged = match self
            .transport
            .shell(serial, &format!("ls -l {SERVER_DEVICE_PATH}"))
            .await
        {
            Ok(listing) => !listing.contains("No such file"),
            Err(_) => false,
        };
        if staged {
            debug!("server artifact already staged on {serial}");
            return Ok(());
        }

        info!(
            "pushing {} to {serial}:{SERVER_DEVICE_PATH}",
            self.server_jar.display()
        );
        self.transport
            .push(serial, &self.server_jar, SERVER_DEVICE_PATH)
            .await
            .map_err(|e| Error::ServerStage(e.to_string()))
    }

    /// Audio capture requires Android 11. An unreadable or unparsable SDK
    /// level leaves the caller's choice untouched.
    async fn audio_supported(&self, serial: &str) -> bool {
        match self
            .transport
            .shell(serial, "getprop ro.build.version.sdk")
            .await
        {
            Ok(output) => match output.trim().parse::<u32>() {
                Ok(sdk) if sdk < MIN_AUDIO_SDK => {
                    warn!("device {serial} is SDK {sdk}, disabling audio capture");
                    false
                }
                _ => true,
            },
            Err(_) => true,
        }
    }
}
