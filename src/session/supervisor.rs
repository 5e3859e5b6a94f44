// Session Supervisor - Orchestrates launcher, connector and demuxers
// Owns the session table, enforces one session per serial, routes demuxed
// events to the consumer and tears sessions down on stop or video loss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adb::client::{ShellChild, Transport};
use crate::adb::registry::RegistryEvent;
use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::session::connector;
use crate::session::demuxer::{
    AudioDemuxer, ControlDemuxer, ControlReply, DemuxEvent, FramedPacket, Metadata, VideoDemuxer,
};
use crate::session::launcher::{Launcher, SessionOptions};

/// Returned by [`Supervisor::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StartInfo {
    /// Local TCP port the session's sockets are connected through.
    pub port: u16,
}

/// Everything the supervisor reports to its consumer, tagged with the
/// originating serial.
#[derive(Debug)]
pub enum SessionEvent {
    Connected { serial: String },
    Metadata { serial: String, metadata: Metadata },
    Video { serial: String, packet: FramedPacket },
    Audio { serial: String, packet: FramedPacket },
    Clipboard { serial: String, text: String },
    Disconnected { serial: String },
    Error { serial: String, error: Error },
}

struct ActiveSession {
    scid: u32,
    port: u16,
    child: ShellChild,
    control: Option<Arc<Mutex<OwnedWriteHalf>>>,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner<T: Transport> {
    launcher: Launcher<T>,
    port_base: u16,
    sessions: Mutex<HashMap<String, ActiveSession>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// One supervisor per host process; sessions to different devices run
/// concurrently, at most one session per serial.
pub struct Supervisor<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Supervisor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Supervisor<T> {
    pub fn new(
        transport: Arc<T>,
        config: &CoreConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let launcher = Launcher::new(
            transport,
            config.server_jar.clone(),
            config.server_version.clone(),
        );
        (
            Self {
                inner: Arc::new(Inner {
                    launcher,
                    port_base: config.port_base,
                    sessions: Mutex::new(HashMap::new()),
                    events,
                }),
            },
            rx,
        )
    }

    /// Start a session for `serial`. Idempotent: an existing session's port
    /// is returned without relaunching. The table lock is held for the whole
    /// procedure, so a concurrent start for the same serial waits and then
    /// observes the finished session.
    pub async fn start(&self, serial: &str, options: SessionOptions) -> Result<StartInfo> {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(existing) = sessions.get(serial) {
            debug!(
                "session already active for {serial} on port {}",
                existing.port
            );
            return Ok(StartInfo {
                port: existing.port,
            });
        }

        let scid = draw_scid(&sessions);
        let port = allocate_port(self.inner.port_base, &sessions);

        let mut launched = self.inner.launcher.launch(serial, &options, scid, port).await?;

        let sockets = match connector::connect(port, launched.audio).await {
            Ok(sockets) => sockets,
            Err(e) => {
                // A dead shell child explains the dial failure better than
                // the socket error does.
                let error = if launched.child.has_exited() {
                    Error::ServerSpawn(e.to_string())
                } else {
                    e
                };
                self.inner
                    .launcher
                    .stop(serial, port, &mut launched.child)
                    .await;
                return Err(error);
            }
        };

        let connected = Arc::new(AtomicBool::new(false));
        let (control_read, control_write) = sockets.control.into_split();
        let control_write = Arc::new(Mutex::new(control_write));

        let mut tasks = Vec::new();
        tasks.push(self.spawn_video_task(serial, sockets.video, Arc::clone(&connected)));
        if let Some(audio_socket) = sockets.audio {
            tasks.push(self.spawn_audio_task(serial, audio_socket));
        }
        tasks.push(self.spawn_control_task(serial, control_read));

        sessions.insert(
            serial.to_string(),
            ActiveSession {
                scid,
                port,
                child: launched.child,
                control: Some(control_write),
                connected,
                tasks,
            },
        );
        info!("session {scid:08x} for {serial} established on port {port}");
        Ok(StartInfo { port })
    }

    /// Write raw control bytes to the session. Returns `false` when there is
    /// no session, the handshake has not completed, or the control socket is
    /// absent.
    pub async fn send(&self, serial: &str, bytes: &[u8]) -> bool {
        match self.try_send(serial, bytes).await {
            Ok(()) => true,
            Err(e) => {
                debug!("send to {serial} rejected: {e}");
                false
            }
        }
    }

    async fn try_send(&self, serial: &str, bytes: &[u8]) -> Result<()> {
        let (writer, connected) = {
            let sessions = self.inner.sessions.lock().await;
            let session = sessions.get(serial).ok_or(Error::NotConnected)?;
            (
                session.control.clone().ok_or(Error::NotConnected)?,
                Arc::clone(&session.connected),
            )
        };
        if !connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        // Writers to the control socket are serialized by this lock.
        let mut writer = writer.lock().await;
        writer.write_all(bytes).await.map_err(|e| {
            debug!("control write failed: {e}");
            Error::StreamClosed {
                stream: crate::error::StreamKind::Control,
            }
        })?;
        Ok(())
    }

    /// Tear the session down. Idempotent; a second call is a no-op.
    pub async fn stop(&self, serial: &str) {
        teardown(Arc::clone(&self.inner), serial.to_string()).await;
    }

    /// Registry wiring point: a device removal stops its session (if any).
    pub fn on_registry_event(&self, event: &RegistryEvent) {
        if let RegistryEvent::Disconnected { serial } = event {
            let inner = Arc::clone(&self.inner);
            let serial = serial.clone();
            tokio::spawn(async move {
                teardown(inner, serial).await;
            });
        }
    }

    /// Serials with a live session.
    pub async fn active_serials(&self) -> Vec<String> {
        self.inner.sessions.lock().await.keys().cloned().collect()
    }

    fn spawn_video_task(
        &self,
        serial: &str,
        mut socket: TcpStream,
        connected: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let events = self.inner.events.clone();
        let serial = serial.to_string();
        tokio::spawn(async move {
            let mut demuxer = VideoDemuxer::new();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) => {
                        debug!("video stream for {serial} closed by peer");
                        break;
                    }
                    Ok(n) => {
                        let mut out = Vec::new();
                        demuxer.feed(&buf[..n], &mut out);
                        for event in out {
                            match event {
                                DemuxEvent::Metadata(metadata) => {
                                    let _ = events.send(SessionEvent::Metadata {
                                        serial: serial.clone(),
                                        metadata,
                                    });
                                }
                                DemuxEvent::Connected => {
                                    connected.store(true, Ordering::SeqCst);
                                    let _ = events.send(SessionEvent::Connected {
                                        serial: serial.clone(),
                                    });
                                }
                                DemuxEvent::Video(packet) => {
                                    let _ = events.send(SessionEvent::Video {
                                        serial: serial.clone(),
                                        packet,
                                    });
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        warn!("video read error for {serial}: {e}");
                        let _ = events.send(SessionEvent::Error {
                            serial: serial.clone(),
                            error: Error::Io(e),
                        });
                        break;
                    }
                }
            }
            // Video loss ends the session. Tear down from a fresh task so
            // aborting this one cannot interrupt the cleanup.
            tokio::spawn(teardown(inner, serial));
        })
    }

    fn spawn_audio_task(&self, serial: &str, mut socket: TcpStream) -> JoinHandle<()> {
        let events = self.inner.events.clone();
        let serial = serial.to_string();
        tokio::spawn(async move {
            let mut demuxer = AudioDemuxer::new();
            let mut buf = vec![0u8; 16 * 1024];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) => {
                        debug!("audio stream for {serial} closed by peer");
                        break;
                    }
                    Ok(n) => {
                        let mut out = Vec::new();
                        if let Err(e) = demuxer.feed(&buf[..n], &mut out) {
                            // Audio degrades silently; video continues.
                            warn!("audio demux for {serial} failed: {e}");
                            break;
                        }
                        for event in out {
                            if let DemuxEvent::Audio(packet) = event {
                                let _ = events.send(SessionEvent::Audio {
                                    serial: serial.clone(),
                                    packet,
                                });
                            }
                        }
                    }
                    Err(e) => {
                        warn!("audio read error for {serial}: {e}");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_control_task(
        &self,
        serial: &str,
        mut socket: tokio::net::tcp::OwnedReadHalf,
    ) -> JoinHandle<()> {
        let events = self.inner.events.clone();
        let serial = serial.to_string();
        tokio::spawn(async move {
            let mut demuxer = ControlDemuxer::new();
            let mut buf = vec![0u8; 4 * 1024];
            loop {
                match socket.read(&mut buf).await {
                    // A lost control stream does not end the session; video
                    // may still play.
                    Ok(0) => {
                        debug!("control stream for {serial} closed by peer");
                        break;
                    }
                    Ok(n) => {
                        let mut out = Vec::new();
                        demuxer.feed(&buf[..n], &mut out);
                        for event in out {
                            match event {
                                DemuxEvent::Control(ControlReply::Clipboard { text }) => {
                                    let _ = events.send(SessionEvent::Clipboard {
                                        serial: serial.clone(),
                                        text,
                                    });
                                }
                                DemuxEvent::Control(reply) => {
                                    debug!("control reply from {serial}: {reply:?}");
                                }
                                _ => {}
                            }
                        }
                    }
                    Err(e) => {
                        debug!("control read error for {serial}: {e}");
                        break;
                    }
                }
            }
        })
    }
}

/// Remove and dismantle the session: abort reader tasks (closing their
/// sockets), stop the on-device server, then announce the disconnect.
async fn teardown<T: Transport>(inner: Arc<Inner<T>>, serial: String) {
    let removed = inner.sessions.lock().await.remove(&serial);
    let Some(mut session) = removed else {
        return;
    };
    for task in &session.tasks {
        task.abort();
    }
    session.control = None;
    inner
        .launcher
        .stop(&serial, session.port, &mut session.child)
        .await;
    info!("session {:08x} for {serial} closed", session.scid);
    let _ = inner.events.send(SessionEvent::Disconnected { serial });
}

/// Draw a 31-bit session id distinct from every live session's.
fn draw_scid(sessions: &HashMap<String, ActiveSession>) -> u32 {
    loop {
        let scid = rand::random::<u32>() & 0x7FFF_FFFF;
        if !sessions.values().any(|s| s.scid == scid) {
            return scid;
        }
    }
}

/// Lowest free local port at or above the base: one per concurrent session.
fn allocate_port(base: u16, sessions: &HashMap<String, ActiveSession>) -> u16 {
    let mut port = base;
    while sessions.values().any(|s| s.port == port) {
        port += 1;
    }
    port
}
