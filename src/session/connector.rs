// Session Connector - Ordered dialing of the three session sockets
// The server accepts its sockets in a fixed order: video, then audio (when
// enabled), then control. Audio is optional; control is not.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::{Error, Result, StreamKind};

/// Per-socket connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between consecutive socket dials.
pub const INTER_SOCKET_DELAY: Duration = Duration::from_millis(300);

/// The connected sockets of a session. `audio` is absent when the session
/// was launched without audio or the audio dial failed.
pub struct SessionSockets {
    pub video: TcpStream,
    pub audio: Option<TcpStream>,
    pub control: TcpStream,
}

/// Dial the forwarded port in the required order. On a fatal failure every
/// already-opened socket is closed before the error surfaces.
pub async fn connect(port: u16, expect_audio: bool) -> Result<SessionSockets> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

    let video = dial(addr, StreamKind::Video).await?;
    sleep(INTER_SOCKET_DELAY).await;

    let audio = if expect_audio {
        match dial(addr, StreamKind::Audio).await {
            Ok(socket) => Some(socket),
            Err(e) => {
                // Audio is optional: the stream is absent for the session.
                warn!("audio socket connect failed, continuing without audio: {e}");
                None
            }
        }
    } else {
        debug!("audio disabled for this session, skipping audio dial");
        None
    };
    sleep(INTER_SOCKET_DELAY).await;

    match dial(addr, StreamKind::Control).await {
        Ok(control) => Ok(SessionSockets {
            video,
            audio,
            control,
        }),
        Err(e) => {
            // video and audio drop here, closing them before the error
            // reaches the caller.
            Err(e)
        }
    }
}

async fn dial(addr: SocketAddr, stream: StreamKind) -> Result<TcpStream> {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(socket)) => {
            socket.set_nodelay(true)?;
            debug!("{stream} socket connected to {addr}");
            Ok(socket)
        }
        Ok(Err(e)) => Err(Error::Io(e)),
        Err(_) => Err(Error::ConnectTimeout { stream }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connects_in_order_with_audio() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept_task = tokio::spawn(async move {
            let mut held = Vec::new();
            for _ in 0..3 {
                let (socket, _) = listener.accept().await.unwrap();
                held.push(socket);
            }
            held
        });

        let sockets = connect(port, true).await.unwrap();
        assert!(sockets.audio.is_some());
        let held = accept_task.await.unwrap();
        assert_eq!(held.len(), 3);
    }

    #[tokio::test]
    async fn test_audio_dial_skipped_when_disabled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept_task = tokio::spawn(async move {
            let mut held = Vec::new();
            for _ in 0..2 {
                let (socket, _) = listener.accept().await.unwrap();
                held.push(socket);
            }
            held
        });

        let sockets = connect(port, false).await.unwrap();
        assert!(sockets.audio.is_none());
        assert_eq!(accept_task.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_video_failure_aborts() {
        // Bind then drop to obtain a port with no listener.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(connect(port, true).await.is_err());
    }
}
