// Session engine: per-device server launch, socket ordering, stream
// demultiplexing and lifecycle supervision.

pub mod buffer;
pub mod connector;
pub mod demuxer;
pub mod launcher;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testutil;

pub use connector::SessionSockets;
pub use demuxer::{codec_ids, ControlReply, FramedPacket, Metadata, CONFIG_PACKET_PTS};
pub use launcher::{AudioCodec, SessionOptions, SERVER_DEVICE_PATH};
pub use supervisor::{SessionEvent, StartInfo, Supervisor};
