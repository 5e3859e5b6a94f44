// Stream Demuxer - Incremental parsers for the three session streams
// Driven by byte deliveries; each stream owns a reassembly buffer and a
// small state machine. Parsing outcome is independent of how the TCP
// stream was chunked.

use tracing::{debug, warn};

use crate::error::{Error, Result, StreamKind};
use crate::session::buffer::StreamBuffer;

/// Reserved PTS marking a codec-config packet (SPS/PPS) rather than a frame.
pub const CONFIG_PACKET_PTS: u64 = u64::MAX;

/// Codec identifiers carried in the video prologue. Opaque to the demuxer;
/// passed through for the consumer's decoder selection.
pub mod codec_ids {
    /// `"h264"`
    pub const H264: u32 = 0x6832_3634;
    /// `"h265"`
    pub const H265: u32 = 0x6832_3635;
    /// `"av1"` (NUL-padded)
    pub const AV1: u32 = 0x0061_7631;
}

/// Fixed-length pieces of the video prologue.
const DEVICE_NAME_LEN: usize = 64;
const CODEC_INFO_LEN: usize = 12;
const FRAME_HEADER_LEN: usize = 12;

/// Session metadata parsed from the video handshake.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Metadata {
    pub device_name: String,
    pub codec_id: u32,
    pub width: u32,
    pub height: u32,
}

/// One framed media packet: `u64 pts | u32 size | payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedPacket {
    pub pts: u64,
    pub payload: Vec<u8>,
    pub is_config: bool,
}

/// Messages the device sends back on the control stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Clipboard { text: String },
    ClipboardAck { sequence: u64 },
    UhidOutput { id: u16, data: Vec<u8> },
}

/// Typed parse output, in wire order per stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    Metadata(Metadata),
    Connected,
    Video(FramedPacket),
    Audio(FramedPacket),
    Control(ControlReply),
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Parse a framed packet from the front of `data`, if complete.
fn parse_framed_packet(data: &[u8]) -> Option<(FramedPacket, usize)> {
    if data.len() < FRAME_HEADER_LEN {
        return None;
    }
    let pts = be_u64(&data[0..8]);
    let size = be_u32(&data[8..12]) as usize;
    if data.len() < FRAME_HEADER_LEN + size {
        return None;
    }
    let payload = data[FRAME_HEADER_LEN..FRAME_HEADER_LEN + size].to_vec();
    Some((
        FramedPacket {
            pts,
            payload,
            is_config: pts == CONFIG_PACKET_PTS,
        },
        FRAME_HEADER_LEN + size,
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VideoState {
    AwaitDummy,
    AwaitDeviceName,
    AwaitCodecInfo,
    Streaming,
}

/// Video stream parser: dummy byte, 64-byte device name, codec info, then
/// framed packets.
pub struct VideoDemuxer {
    buf: StreamBuffer,
    state: VideoState,
    device_name: String,
}

impl Default for VideoDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoDemuxer {
    pub fn new() -> Self {
        Self {
            buf: StreamBuffer::new(),
            state: VideoState::AwaitDummy,
            device_name: String::new(),
        }
    }

    /// Whether the prologue has been fully consumed.
    pub fn is_streaming(&self) -> bool {
        self.state == VideoState::Streaming
    }

    /// Feed inbound bytes; complete events are appended to `out`.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<DemuxEvent>) {
        self.buf.push(bytes);
        loop {
            match self.state {
                VideoState::AwaitDummy => {
                    if self.buf.is_empty() {
                        return;
                    }
                    // Connection-alive marker sent with tunnel_forward.
                    self.buf.consume(1);
                    self.state = VideoState::AwaitDeviceName;
                }
                VideoState::AwaitDeviceName => {
                    if self.buf.len() < DEVICE_NAME_LEN {
                        return;
                    }
                    let raw = &self.buf.as_slice()[..DEVICE_NAME_LEN];
                    let end = raw.iter().position(|&b| b == 0).unwrap_or(DEVICE_NAME_LEN);
                    self.device_name = String::from_utf8_lossy(&raw[..end]).into_owned();
                    self.buf.consume(DEVICE_NAME_LEN);
                    self.state = VideoState::AwaitCodecInfo;
                }
                VideoState::AwaitCodecInfo => {
                    if self.buf.len() < CODEC_INFO_LEN {
                        return;
                    }
                    let data = self.buf.as_slice();
                    let metadata = Metadata {
                        device_name: std::mem::take(&mut self.device_name),
                        codec_id: be_u32(&data[0..4]),
                        width: be_u32(&data[4..8]),
                        height: be_u32(&data[8..12]),
                    };
                    self.buf.consume(CODEC_INFO_LEN);
                    debug!(
                        "video handshake: {} {}x{} codec {:#010x}",
                        metadata.device_name, metadata.width, metadata.height, metadata.codec_id
                    );
                    out.push(DemuxEvent::Metadata(metadata));
                    out.push(DemuxEvent::Connected);
                    self.state = VideoState::Streaming;
                }
                VideoState::Streaming => {
                    match parse_framed_packet(self.buf.as_slice()) {
                        Some((packet, consumed)) => {
                            self.buf.consume(consumed);
                            out.push(DemuxEvent::Video(packet));
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

/// Longest pre-codec metadata run tolerated before the preamble search is
/// abandoned.
const PREAMBLE_SCAN_LIMIT: usize = 256;

/// 3-byte prefixes of the recognized codec tags.
const CODEC_TAG_PREFIXES: [&[u8; 3]; 3] = [b"raw", b"aac", b"opu"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum AudioState {
    AwaitCodec,
    Streaming,
}

/// Audio stream parser. The preamble length varies with server build flags,
/// so the start of the framed region is located by searching for a codec
/// tag; framing past it matches the video stream.
pub struct AudioDemuxer {
    buf: StreamBuffer,
    state: AudioState,
    codec_tag: Option<String>,
}

impl Default for AudioDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDemuxer {
    pub fn new() -> Self {
        Self {
            buf: StreamBuffer::new(),
            state: AudioState::AwaitCodec,
            codec_tag: None,
        }
    }

    /// The codec tag located in the preamble, once streaming.
    pub fn codec_tag(&self) -> Option<&str> {
        self.codec_tag.as_deref()
    }

    /// Feed inbound bytes. Fails only when the preamble search is
    /// exhausted; the caller then degrades audio for the session.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<DemuxEvent>) -> Result<()> {
        self.buf.push(bytes);
        loop {
            match self.state {
                AudioState::AwaitCodec => {
                    let data = self.buf.as_slice();
                    let window = data.len().min(PREAMBLE_SCAN_LIMIT);
                    let hit = (0..window.saturating_sub(2)).find(|&i| {
                        CODEC_TAG_PREFIXES.iter().any(|p| &data[i..i + 3] == *p)
                    });
                    match hit {
                        Some(i) => {
                            // The framed region starts past the 4-byte tag.
                            if data.len() < i + 4 {
                                return Ok(());
                            }
                            let tag = String::from_utf8_lossy(&data[i..i + 3]).into_owned();
                            debug!("audio codec tag {tag:?} at preamble offset {i}");
                            self.codec_tag = Some(tag);
                            self.buf.consume(i + 4);
                            self.state = AudioState::Streaming;
                        }
                        None if data.len() >= PREAMBLE_SCAN_LIMIT => {
                            warn!(
                                "no audio codec tag within {PREAMBLE_SCAN_LIMIT} bytes, \
                                 skipping audio preamble"
                            );
                            return Err(Error::HandshakeMalformed {
                                stream: StreamKind::Audio,
                            });
                        }
                        None => return Ok(()),
                    }
                }
                AudioState::Streaming => match parse_framed_packet(self.buf.as_slice()) {
                    Some((packet, consumed)) => {
                        self.buf.consume(consumed);
                        out.push(DemuxEvent::Audio(packet));
                    }
                    None => return Ok(()),
                },
            }
        }
    }
}

const MSG_CLIPBOARD: u8 = 0;
const MSG_CLIPBOARD_ACK: u8 = 1;
const MSG_UHID_OUTPUT: u8 = 2;

/// Control reply parser. An unknown tag is treated as desynchronization:
/// the pending buffer is discarded and parsing resumes with the next
/// delivery.
#[derive(Default)]
pub struct ControlDemuxer {
    buf: StreamBuffer,
}

impl ControlDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<DemuxEvent>) {
        self.buf.push(bytes);
        loop {
            let data = self.buf.as_slice();
            if data.is_empty() {
                return;
            }
            match data[0] {
                MSG_CLIPBOARD => {
                    if data.len() < 5 {
                        return;
                    }
                    let len = be_u32(&data[1..5]) as usize;
                    if data.len() < 5 + len {
                        return;
                    }
                    let text = String::from_utf8_lossy(&data[5..5 + len]).into_owned();
                    self.buf.consume(5 + len);
                    out.push(DemuxEvent::Control(ControlReply::Clipboard { text }));
                }
                MSG_CLIPBOARD_ACK => {
                    if data.len() < 9 {
                        return;
                    }
                    let sequence = be_u64(&data[1..9]);
                    self.buf.consume(9);
                    out.push(DemuxEvent::Control(ControlReply::ClipboardAck { sequence }));
                }
                MSG_UHID_OUTPUT => {
                    if data.len() < 5 {
                        return;
                    }
                    let id = be_u16(&data[1..3]);
                    let data_len = be_u16(&data[3..5]) as usize;
                    if data.len() < 5 + data_len {
                        return;
                    }
                    let payload = data[5..5 + data_len].to_vec();
                    self.buf.consume(5 + data_len);
                    out.push(DemuxEvent::Control(ControlReply::UhidOutput {
                        id,
                        data: payload,
                    }));
                }
                tag => {
                    warn!(
                        "unknown control tag {tag}, discarding {} buffered bytes",
                        data.len()
                    );
                    self.buf.clear();
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prologue(name: &str, codec_id: u32, width: u32, height: u32) -> Vec<u8> {
        let mut bytes = vec![0u8]; // dummy
        let mut field = [0u8; DEVICE_NAME_LEN];
        field[..name.len()].copy_from_slice(name.as_bytes());
        bytes.extend_from_slice(&field);
        bytes.extend_from_slice(&codec_id.to_be_bytes());
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes
    }

    fn frame(pts: u64, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&pts.to_be_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    fn feed_video(demuxer: &mut VideoDemuxer, bytes: &[u8]) -> Vec<DemuxEvent> {
        let mut out = Vec::new();
        demuxer.feed(bytes, &mut out);
        out
    }

    #[test]
    fn test_handshake_then_config_and_frame_in_two_deliveries() {
        // S1: 65 bytes first (dummy + name), remainder second.
        let mut demuxer = VideoDemuxer::new();

        let mut first = vec![0u8];
        let mut name = [0u8; DEVICE_NAME_LEN];
        name[..8].copy_from_slice(b"Pixel 6\0");
        first.extend_from_slice(&name);
        let events = feed_video(&mut demuxer, &first);
        assert!(events.is_empty());

        let mut second = Vec::new();
        second.extend_from_slice(&codec_ids::H264.to_be_bytes());
        second.extend_from_slice(&1920u32.to_be_bytes());
        second.extend_from_slice(&1080u32.to_be_bytes());
        second.extend_from_slice(&frame(CONFIG_PACKET_PTS, &[0, 0, 0, 1]));
        second.extend_from_slice(&frame(1000, &[0xAA, 0xBB]));

        let events = feed_video(&mut demuxer, &second);
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            DemuxEvent::Metadata(Metadata {
                device_name: "Pixel 6".into(),
                codec_id: codec_ids::H264,
                width: 1920,
                height: 1080,
            })
        );
        assert_eq!(events[1], DemuxEvent::Connected);
        assert_eq!(
            events[2],
            DemuxEvent::Video(FramedPacket {
                pts: CONFIG_PACKET_PTS,
                payload: vec![0, 0, 0, 1],
                is_config: true,
            })
        );
        assert_eq!(
            events[3],
            DemuxEvent::Video(FramedPacket {
                pts: 1000,
                payload: vec![0xAA, 0xBB],
                is_config: false,
            })
        );
    }

    #[test]
    fn test_truncated_device_name_blocks() {
        let mut demuxer = VideoDemuxer::new();
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(b"Pixel"); // far short of 64
        assert!(feed_video(&mut demuxer, &bytes).is_empty());
        assert!(!demuxer.is_streaming());
    }

    #[test]
    fn test_prologue_roundtrip() {
        let mut demuxer = VideoDemuxer::new();
        let events = feed_video(
            &mut demuxer,
            &prologue("Galaxy S23", codec_ids::H265, 2340, 1080),
        );
        match &events[0] {
            DemuxEvent::Metadata(m) => {
                assert_eq!(m.device_name, "Galaxy S23");
                assert_eq!(m.codec_id, codec_ids::H265);
                assert_eq!(m.width, 2340);
                assert_eq!(m.height, 1080);
            }
            other => panic!("expected metadata, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_trailing_header_is_retained() {
        let mut demuxer = VideoDemuxer::new();
        let mut bytes = prologue("Pixel 6", codec_ids::H264, 1920, 1080);
        bytes.extend_from_slice(&frame(1, &[1, 2, 3]));
        bytes.extend_from_slice(&frame(2, &[4]));
        bytes.extend_from_slice(&3u64.to_be_bytes()[..6]); // truncated next header

        let events = feed_video(&mut demuxer, &bytes);
        assert_eq!(events.len(), 4); // metadata, connected, two packets

        // Completing the header plus payload releases the third packet.
        let mut rest = Vec::new();
        rest.extend_from_slice(&3u64.to_be_bytes()[6..]);
        rest.extend_from_slice(&2u32.to_be_bytes());
        rest.extend_from_slice(&[9, 9]);
        let events = feed_video(&mut demuxer, &rest);
        assert_eq!(
            events,
            vec![DemuxEvent::Video(FramedPacket {
                pts: 3,
                payload: vec![9, 9],
                is_config: false,
            })]
        );
    }

    #[test]
    fn test_chunking_does_not_change_events() {
        let mut wire = prologue("Pixel 6", codec_ids::H264, 1920, 1080);
        wire.extend_from_slice(&frame(CONFIG_PACKET_PTS, &[0, 0, 0, 1, 0x67]));
        wire.extend_from_slice(&frame(33_000, &[0x41; 17]));
        wire.extend_from_slice(&frame(66_000, &[0x01; 3]));

        let mut whole = VideoDemuxer::new();
        let expected = feed_video(&mut whole, &wire);
        assert_eq!(expected.len(), 5);

        // Byte-at-a-time delivery.
        let mut trickle = VideoDemuxer::new();
        let mut got = Vec::new();
        for byte in &wire {
            trickle.feed(std::slice::from_ref(byte), &mut got);
        }
        assert_eq!(got, expected);

        // Arbitrary uneven split.
        for split in [1, 17, 64, 65, 76, 77, 100] {
            let mut demuxer = VideoDemuxer::new();
            let mut got = Vec::new();
            demuxer.feed(&wire[..split], &mut got);
            demuxer.feed(&wire[split..], &mut got);
            assert_eq!(got, expected, "split at {split}");
        }
    }

    #[test]
    fn test_packet_count_is_conserved() {
        let payloads: Vec<Vec<u8>> = (0..20).map(|i| vec![i as u8; (i * 7) % 40]).collect();
        let mut wire = prologue("x", codec_ids::AV1, 640, 480);
        for (i, p) in payloads.iter().enumerate() {
            wire.extend_from_slice(&frame(i as u64, p));
        }

        let mut demuxer = VideoDemuxer::new();
        let events = feed_video(&mut demuxer, &wire);
        let packets: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, DemuxEvent::Video(_)))
            .collect();
        assert_eq!(packets.len(), payloads.len());
    }

    #[test]
    fn test_audio_preamble_search() {
        // S3: preamble echoes a device name, then "raw " precedes framing.
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(b"Pixel 6\0");
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.extend_from_slice(b"raw ");
        bytes.extend_from_slice(&frame(2000, &[1, 2, 3, 4]));

        let mut demuxer = AudioDemuxer::new();
        let mut events = Vec::new();
        demuxer.feed(&bytes, &mut events).unwrap();
        assert_eq!(demuxer.codec_tag(), Some("raw"));
        assert_eq!(
            events,
            vec![DemuxEvent::Audio(FramedPacket {
                pts: 2000,
                payload: vec![1, 2, 3, 4],
                is_config: false,
            })]
        );
    }

    #[test]
    fn test_audio_preamble_split_mid_tag() {
        let mut demuxer = AudioDemuxer::new();
        let mut events = Vec::new();
        demuxer.feed(&[0x00, b'o', b'p', b'u'], &mut events).unwrap();
        assert!(events.is_empty()); // tag found, 4th byte not yet delivered
        demuxer.feed(b"s", &mut events).unwrap();
        demuxer.feed(&frame(1, &[5]), &mut events).unwrap();
        assert_eq!(demuxer.codec_tag(), Some("opu"));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_audio_preamble_exhaustion() {
        let mut demuxer = AudioDemuxer::new();
        let mut events = Vec::new();
        let err = demuxer
            .feed(&vec![0xEEu8; PREAMBLE_SCAN_LIMIT], &mut events)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::HandshakeMalformed {
                stream: StreamKind::Audio
            }
        ));
        assert!(events.is_empty());
    }

    #[test]
    fn test_control_clipboard_then_unknown_clears_buffer() {
        // S2: "Hi!" parses; tag 0x7F discards the rest including a valid
        // trailing clipboard message.
        let bytes = [
            0x00, 0x00, 0x00, 0x00, 0x03, b'H', b'i', b'!', 0x7F, 0xDE, 0xAD, 0x00, 0x00, 0x00,
            0x00, 0x02, b'O', b'K',
        ];
        let mut demuxer = ControlDemuxer::new();
        let mut events = Vec::new();
        demuxer.feed(&bytes, &mut events);
        assert_eq!(
            events,
            vec![DemuxEvent::Control(ControlReply::Clipboard {
                text: "Hi!".into()
            })]
        );

        // A fresh well-formed delivery resumes parsing.
        let mut events = Vec::new();
        demuxer.feed(
            &[0x00, 0x00, 0x00, 0x00, 0x02, b'O', b'K'],
            &mut events,
        );
        assert_eq!(
            events,
            vec![DemuxEvent::Control(ControlReply::Clipboard {
                text: "OK".into()
            })]
        );
    }

    #[test]
    fn test_control_ack_and_uhid() {
        let mut bytes = vec![0x01];
        bytes.extend_from_slice(&42u64.to_be_bytes());
        bytes.push(0x02);
        bytes.extend_from_slice(&7u16.to_be_bytes());
        bytes.extend_from_slice(&3u16.to_be_bytes());
        bytes.extend_from_slice(&[0x10, 0x20, 0x30]);

        let mut demuxer = ControlDemuxer::new();
        let mut events = Vec::new();
        demuxer.feed(&bytes, &mut events);
        assert_eq!(
            events,
            vec![
                DemuxEvent::Control(ControlReply::ClipboardAck { sequence: 42 }),
                DemuxEvent::Control(ControlReply::UhidOutput {
                    id: 7,
                    data: vec![0x10, 0x20, 0x30],
                }),
            ]
        );
    }

    #[test]
    fn test_control_partial_message_waits() {
        let mut demuxer = ControlDemuxer::new();
        let mut events = Vec::new();
        demuxer.feed(&[0x00, 0x00, 0x00, 0x00, 0x05, b'h', b'e'], &mut events);
        assert!(events.is_empty());
        demuxer.feed(&[b'l', b'l', b'o'], &mut events);
        assert_eq!(
            events,
            vec![DemuxEvent::Control(ControlReply::Clipboard {
                text: "hello".into()
            })]
        );
    }
}
