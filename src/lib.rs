// Devicecast - Android device mirroring host core
// Discovers devices over adb, launches the on-device streaming server, and
// relays video, audio and control between the device and the host UI.
//
// The host UI, decoders and settings persistence live elsewhere; this crate
// is the device-side session engine they consume.

pub mod adb;
pub mod command_utils;
pub mod config;
pub mod error;
pub mod session;
pub mod settings;

pub use adb::{AdbClient, Device, DeviceState, Registry, RegistryEvent, Transport};
pub use config::CoreConfig;
pub use error::{Error, Result, StreamKind};
pub use session::{
    FramedPacket, Metadata, SessionEvent, SessionOptions, StartInfo, Supervisor,
};
pub use settings::{MemorySettings, Settings};
