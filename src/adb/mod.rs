// ADB subsystem: transport, typed command building, device registry and
// wireless helpers.

pub mod client;
pub mod command_builder;
pub mod registry;
pub mod wireless;

pub use client::{AdbClient, ShellChild, Transport};
pub use command_builder::{AdbCommand, AdbCommandBuilder};
pub use registry::{Device, DeviceState, Registry, RegistryEvent};
pub use wireless::{is_wireless_serial, Wireless};
