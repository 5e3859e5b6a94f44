// Wireless ADB - Connection management for network-attached devices
// A serial containing ':' or '.' is wireless. The host may persist known
// wireless hosts and replay `adb connect` for them at startup; the registry
// then observes the device on its next poll.

use tracing::{debug, info, warn};

use crate::adb::client::{AdbClient, Transport};
use crate::adb::command_builder::AdbCommand;
use crate::error::{Error, Result};
use crate::settings::{keys, Settings};

/// Default port for `adb tcpip` / `adb connect`.
pub const DEFAULT_WIRELESS_PORT: u16 = 5555;

/// Whether a serial denotes a network transport.
pub fn is_wireless_serial(serial: &str) -> bool {
    serial.contains(':') || serial.contains('.')
}

/// Wireless connection helpers over the production transport.
pub struct Wireless<'a> {
    client: &'a AdbClient,
}

impl<'a> Wireless<'a> {
    pub fn new(client: &'a AdbClient) -> Self {
        Self { client }
    }

    /// Switch a USB-attached device into TCP/IP mode.
    pub async fn enable_tcpip(&self, serial: &str, port: u16) -> Result<()> {
        self.client
            .exec(AdbCommand::Tcpip { port }, Some(serial))
            .await
            .map(|_| ())
    }

    /// Connect to a wireless target (`ip` or `ip:port`). adb reports failure
    /// on stdout with a zero exit, so the output text is inspected.
    pub async fn connect(&self, target: &str) -> Result<String> {
        let target = if target.contains(':') {
            target.to_string()
        } else {
            format!("{target}:{DEFAULT_WIRELESS_PORT}")
        };
        let output = self
            .client
            .exec(AdbCommand::Connect {
                target: target.clone(),
            }, None)
            .await?;
        let result = output.trim().to_string();
        if result.contains("connected") {
            Ok(result)
        } else {
            Err(Error::AdbInvocation {
                exit: 0,
                stderr: result,
            })
        }
    }

    /// Disconnect a wireless target.
    pub async fn disconnect(&self, target: &str) -> Result<String> {
        let output = self
            .client
            .exec(
                AdbCommand::Disconnect {
                    target: target.to_string(),
                },
                None,
            )
            .await?;
        Ok(output.trim().to_string())
    }

    /// Determine the device's LAN IP so the host can offer a wireless
    /// switch. Tries the default route first, then falls back to interface
    /// listings for older devices.
    pub async fn device_ip(&self, serial: &str) -> Result<String> {
        if let Ok(output) = self.client.shell(serial, "ip route get 8.8.8.8").await {
            if let Some(ip) = parse_route_src(&output) {
                return Ok(ip);
            }
        }

        for interface in ["wlan0", "eth0", "wlan1"] {
            if let Ok(output) = self
                .client
                .shell(serial, &format!("ip addr show {interface}"))
                .await
            {
                if let Some(ip) = parse_inet_addr(&output) {
                    return Ok(ip);
                }
            }
        }

        if let Ok(output) = self.client.shell(serial, "ifconfig wlan0").await {
            if let Some(ip) = parse_ifconfig_addr(&output) {
                return Ok(ip);
            }
        }

        // Last resort: scan every interface for a non-loopback address, for
        // devices whose Wi-Fi interface has a non-standard name.
        if let Ok(output) = self.client.shell(serial, "ip addr show").await {
            if let Some(ip) = parse_inet_addr(&output) {
                return Ok(ip);
            }
        }

        Err(Error::AdbInvocation {
            exit: 0,
            stderr: format!("could not determine IP for {serial}"),
        })
    }

    /// Replay `adb connect` for every persisted wireless host. Called at
    /// startup when the auto-reconnect flag is set; failures are logged and
    /// skipped so one stale host does not block the rest.
    pub async fn reconnect_known(&self, settings: &dyn Settings) {
        if settings.get(keys::AUTO_RECONNECT).as_deref() != Some("true") {
            debug!("wireless auto-reconnect disabled");
            return;
        }
        let Some(hosts) = settings.get(keys::WIRELESS_HOSTS) else {
            return;
        };
        for host in hosts.split(',').map(str::trim).filter(|h| !h.is_empty()) {
            match self.connect(host).await {
                Ok(result) => info!("wireless reconnect {host}: {result}"),
                Err(e) => warn!("wireless reconnect {host} failed: {e}"),
            }
        }
    }
}

/// Extract the `src` address from `ip route get` output:
/// `8.8.8.8 via 192.168.1.1 dev wlan0 src 192.168.1.5 uid 2000`.
fn parse_route_src(output: &str) -> Option<String> {
    let src_pos = output.find("src ")?;
    output[src_pos + 4..]
        .split_whitespace()
        .next()
        .map(str::to_string)
}

/// Extract the first `inet` address from `ip addr show` output.
fn parse_inet_addr(output: &str) -> Option<String> {
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("inet ") {
            if let Some(addr) = rest.split_whitespace().next() {
                let ip = addr.split('/').next().unwrap_or(addr);
                if ip != "127.0.0.1" {
                    return Some(ip.to_string());
                }
            }
        }
    }
    None
}

/// Extract `inet addr:` from classic `ifconfig` output.
fn parse_ifconfig_addr(output: &str) -> Option<String> {
    let addr_pos = output.find("addr:")?;
    output[addr_pos + 5..]
        .split_whitespace()
        .next()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wireless_serial_detection() {
        assert!(is_wireless_serial("192.168.1.5:5555"));
        assert!(is_wireless_serial("192.168.1.5"));
        assert!(!is_wireless_serial("emulator-5554"));
        assert!(!is_wireless_serial("R58M12ABCDE"));
    }

    #[test]
    fn test_parse_route_src() {
        let out = "8.8.8.8 via 192.168.1.1 dev wlan0 src 192.168.1.5 uid 2000\n";
        assert_eq!(parse_route_src(out).as_deref(), Some("192.168.1.5"));
        assert!(parse_route_src("8.8.8.8 unreachable\n").is_none());
    }

    #[test]
    fn test_parse_inet_addr_skips_loopback() {
        let out = "1: lo\n    inet 127.0.0.1/8 scope host lo\n\
                   2: wlan0\n    inet 192.168.1.7/24 brd 192.168.1.255 scope global wlan0\n";
        assert_eq!(parse_inet_addr(out).as_deref(), Some("192.168.1.7"));
    }

    #[test]
    fn test_parse_inet_addr_finds_nonstandard_interface() {
        // Full `ip addr show` dump where the only global address sits on a
        // renamed Wi-Fi interface.
        let out = "1: lo\n    inet 127.0.0.1/8 scope host lo\n\
                   2: p2p0\n    inet 192.168.49.1/24 brd 192.168.49.255 scope global p2p0\n";
        assert_eq!(parse_inet_addr(out).as_deref(), Some("192.168.49.1"));
    }

    #[test]
    fn test_parse_ifconfig_addr() {
        let out = "wlan0: flags=4163  mtu 1500\n  inet addr:192.168.1.9  Bcast:192.168.1.255\n";
        assert_eq!(parse_ifconfig_addr(out).as_deref(), Some("192.168.1.9"));
    }
}
