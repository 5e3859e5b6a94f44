// Device Registry - Periodic device scanner producing connect/disconnect events
// Polls `adb devices -l`, diffs against known state, and enriches new devices
// with model/manufacturer properties.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adb::client::Transport;
use crate::error::{Error, Result};

/// Polls a serial must miss before it is dropped. A single empty poll is a
/// transient blip; the second confirms removal.
const MISSES_BEFORE_REMOVAL: u32 = 2;

/// Connection state reported by `adb devices`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum DeviceState {
    Device,
    Offline,
    Unauthorized,
    NoPermissions,
    Unknown(String),
}

impl From<&str> for DeviceState {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "device" => DeviceState::Device,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            "no-permissions" | "no" => DeviceState::NoPermissions,
            other => DeviceState::Unknown(other.to_string()),
        }
    }
}

/// An attached Android device as observed by the registry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Device {
    pub serial: String,
    pub state: DeviceState,
    pub model: Option<String>,
    pub product: Option<String>,
    pub transport_id: Option<String>,
}

impl Device {
    /// A serial containing `:` or `.` denotes a wireless connection.
    pub fn is_wireless(&self) -> bool {
        self.serial.contains(':') || self.serial.contains('.')
    }
}

/// Events emitted by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device appeared, or a known device changed state.
    Connected(Device),
    /// A device has been absent from two consecutive polls.
    Disconnected { serial: String },
    /// A poll failed; known state is left untouched.
    Error(String),
}

#[derive(Default)]
struct RegistryState {
    devices: HashMap<String, Device>,
    missed: HashMap<String, u32>,
}

/// Periodic device watcher. One logical poll runs at a time; callers that
/// arrive while a poll is in flight await its completion instead of starting
/// another.
pub struct Registry<T: Transport> {
    transport: Arc<T>,
    poll_interval: Duration,
    state: Arc<Mutex<RegistryState>>,
    poll_lock: Arc<Mutex<()>>,
    generation: watch::Sender<u64>,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl<T: Transport> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            poll_interval: self.poll_interval,
            state: Arc::clone(&self.state),
            poll_lock: Arc::clone(&self.poll_lock),
            generation: self.generation.clone(),
            events: self.events.clone(),
        }
    }
}

impl<T: Transport> Registry<T> {
    pub fn new(
        transport: Arc<T>,
        poll_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (generation, _) = watch::channel(0u64);
        (
            Self {
                transport,
                poll_interval,
                state: Arc::new(Mutex::new(RegistryState::default())),
                poll_lock: Arc::new(Mutex::new(())),
                generation,
                events,
            },
            rx,
        )
    }

    /// Spawn the periodic poll task. Abort the returned handle to stop it.
    pub fn start(&self) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.poll().await;
            }
        })
    }

    /// Run one poll, or await the poll already in flight.
    pub async fn poll(&self) {
        let mut rx = self.generation.subscribe();
        let seen = *rx.borrow();
        match self.poll_lock.try_lock() {
            Ok(_guard) => {
                self.scan().await;
                self.generation.send_modify(|n| *n += 1);
            }
            Err(_) => {
                // Coalesce: wait for the in-flight poll to finish.
                while *rx.borrow_and_update() <= seen {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Snapshot of known devices. Blocks until at least one poll has
    /// completed so an early call never reports empty out of ignorance.
    pub async fn devices(&self) -> Vec<Device> {
        self.ensure_polled().await;
        self.state.lock().await.devices.values().cloned().collect()
    }

    /// Look up a device by serial.
    pub async fn get(&self, serial: &str) -> Result<Device> {
        self.ensure_polled().await;
        self.state
            .lock()
            .await
            .devices
            .get(serial)
            .cloned()
            .ok_or_else(|| Error::DeviceUnknown {
                serial: serial.to_string(),
            })
    }

    async fn ensure_polled(&self) {
        if *self.generation.subscribe().borrow() == 0 {
            self.poll().await;
        }
    }

    async fn scan(&self) {
        let raw = match self.transport.devices_list().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("device poll failed: {e}");
                let _ = self.events.send(RegistryEvent::Error(e.to_string()));
                return;
            }
        };

        let parsed = parse_devices_output(&raw);
        let snapshot: HashMap<String, Device> = self.state.lock().await.devices.clone();

        let mut events = Vec::new();
        let mut updated: Vec<Device> = Vec::with_capacity(parsed.len());

        for mut device in parsed {
            match snapshot.get(&device.serial) {
                None => {
                    if device.state == DeviceState::Device {
                        if let Some(model) = self.enrich(&device.serial).await {
                            device.model = Some(model);
                        }
                        events.push(RegistryEvent::Connected(device.clone()));
                    } else {
                        debug!("observed {} in state {:?}", device.serial, device.state);
                    }
                }
                Some(known) if known.state != device.state => {
                    if device.state == DeviceState::Device {
                        if let Some(model) = self.enrich(&device.serial).await {
                            device.model = Some(model);
                        }
                    } else if device.model.is_none() {
                        device.model = known.model.clone();
                    }
                    events.push(RegistryEvent::Connected(device.clone()));
                }
                Some(known) => {
                    // Unchanged: keep previously enriched metadata.
                    if device.model.is_none() {
                        device.model = known.model.clone();
                    }
                    if device.product.is_none() {
                        device.product = known.product.clone();
                    }
                }
            }
            updated.push(device);
        }

        {
            let mut state = self.state.lock().await;
            let seen: Vec<String> = updated.iter().map(|d| d.serial.clone()).collect();
            for device in updated {
                state.missed.insert(device.serial.clone(), 0);
                state.devices.insert(device.serial.clone(), device);
            }
            let absent: Vec<String> = state
                .devices
                .keys()
                .filter(|s| !seen.contains(*s))
                .cloned()
                .collect();
            for serial in absent {
                let misses = state.missed.entry(serial.clone()).or_insert(0);
                *misses += 1;
                if *misses >= MISSES_BEFORE_REMOVAL {
                    state.devices.remove(&serial);
                    state.missed.remove(&serial);
                    events.push(RegistryEvent::Disconnected { serial });
                }
            }
        }

        for event in events {
            let _ = self.events.send(event);
        }
    }

    /// Resolve a friendly model name via getprop. The manufacturer is
    /// prepended unless it is already part of the model name.
    async fn enrich(&self, serial: &str) -> Option<String> {
        let model = self.prop(serial, "ro.product.model").await;
        let manufacturer = self.prop(serial, "ro.product.manufacturer").await;

        match (manufacturer, model) {
            (Some(manufacturer), Some(model)) => {
                if model.to_lowercase().contains(&manufacturer.to_lowercase()) {
                    Some(model)
                } else {
                    Some(format!("{manufacturer} {model}"))
                }
            }
            (None, Some(model)) => Some(model),
            (Some(manufacturer), None) => Some(manufacturer),
            (None, None) => None,
        }
    }

    async fn prop(&self, serial: &str, prop: &str) -> Option<String> {
        self.transport
            .shell(serial, &format!("getprop {prop}"))
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// Parse the output of `adb devices -l`.
fn parse_devices_output(output: &str) -> Vec<Device> {
    let mut devices = Vec::new();

    for line in output.lines().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }

        let serial = parts[0].to_string();
        let state = DeviceState::from(parts[1]);

        let mut model = None;
        let mut product = None;
        let mut transport_id = None;

        for part in parts.iter().skip(2) {
            if let Some(value) = part.strip_prefix("model:") {
                model = Some(value.replace('_', " "));
            } else if let Some(value) = part.strip_prefix("product:") {
                product = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("transport_id:") {
                transport_id = Some(value.to_string());
            }
        }

        devices.push(Device {
            serial,
            state,
            model,
            product,
            transport_id,
        });
    }

    devices
}
