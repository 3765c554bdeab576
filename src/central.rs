//! The central manager: the entry point of the crate.
//!
//! Owns the scan engine, the peripheral registries and the retry policy.
//! Peripherals move between three registries: `scanned` (known but idle),
//! `pending` (a connect attempt is running or queued behind the
//! autoconnect scan) and `connected`. All bookkeeping happens on a single
//! manager task that consumes session lifecycle events, scan engine
//! events and adapter power events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::BleError;
use crate::models::{
    AdapterState, Advertisement, BondState, ConnectFailure, DeviceAddress, HciStatus,
    PeripheralEvent, ScanFailure, ScanMode,
};
use crate::peripheral::{Peripheral, PinRegistry, SessionLifecycle, SessionMsg};
use crate::radio::{RadioStack, ScanConfig, ScanFilter};
use crate::scanner::{ScanEngine, ScanEngineEvent};
use crate::settings::CentralSettings;

/// One automatic retry per connect request.
const MAX_CONNECTION_RETRIES: u32 = 1;

/// Grace period after the adapter reports Off before tracked connections
/// are force-disconnected, in case the stack still delivers callbacks.
const ADAPTER_OFF_DISCONNECT_DELAY: Duration = Duration::from_secs(1);

/// Events on the manager's event channel.
#[derive(Debug, Clone)]
pub enum CentralEvent {
    Discovered {
        peripheral: Peripheral,
        advertisement: Advertisement,
    },
    Connecting(Peripheral),
    Connected(Peripheral),
    ConnectionFailed {
        peripheral: Peripheral,
        failure: ConnectFailure,
    },
    Disconnecting(Peripheral),
    Disconnected {
        peripheral: Peripheral,
        status: HciStatus,
    },
    ScanFailed(ScanFailure),
    AdapterStateChanged(AdapterState),
}

#[derive(Default)]
struct Registries {
    connected: HashMap<DeviceAddress, Peripheral>,
    pending: HashMap<DeviceAddress, Peripheral>,
    scanned: HashMap<DeviceAddress, Peripheral>,
    /// Uncached autoconnect targets waiting for a sighting.
    reconnect: Vec<DeviceAddress>,
    retries: HashMap<DeviceAddress, u32>,
}

struct Inner {
    radio: Arc<dyn RadioStack>,
    events: mpsc::UnboundedSender<CentralEvent>,
    settings: CentralSettings,
    scan_mode: Mutex<ScanMode>,
    pins: PinRegistry,
    registries: Mutex<Registries>,
    scanner: Mutex<ScanEngine>,
    lifecycle_tx: mpsc::UnboundedSender<(DeviceAddress, SessionLifecycle)>,
}

/// BLE central role: scanning, connecting and session tracking.
pub struct CentralManager {
    inner: Arc<Inner>,
    task: JoinHandle<()>,
}

impl CentralManager {
    /// Build a manager on top of a radio stack. Events are delivered on
    /// `events` in the order things happened.
    pub fn new(
        radio: Arc<dyn RadioStack>,
        events: mpsc::UnboundedSender<CentralEvent>,
        settings: CentralSettings,
    ) -> Self {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
        let adapter_rx = radio.adapter_events();

        let scanner = ScanEngine::new(Arc::clone(&radio), scan_tx);
        let scan_mode = settings.scan_mode;
        let inner = Arc::new(Inner {
            radio,
            events,
            settings,
            scan_mode: Mutex::new(scan_mode),
            pins: Arc::new(Mutex::new(HashMap::new())),
            registries: Mutex::new(Registries::default()),
            scanner: Mutex::new(scanner),
            lifecycle_tx,
        });

        let task = tokio::spawn(manager_task(
            Arc::clone(&inner),
            lifecycle_rx,
            scan_rx,
            adapter_rx,
        ));

        Self { inner, task }
    }

    /// Look up or lazily create the peripheral for an address.
    pub fn get_peripheral(&self, address: &str) -> Result<Peripheral, BleError> {
        let address = DeviceAddress::new(address)?;
        Ok(self.inner.get_or_create(&address, None))
    }

    /// Peripherals with an open connection.
    pub fn connected_peripherals(&self) -> Vec<Peripheral> {
        self.inner
            .registries
            .lock()
            .connected
            .values()
            .cloned()
            .collect()
    }

    /// Start an active connect attempt. Events for this peripheral are
    /// delivered on `events`. Connecting to an already connected or
    /// already connecting peripheral is a logged no-op.
    pub fn connect(&self, peripheral: &Peripheral, events: mpsc::UnboundedSender<PeripheralEvent>) {
        let address = peripheral.address().clone();
        {
            let mut reg = self.inner.registries.lock();
            if reg.connected.contains_key(&address) {
                warn!(%address, "already connected, connect ignored");
                return;
            }
            if reg.pending.contains_key(&address) {
                warn!(%address, "connection already in progress, connect ignored");
                return;
            }
            reg.scanned.remove(&address);
            reg.pending.insert(address.clone(), peripheral.clone());
            reg.retries.entry(address).or_insert(0);
        }
        peripheral.set_event_sender(events);
        peripheral.send_msg(SessionMsg::Connect { auto: false });
    }

    /// Connect whenever the peripheral becomes available. Cached devices
    /// use the stack's passive autoconnect, which never times out;
    /// uncached ones are watched for by a low-power scan and
    /// direct-connected on sighting.
    pub fn auto_connect(
        &self,
        peripheral: &Peripheral,
        events: mpsc::UnboundedSender<PeripheralEvent>,
    ) {
        self.auto_connect_batch(vec![(peripheral.clone(), events)]);
    }

    /// Autoconnect a batch in one call, so the uncached ones share a
    /// single scan start.
    pub fn auto_connect_batch(
        &self,
        batch: Vec<(Peripheral, mpsc::UnboundedSender<PeripheralEvent>)>,
    ) {
        let mut targets = Vec::new();
        for (peripheral, events) in batch {
            let address = peripheral.address().clone();
            {
                let reg = self.inner.registries.lock();
                if reg.connected.contains_key(&address) {
                    warn!(%address, "already connected, autoconnect ignored");
                    continue;
                }
                if reg.pending.contains_key(&address) || reg.reconnect.contains(&address) {
                    warn!(%address, "autoconnect already in progress");
                    continue;
                }
            }
            peripheral.set_event_sender(events);

            if self.inner.radio.is_cached(&address) {
                debug!(%address, "autoconnecting via stack cache");
                {
                    let mut reg = self.inner.registries.lock();
                    reg.scanned.remove(&address);
                    reg.pending.insert(address, peripheral.clone());
                }
                peripheral.send_msg(SessionMsg::Connect { auto: true });
            } else {
                debug!(%address, "device not cached, autoconnecting via scan");
                let mut reg = self.inner.registries.lock();
                reg.scanned
                    .entry(address.clone())
                    .or_insert_with(|| peripheral.clone());
                reg.reconnect.push(address);
                targets = reg.reconnect.clone();
            }
        }
        if !targets.is_empty() {
            self.inner.scanner.lock().start_autoconnect(targets);
        }
    }

    /// Cancel a connection or a pending autoconnect. Cancelling an
    /// autoconnect that is still waiting for a sighting reports a
    /// synthetic successful disconnect.
    pub fn cancel_connection(&self, peripheral: &Peripheral) -> Result<(), BleError> {
        let address = peripheral.address().clone();

        let was_reconnect_target = {
            let mut reg = self.inner.registries.lock();
            match reg.reconnect.iter().position(|a| a == &address) {
                Some(idx) => {
                    reg.reconnect.remove(idx);
                    Some(reg.reconnect.clone())
                }
                None => None,
            }
        };
        if let Some(remaining) = was_reconnect_target {
            info!(%address, "autoconnect cancelled before sighting");
            let mut scanner = self.inner.scanner.lock();
            scanner.stop_autoconnect();
            if !remaining.is_empty() {
                scanner.start_autoconnect(remaining);
            }
            drop(scanner);
            let _ = self.inner.events.send(CentralEvent::Disconnected {
                peripheral: peripheral.clone(),
                status: HciStatus::Success,
            });
            return Ok(());
        }

        let tracked = {
            let reg = self.inner.registries.lock();
            reg.connected.contains_key(&address) || reg.pending.contains_key(&address)
        };
        if !tracked {
            return Err(BleError::UnknownPeripheral(address.to_string()));
        }
        peripheral.send_msg(SessionMsg::CancelConnection);
        Ok(())
    }

    /// Scan for any advertising peripheral.
    pub fn scan_for_peripherals(&self) {
        self.start_discovery(ScanConfig::default());
    }

    pub fn scan_for_peripherals_with_services(&self, services: &[Uuid]) {
        self.start_discovery(ScanConfig {
            filters: services.iter().copied().map(ScanFilter::ServiceUuid).collect(),
            ..Default::default()
        });
    }

    pub fn scan_for_peripherals_with_addresses(&self, addresses: &[DeviceAddress]) {
        self.start_discovery(ScanConfig {
            filters: addresses.iter().cloned().map(ScanFilter::Address).collect(),
            ..Default::default()
        });
    }

    /// Scan for peripherals whose advertised name contains one of the
    /// given substrings.
    pub fn scan_for_peripherals_with_names(&self, names: &[String]) {
        self.start_discovery(ScanConfig {
            name_substrings: names.to_vec(),
            ..Default::default()
        });
    }

    pub fn scan_with_filters(&self, filters: Vec<ScanFilter>) {
        self.start_discovery(ScanConfig {
            filters,
            ..Default::default()
        });
    }

    fn start_discovery(&self, config: ScanConfig) {
        let mode = *self.inner.scan_mode.lock();
        self.inner.scanner.lock().start_discovery(config, mode);
    }

    pub fn stop_scan(&self) {
        self.inner.scanner.lock().stop_discovery();
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanner.lock().is_scanning()
    }

    /// Duty cycle for subsequent discovery scans.
    pub fn set_scan_mode(&self, mode: ScanMode) {
        *self.inner.scan_mode.lock() = mode;
    }

    /// Register a fixed 6-digit PIN used to answer pairing requests from
    /// this address.
    pub fn set_pin_code(&self, address: &DeviceAddress, pin: &str) -> Result<(), BleError> {
        if pin.len() != 6 || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BleError::InvalidPinCode);
        }
        self.inner.pins.lock().insert(address.clone(), pin.to_string());
        Ok(())
    }

    /// Stop all scans, tear down tracked connections and drop the
    /// registries.
    pub fn close(&self) {
        info!("closing central manager");
        self.inner.scanner.lock().stop_all();
        let (connected, pending) = {
            let mut reg = self.inner.registries.lock();
            reg.reconnect.clear();
            reg.retries.clear();
            reg.scanned.clear();
            (
                reg.connected.drain().collect::<Vec<_>>(),
                reg.pending.drain().collect::<Vec<_>>(),
            )
        };
        for (_, peripheral) in connected.into_iter().chain(pending) {
            peripheral.send_msg(SessionMsg::CancelConnection);
            peripheral.send_msg(SessionMsg::Shutdown);
        }
    }
}

impl Drop for CentralManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Inner {
    fn get_or_create(&self, address: &DeviceAddress, name: Option<String>) -> Peripheral {
        let mut reg = self.registries.lock();
        if let Some(p) = reg
            .connected
            .get(address)
            .or_else(|| reg.pending.get(address))
            .or_else(|| reg.scanned.get(address))
        {
            p.update_name(name);
            return p.clone();
        }
        let peripheral = Peripheral::spawn(
            address.clone(),
            name,
            BondState::None,
            Arc::clone(&self.radio),
            self.settings.quirks,
            Arc::clone(&self.pins),
            self.lifecycle_tx.clone(),
        );
        reg.scanned.insert(address.clone(), peripheral.clone());
        peripheral
    }

    fn tracked(&self, address: &DeviceAddress) -> Option<Peripheral> {
        let reg = self.registries.lock();
        reg.connected
            .get(address)
            .or_else(|| reg.pending.get(address))
            .or_else(|| reg.scanned.get(address))
            .cloned()
    }

    fn emit(&self, event: CentralEvent) {
        let _ = self.events.send(event);
    }

    fn handle_lifecycle(&self, address: DeviceAddress, lifecycle: SessionLifecycle) {
        let Some(peripheral) = self.tracked(&address) else {
            debug!(%address, ?lifecycle, "lifecycle event for untracked peripheral");
            return;
        };
        match lifecycle {
            SessionLifecycle::Connecting => {
                self.emit(CentralEvent::Connecting(peripheral));
            }
            SessionLifecycle::Connected => {
                {
                    let mut reg = self.registries.lock();
                    reg.pending.remove(&address);
                    reg.scanned.remove(&address);
                    reg.retries.remove(&address);
                    reg.connected.insert(address.clone(), peripheral.clone());
                }
                self.emit(CentralEvent::Connected(peripheral));
            }
            SessionLifecycle::ConnectFailed(status) => {
                let failure = ConnectFailure::classify(status);
                let retry = {
                    let mut reg = self.registries.lock();
                    let attempts = reg.retries.entry(address.clone()).or_insert(0);
                    if !failure.is_establishment() && *attempts < MAX_CONNECTION_RETRIES {
                        *attempts += 1;
                        true
                    } else {
                        reg.retries.remove(&address);
                        reg.pending.remove(&address);
                        reg.connected.remove(&address);
                        reg.scanned.insert(address.clone(), peripheral.clone());
                        false
                    }
                };
                if retry {
                    info!(%address, ?failure, "retrying connection");
                    peripheral.send_msg(SessionMsg::Connect { auto: false });
                } else {
                    warn!(%address, ?failure, "connection failed");
                    self.emit(CentralEvent::ConnectionFailed {
                        peripheral,
                        failure,
                    });
                }
            }
            SessionLifecycle::Disconnecting => {
                self.emit(CentralEvent::Disconnecting(peripheral));
            }
            SessionLifecycle::Disconnected(status) => {
                {
                    let mut reg = self.registries.lock();
                    reg.connected.remove(&address);
                    reg.pending.remove(&address);
                    reg.retries.remove(&address);
                    reg.scanned.insert(address.clone(), peripheral.clone());
                }
                self.emit(CentralEvent::Disconnected { peripheral, status });
            }
        }
    }

    fn handle_scan_event(&self, event: ScanEngineEvent) {
        match event {
            ScanEngineEvent::Discovered(advertisement) => {
                let peripheral =
                    self.get_or_create(&advertisement.address, advertisement.local_name.clone());
                self.emit(CentralEvent::Discovered {
                    peripheral,
                    advertisement,
                });
            }
            ScanEngineEvent::AutoConnectSighting(address) => {
                let (peripheral, remaining) = {
                    let mut reg = self.registries.lock();
                    reg.reconnect.retain(|a| a != &address);
                    let remaining = reg.reconnect.clone();
                    let peripheral = reg.scanned.remove(&address);
                    if let Some(p) = &peripheral {
                        reg.pending.insert(address.clone(), p.clone());
                        reg.retries.entry(address.clone()).or_insert(0);
                    }
                    (peripheral, remaining)
                };
                match peripheral {
                    Some(peripheral) => {
                        info!(%address, "autoconnect target seen, connecting");
                        peripheral.send_msg(SessionMsg::Connect { auto: false });
                    }
                    None => warn!(%address, "sighting for unknown autoconnect target"),
                }
                let mut scanner = self.scanner.lock();
                scanner.stop_autoconnect();
                if !remaining.is_empty() {
                    scanner.start_autoconnect(remaining);
                }
            }
            ScanEngineEvent::ScanFailed(failure) => {
                error!(?failure, "scan failed");
                let mut scanner = self.scanner.lock();
                scanner.stop_discovery();
                scanner.stop_autoconnect();
                drop(scanner);
                self.emit(CentralEvent::ScanFailed(failure));
            }
        }
    }
}

async fn manager_task(
    inner: Arc<Inner>,
    mut lifecycle_rx: mpsc::UnboundedReceiver<(DeviceAddress, SessionLifecycle)>,
    mut scan_rx: mpsc::UnboundedReceiver<ScanEngineEvent>,
    mut adapter_rx: mpsc::UnboundedReceiver<AdapterState>,
) {
    let (off_tx, mut off_rx) = mpsc::unbounded_channel::<()>();
    let mut off_timer: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            lifecycle = lifecycle_rx.recv() => match lifecycle {
                Some((address, event)) => inner.handle_lifecycle(address, event),
                None => break,
            },
            scan_event = scan_rx.recv() => match scan_event {
                Some(event) => inner.handle_scan_event(event),
                None => break,
            },
            adapter = adapter_rx.recv() => match adapter {
                Some(state) => {
                    handle_adapter_state(&inner, state, &off_tx, &mut off_timer);
                }
                None => break,
            },
            _ = off_rx.recv() => {
                off_timer = None;
                force_disconnect_all(&inner);
            }
        }
    }
}

fn handle_adapter_state(
    inner: &Arc<Inner>,
    state: AdapterState,
    off_tx: &mpsc::UnboundedSender<()>,
    off_timer: &mut Option<JoinHandle<()>>,
) {
    info!(?state, "adapter state changed");
    match state {
        AdapterState::Off => {
            let has_tracked = {
                let reg = inner.registries.lock();
                !reg.connected.is_empty() || !reg.pending.is_empty()
            };
            if has_tracked && off_timer.is_none() {
                // Some stacks still deliver disconnect callbacks right
                // after powering off; give them a moment before forcing.
                let tx = off_tx.clone();
                *off_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(ADAPTER_OFF_DISCONNECT_DELAY).await;
                    let _ = tx.send(());
                }));
            }
        }
        AdapterState::TurningOff => {
            inner.scanner.lock().stop_all();
        }
        AdapterState::On | AdapterState::TurningOn => {
            if let Some(timer) = off_timer.take() {
                timer.abort();
            }
        }
    }
    inner.emit(CentralEvent::AdapterStateChanged(state));
}

fn force_disconnect_all(inner: &Arc<Inner>) {
    let tracked: Vec<Peripheral> = {
        let reg = inner.registries.lock();
        reg.connected
            .values()
            .chain(reg.pending.values())
            .cloned()
            .collect()
    };
    for peripheral in tracked {
        warn!(address = %peripheral.address(), "forcing disconnect, adapter is off");
        peripheral.send_msg(SessionMsg::ForceDisconnect);
    }
}
