//! One peripheral: connection lifecycle, attribute command queue and the
//! per-connection bonding logic.
//!
//! ```text
//!   Peripheral (cloneable handle)
//!       | validates args against the mirrored state, then enqueues
//!       v
//!   SessionMsg channel --> session actor task
//!                              |  owns the GattLink, the command queue
//!                              |  and all timers for this peripheral
//!                              v
//!                          GattEvent stream (forwarded into the actor)
//! ```
//!
//! The actor serializes everything: attribute commands run one at a time
//! and a command is only released when its completion event arrives, the
//! link drops, or it exhausts its tries.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bonding::{BondAction, BondContext, BondCoordinator};
use crate::error::BleError;
use crate::models::{
    BondState, Characteristic, CharacteristicId, ConnectionPriority, ConnectionState, DescriptorId,
    DeviceAddress, GattStatus, HciStatus, PeripheralEvent, PhyOptions, PhyType, Service, WriteType,
    CCC_DESCRIPTOR_UUID, DEFAULT_MTU, MAX_MTU,
};
use crate::radio::{GattEvent, GattLink, RadioStack};
use crate::settings::StackQuirks;

/// Give up on an active connect attempt after this long.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(35);

/// Connect timer under the short-supervision stack quirk.
const SHORT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(4500);

/// A generic connect error reported later than this is really the stack
/// giving up on the attempt, and is classified as an establishment
/// failure.
const ESTABLISHMENT_THRESHOLD: Duration = Duration::from_secs(25);
const SHORT_ESTABLISHMENT_THRESHOLD: Duration = Duration::from_millis(4500);

/// Stacks never confirm a disconnect for a link that was still connecting;
/// synthesize one after this grace period.
const CANCEL_GRACE: Duration = Duration::from_millis(50);

/// Let the stack settle after bonding before re-issuing the parked
/// command.
const RETRY_AFTER_BOND_DELAY: Duration = Duration::from_millis(50);

/// Wait before reporting the connect failure that follows a lost bond, so
/// the stack can finish dropping its keys.
const BOND_LOST_SETTLE: Duration = Duration::from_secs(1);

/// Discovery delay for bonded peripherals under the discovery-race quirk.
const BONDED_DISCOVERY_DELAY: Duration = Duration::from_secs(1);

/// Connection-priority requests get no completion from the stack; hold the
/// queue this long instead.
const PRIORITY_SETTLE: Duration = Duration::from_millis(500);

/// A command may run at most this many times (first run plus one retry).
const MAX_COMMAND_TRIES: u32 = 2;

/// ATT limit for a long write with response.
const MAX_WRITE_WITH_RESPONSE: usize = 512;

/// Session lifecycle notifications consumed by the central manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionLifecycle {
    Connecting,
    Connected,
    ConnectFailed(HciStatus),
    Disconnecting,
    Disconnected(HciStatus),
}

pub(crate) type LifecycleSender = mpsc::UnboundedSender<(DeviceAddress, SessionLifecycle)>;

/// Registry of fixed PINs, shared with the manager.
pub(crate) type PinRegistry = Arc<Mutex<std::collections::HashMap<DeviceAddress, String>>>;

/// A queued attribute operation.
#[derive(Debug, Clone)]
pub(crate) enum Command {
    ReadCharacteristic(CharacteristicId),
    WriteCharacteristic {
        id: CharacteristicId,
        value: Vec<u8>,
        write_type: WriteType,
    },
    ReadDescriptor(DescriptorId),
    WriteDescriptor {
        id: DescriptorId,
        value: Vec<u8>,
    },
    SetNotify {
        id: CharacteristicId,
        enable: bool,
    },
    ReadRssi,
    RequestMtu(u16),
    RequestConnectionPriority(ConnectionPriority),
    SetPreferredPhy {
        tx: PhyType,
        rx: PhyType,
        options: PhyOptions,
    },
    ReadPhy,
    CreateBond,
}

struct PendingCommand {
    command: Command,
    tries: u32,
}

/// Messages into the session actor.
pub(crate) enum SessionMsg {
    Connect { auto: bool },
    CancelConnection,
    Enqueue(Command),
    Gatt { gen: u64, event: GattEvent },
    ConnectTimeout { gen: u64 },
    SynthesizeDisconnect { gen: u64 },
    DiscoverNow { gen: u64 },
    RetryBlocked { gen: u64 },
    BondLostSettled { gen: u64 },
    PrioritySettled { gen: u64 },
    /// The adapter died under the link; no confirmation will ever come.
    ForceDisconnect,
    Shutdown,
}

/// State mirrored out of the actor so handle methods can validate and
/// answer queries without a round trip.
struct Mirror {
    connection_state: ConnectionState,
    services_discovered: bool,
    name: Option<String>,
    bond_state: BondState,
    mtu: u16,
    services: Vec<Service>,
    notifying: HashSet<CharacteristicId>,
    events: Option<mpsc::UnboundedSender<PeripheralEvent>>,
}

struct Shared {
    address: DeviceAddress,
    mirror: Mutex<Mirror>,
}

/// Cloneable handle to one peripheral. Obtained from the central manager;
/// all methods are cheap and non-blocking.
#[derive(Clone)]
pub struct Peripheral {
    shared: Arc<Shared>,
    control: mpsc::UnboundedSender<SessionMsg>,
}

impl std::fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peripheral")
            .field("address", &self.shared.address)
            .finish()
    }
}

impl Peripheral {
    pub(crate) fn spawn(
        address: DeviceAddress,
        name: Option<String>,
        bond_state: BondState,
        radio: Arc<dyn RadioStack>,
        quirks: StackQuirks,
        pins: PinRegistry,
        lifecycle: LifecycleSender,
    ) -> Self {
        let shared = Arc::new(Shared {
            address: address.clone(),
            mirror: Mutex::new(Mirror {
                connection_state: ConnectionState::Disconnected,
                services_discovered: false,
                name,
                bond_state,
                mtu: DEFAULT_MTU,
                services: Vec::new(),
                notifying: HashSet::new(),
                events: None,
            }),
        });

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let session = Session {
            shared: Arc::clone(&shared),
            radio,
            quirks,
            pins,
            lifecycle,
            control: control_tx.clone(),
            link: None,
            link_gen: 0,
            timer_gen: 0,
            queue: VecDeque::new(),
            busy: false,
            blocked_for_bonding: false,
            current_write: None,
            bonds: BondCoordinator::new(),
            discovery_in_progress: false,
            connect_started: None,
            connect_timer: None,
        };
        tokio::spawn(session.run(control_rx));

        Self {
            shared,
            control: control_tx,
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.shared.address
    }

    /// Last name seen for this peripheral, either advertised or cached by
    /// the stack.
    pub fn name(&self) -> Option<String> {
        self.shared.mirror.lock().name.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.mirror.lock().connection_state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn bond_state(&self) -> BondState {
        self.shared.mirror.lock().bond_state
    }

    /// Negotiated ATT MTU; 23 until an MTU request succeeds.
    pub fn mtu(&self) -> u16 {
        self.shared.mirror.lock().mtu
    }

    /// Discovered services; empty until `ServicesDiscovered` fires.
    pub fn services(&self) -> Vec<Service> {
        self.shared.mirror.lock().services.clone()
    }

    pub fn service(&self, uuid: uuid::Uuid) -> Option<Service> {
        self.shared
            .mirror
            .lock()
            .services
            .iter()
            .find(|s| s.uuid == uuid)
            .cloned()
    }

    pub fn is_notifying(&self, id: CharacteristicId) -> bool {
        self.shared.mirror.lock().notifying.contains(&id)
    }

    pub fn notifying_characteristics(&self) -> Vec<CharacteristicId> {
        self.shared.mirror.lock().notifying.iter().copied().collect()
    }

    /// Largest payload a single write of the given type can carry at the
    /// current MTU.
    pub fn maximum_write_value_length(&self, write_type: WriteType) -> usize {
        let mtu = self.mtu() as usize;
        match write_type {
            WriteType::WithResponse => MAX_WRITE_WITH_RESPONSE,
            WriteType::Signed => mtu - 15,
            WriteType::WithoutResponse => mtu - 3,
        }
    }

    /// Queue a read. Completion arrives as
    /// [`PeripheralEvent::CharacteristicUpdated`].
    pub fn read_characteristic(&self, id: CharacteristicId) -> Result<(), BleError> {
        let characteristic = self.require_characteristic(id)?;
        if !characteristic.properties.supports_read() {
            return Err(BleError::NotReadable);
        }
        self.enqueue(Command::ReadCharacteristic(id))
    }

    /// Queue a write. The payload must be non-empty and fit the write
    /// type's limit at the current MTU.
    pub fn write_characteristic(
        &self,
        id: CharacteristicId,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), BleError> {
        let characteristic = self.require_characteristic(id)?;
        if value.is_empty() {
            return Err(BleError::EmptyValue);
        }
        let maximum = self.maximum_write_value_length(write_type);
        if value.len() > maximum {
            return Err(BleError::ValueTooLong {
                length: value.len(),
                maximum,
            });
        }
        if !characteristic.properties.supports_write_type(write_type) {
            return Err(BleError::NotWritable);
        }
        self.enqueue(Command::WriteCharacteristic {
            id,
            value: value.to_vec(),
            write_type,
        })
    }

    pub fn read_descriptor(&self, id: DescriptorId) -> Result<(), BleError> {
        self.require_descriptor(id)?;
        self.enqueue(Command::ReadDescriptor(id))
    }

    pub fn write_descriptor(&self, id: DescriptorId, value: &[u8]) -> Result<(), BleError> {
        self.require_descriptor(id)?;
        if value.is_empty() {
            return Err(BleError::EmptyValue);
        }
        self.enqueue(Command::WriteDescriptor {
            id,
            value: value.to_vec(),
        })
    }

    /// Enable or disable notifications/indications. Internally writes the
    /// CCC descriptor; completion arrives as
    /// [`PeripheralEvent::NotificationStateUpdated`].
    pub fn set_notify(&self, id: CharacteristicId, enable: bool) -> Result<(), BleError> {
        let characteristic = self.require_characteristic(id)?;
        if !characteristic.properties.supports_notify()
            && !characteristic.properties.supports_indicate()
        {
            return Err(BleError::NotifyNotSupported);
        }
        if characteristic.descriptor(CCC_DESCRIPTOR_UUID).is_none() {
            return Err(BleError::NotifyNotSupported);
        }
        self.enqueue(Command::SetNotify { id, enable })
    }

    pub fn read_rssi(&self) -> Result<(), BleError> {
        self.require_connected()?;
        self.enqueue(Command::ReadRssi)
    }

    pub fn request_mtu(&self, mtu: u16) -> Result<(), BleError> {
        self.require_connected()?;
        if !(DEFAULT_MTU..=MAX_MTU).contains(&mtu) {
            return Err(BleError::InvalidMtu(mtu));
        }
        self.enqueue(Command::RequestMtu(mtu))
    }

    pub fn request_connection_priority(
        &self,
        priority: ConnectionPriority,
    ) -> Result<(), BleError> {
        self.require_connected()?;
        self.enqueue(Command::RequestConnectionPriority(priority))
    }

    pub fn set_preferred_phy(
        &self,
        tx: PhyType,
        rx: PhyType,
        options: PhyOptions,
    ) -> Result<(), BleError> {
        self.require_connected()?;
        self.enqueue(Command::SetPreferredPhy { tx, rx, options })
    }

    pub fn read_phy(&self) -> Result<(), BleError> {
        self.require_connected()?;
        self.enqueue(Command::ReadPhy)
    }

    /// Queue pairing with the connected peripheral.
    pub fn create_bond(&self) -> Result<(), BleError> {
        self.require_connected()?;
        self.enqueue(Command::CreateBond)
    }

    fn require_connected(&self) -> Result<(), BleError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BleError::NotConnected)
        }
    }

    fn require_characteristic(&self, id: CharacteristicId) -> Result<Characteristic, BleError> {
        self.require_connected()?;
        self.shared
            .mirror
            .lock()
            .services
            .iter()
            .find(|s| s.uuid == id.service)
            .and_then(|s| s.characteristic(id.characteristic))
            .cloned()
            .ok_or(BleError::CharacteristicNotFound(id))
    }

    fn require_descriptor(&self, id: DescriptorId) -> Result<(), BleError> {
        let characteristic = self.require_characteristic(id.characteristic_id())?;
        if characteristic.descriptor(id.descriptor).is_none() {
            return Err(BleError::DescriptorNotFound(id));
        }
        Ok(())
    }

    fn enqueue(&self, command: Command) -> Result<(), BleError> {
        self.control
            .send(SessionMsg::Enqueue(command))
            .map_err(|_| BleError::SessionClosed)
    }

    // Manager-side plumbing.

    pub(crate) fn send_msg(&self, msg: SessionMsg) {
        let _ = self.control.send(msg);
    }

    pub(crate) fn set_event_sender(&self, sender: mpsc::UnboundedSender<PeripheralEvent>) {
        self.shared.mirror.lock().events = Some(sender);
    }

    pub(crate) fn update_name(&self, name: Option<String>) {
        if name.is_some() {
            self.shared.mirror.lock().name = name;
        }
    }
}

struct Session {
    shared: Arc<Shared>,
    radio: Arc<dyn RadioStack>,
    quirks: StackQuirks,
    pins: PinRegistry,
    lifecycle: LifecycleSender,
    control: mpsc::UnboundedSender<SessionMsg>,
    link: Option<Box<dyn GattLink>>,
    /// Bumped every time a link is opened or torn down; events and timers
    /// from an older generation are dropped.
    link_gen: u64,
    timer_gen: u64,
    queue: VecDeque<PendingCommand>,
    busy: bool,
    /// The in-flight command hit an encryption error and waits for
    /// bonding.
    blocked_for_bonding: bool,
    /// Payload of the in-flight write, echoed in the completion event.
    current_write: Option<Vec<u8>>,
    bonds: BondCoordinator,
    discovery_in_progress: bool,
    connect_started: Option<Instant>,
    connect_timer: Option<JoinHandle<()>>,
}

impl Session {
    async fn run(mut self, mut control_rx: mpsc::UnboundedReceiver<SessionMsg>) {
        while let Some(msg) = control_rx.recv().await {
            match msg {
                SessionMsg::Connect { auto } => self.handle_connect(auto),
                SessionMsg::CancelConnection => self.handle_cancel(),
                SessionMsg::Enqueue(command) => self.handle_enqueue(command),
                SessionMsg::Gatt { gen, event } => {
                    if gen == self.link_gen {
                        self.handle_gatt(event);
                    }
                }
                SessionMsg::ConnectTimeout { gen } => self.handle_connect_timeout(gen),
                SessionMsg::SynthesizeDisconnect { gen } => {
                    if gen == self.timer_gen {
                        self.complete_disconnect(HciStatus::Success, true);
                    }
                }
                SessionMsg::DiscoverNow { gen } => {
                    if gen == self.timer_gen {
                        self.start_discovery();
                    }
                }
                SessionMsg::RetryBlocked { gen } => self.handle_retry_blocked(gen),
                SessionMsg::BondLostSettled { gen } => {
                    if gen == self.timer_gen {
                        self.notify_lifecycle(SessionLifecycle::ConnectFailed(HciStatus::Error));
                    }
                }
                SessionMsg::PrioritySettled { gen } => {
                    if gen == self.timer_gen && self.busy {
                        self.completed_command();
                    }
                }
                SessionMsg::ForceDisconnect => {
                    if self.state() != ConnectionState::Disconnected {
                        self.complete_disconnect(HciStatus::Success, true);
                    }
                }
                SessionMsg::Shutdown => break,
            }
        }
        if let Some(link) = self.link.as_mut() {
            link.close();
        }
    }

    fn state(&self) -> ConnectionState {
        self.shared.mirror.lock().connection_state
    }

    fn set_state(&self, state: ConnectionState) {
        self.shared.mirror.lock().connection_state = state;
    }

    fn notify_lifecycle(&self, lifecycle: SessionLifecycle) {
        let _ = self
            .lifecycle
            .send((self.shared.address.clone(), lifecycle));
    }

    fn emit(&self, event: PeripheralEvent) {
        let sender = self.shared.mirror.lock().events.clone();
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
    }

    fn spawn_timer(&self, after: Duration, msg: impl FnOnce(u64) -> SessionMsg) -> JoinHandle<()> {
        let control = self.control.clone();
        let msg = msg(self.timer_gen);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = control.send(msg);
        })
    }

    // ---- connection lifecycle ----

    fn handle_connect(&mut self, auto: bool) {
        if self.state() != ConnectionState::Disconnected {
            warn!(address = %self.shared.address, state = ?self.state(),
                "connect ignored, not disconnected");
            return;
        }
        info!(address = %self.shared.address, auto, "connecting");
        self.timer_gen += 1;
        {
            let mut mirror = self.shared.mirror.lock();
            mirror.connection_state = ConnectionState::Connecting;
            mirror.services_discovered = false;
            mirror.services.clear();
            mirror.notifying.clear();
        }
        self.bonds.reset_connection_flags();
        self.notify_lifecycle(SessionLifecycle::Connecting);

        self.link_gen += 1;
        let (gatt_tx, mut gatt_rx) = mpsc::unbounded_channel();
        match self.radio.connect_gatt(&self.shared.address, auto, gatt_tx) {
            Ok(link) => {
                self.link = Some(link);
                self.connect_started = Some(Instant::now());

                // Forward link events into the actor, tagged with the link
                // generation so a closed link cannot leak events.
                let control = self.control.clone();
                let gen = self.link_gen;
                tokio::spawn(async move {
                    while let Some(event) = gatt_rx.recv().await {
                        if control.send(SessionMsg::Gatt { gen, event }).is_err() {
                            break;
                        }
                    }
                });

                // Autoconnect attempts wait for the device indefinitely.
                if !auto {
                    let timeout = if self.quirks.short_connection_timeout {
                        SHORT_CONNECTION_TIMEOUT
                    } else {
                        CONNECTION_TIMEOUT
                    };
                    self.connect_timer =
                        Some(self.spawn_timer(timeout, |gen| SessionMsg::ConnectTimeout { gen }));
                }
            }
            Err(status) => {
                error!(address = %self.shared.address, ?status, "connect_gatt failed");
                self.set_state(ConnectionState::Disconnected);
                self.notify_lifecycle(SessionLifecycle::ConnectFailed(status));
            }
        }
    }

    fn handle_cancel(&mut self) {
        let state = self.state();
        let Some(link) = self.link.as_mut() else {
            warn!(address = %self.shared.address, "cancel ignored, no active link");
            return;
        };
        match state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                link.disconnect();
                self.set_state(ConnectionState::Disconnecting);
                self.notify_lifecycle(SessionLifecycle::Disconnecting);
                if state == ConnectionState::Connecting {
                    // No callback will come for a link that never reached
                    // Connected.
                    let _ = self
                        .spawn_timer(CANCEL_GRACE, |gen| SessionMsg::SynthesizeDisconnect { gen });
                }
            }
            _ => {
                debug!(address = %self.shared.address, ?state, "cancel ignored");
            }
        }
    }

    fn handle_connect_timeout(&mut self, gen: u64) {
        if gen != self.timer_gen || self.state() != ConnectionState::Connecting {
            return;
        }
        warn!(address = %self.shared.address, "connect attempt timed out");
        if let Some(link) = self.link.as_mut() {
            link.disconnect();
        }
        // The stack never confirms the disconnect of a link that was still
        // connecting. A timed-out attempt is reported as an establishment
        // failure and is not retried.
        self.complete_connect_failure(HciStatus::ConnectionFailedEstablishment);
    }

    fn complete_connect_failure(&mut self, status: HciStatus) {
        self.teardown_link();
        self.set_state(ConnectionState::Disconnected);
        self.notify_lifecycle(SessionLifecycle::ConnectFailed(status));
    }

    fn handle_connection_state_change(&mut self, state: ConnectionState, status: HciStatus) {
        let previous = self.state();
        match state {
            ConnectionState::Connected => {
                self.cancel_connect_timer();
                self.set_state(ConnectionState::Connected);
                info!(address = %self.shared.address, "connected");
                self.notify_lifecycle(SessionLifecycle::Connected);
                self.schedule_discovery();
            }
            ConnectionState::Disconnected => {
                self.cancel_connect_timer();
                if status == HciStatus::Success {
                    self.handle_successful_disconnect(previous);
                } else {
                    self.handle_unsuccessful_disconnect(previous, status);
                }
            }
            ConnectionState::Disconnecting => {
                self.set_state(ConnectionState::Disconnecting);
                self.notify_lifecycle(SessionLifecycle::Disconnecting);
            }
            ConnectionState::Connecting => {
                self.set_state(ConnectionState::Connecting);
            }
        }
    }

    fn handle_successful_disconnect(&mut self, previous: ConnectionState) {
        if previous == ConnectionState::Connecting {
            // Cancelled before the link came up.
            self.complete_disconnect(HciStatus::Success, true);
            return;
        }
        if self.bonds.bond_lost() {
            info!(address = %self.shared.address,
                "disconnected after bond loss, letting the stack settle");
            self.complete_disconnect(HciStatus::Success, false);
            let _ = self.spawn_timer(BOND_LOST_SETTLE, |gen| SessionMsg::BondLostSettled { gen });
            self.bonds.clear_bond_lost();
            return;
        }
        self.complete_disconnect(HciStatus::Success, true);
    }

    fn handle_unsuccessful_disconnect(&mut self, previous: ConnectionState, status: HciStatus) {
        let services_discovered = self.shared.mirror.lock().services_discovered;
        match previous {
            ConnectionState::Connecting => {
                let adjusted = self.adjust_connect_status(status);
                warn!(address = %self.shared.address, ?adjusted, "connect attempt failed");
                self.complete_connect_failure(adjusted);
            }
            ConnectionState::Connected if !services_discovered => {
                warn!(address = %self.shared.address, ?status,
                    "link dropped before service discovery");
                self.complete_connect_failure(status);
            }
            _ => {
                warn!(address = %self.shared.address, ?status, "disconnected");
                self.complete_disconnect(status, true);
            }
        }
    }

    /// A generic error long into a connect attempt is really the stack
    /// giving up; report it as an establishment failure.
    fn adjust_connect_status(&self, status: HciStatus) -> HciStatus {
        if status != HciStatus::Error {
            return status;
        }
        let threshold = if self.quirks.short_connection_timeout {
            SHORT_ESTABLISHMENT_THRESHOLD
        } else {
            ESTABLISHMENT_THRESHOLD
        };
        match self.connect_started {
            Some(started) if started.elapsed() > threshold => {
                HciStatus::ConnectionFailedEstablishment
            }
            _ => status,
        }
    }

    fn complete_disconnect(&mut self, status: HciStatus, notify: bool) {
        self.teardown_link();
        self.set_state(ConnectionState::Disconnected);
        if notify {
            self.notify_lifecycle(SessionLifecycle::Disconnected(status));
        }
    }

    fn teardown_link(&mut self) {
        self.cancel_connect_timer();
        self.timer_gen += 1;
        self.link_gen += 1;
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.queue.clear();
        self.busy = false;
        self.blocked_for_bonding = false;
        self.current_write = None;
        self.discovery_in_progress = false;
        self.connect_started = None;
        let mut mirror = self.shared.mirror.lock();
        mirror.notifying.clear();
        mirror.services_discovered = false;
    }

    fn cancel_connect_timer(&mut self) {
        if let Some(timer) = self.connect_timer.take() {
            timer.abort();
        }
    }

    // ---- service discovery ----

    fn schedule_discovery(&mut self) {
        let bond_state = self.shared.mirror.lock().bond_state;
        match bond_state {
            BondState::Bonding => {
                // Discovery is kicked off by the bond transition.
                debug!(address = %self.shared.address, "bonding in progress, discovery deferred");
            }
            BondState::Bonded if self.quirks.delayed_discovery_when_bonded => {
                debug!(address = %self.shared.address, "delaying discovery for bonded peripheral");
                let _ =
                    self.spawn_timer(BONDED_DISCOVERY_DELAY, |gen| SessionMsg::DiscoverNow { gen });
            }
            _ => self.start_discovery(),
        }
    }

    fn start_discovery(&mut self) {
        if self.discovery_in_progress || self.state() != ConnectionState::Connected {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        debug!(address = %self.shared.address, "discovering services");
        if link.discover_services() {
            self.discovery_in_progress = true;
        } else {
            error!(address = %self.shared.address, "failed to start service discovery");
            link.disconnect();
        }
    }

    fn handle_services_discovered(&mut self, result: Result<Vec<Service>, GattStatus>) {
        self.discovery_in_progress = false;
        match result {
            Ok(services) => {
                info!(address = %self.shared.address, count = services.len(),
                    "services discovered");
                {
                    let mut mirror = self.shared.mirror.lock();
                    mirror.services = services.clone();
                    mirror.services_discovered = true;
                }
                self.emit(PeripheralEvent::ServicesDiscovered { services });
                self.next_command();
            }
            Err(status) => {
                error!(address = %self.shared.address, ?status, "service discovery failed");
                if let Some(link) = self.link.as_mut() {
                    link.disconnect();
                }
            }
        }
    }

    // ---- command queue ----

    fn handle_enqueue(&mut self, command: Command) {
        if self.state() != ConnectionState::Connected {
            debug!(address = %self.shared.address, "dropping command, not connected");
            return;
        }
        self.queue.push_back(PendingCommand { command, tries: 0 });
        self.next_command();
    }

    fn next_command(&mut self) {
        if self.busy || self.blocked_for_bonding {
            return;
        }
        if self.state() != ConnectionState::Connected || self.link.is_none() {
            if !self.queue.is_empty() {
                debug!(address = %self.shared.address, "not connected, clearing command queue");
                self.queue.clear();
            }
            return;
        }
        let Some(pending) = self.queue.front_mut() else {
            return;
        };
        if pending.tries >= MAX_COMMAND_TRIES {
            warn!(address = %self.shared.address, "command exhausted its retries");
            self.fail_current(GattStatus::Error);
            return;
        }
        pending.tries += 1;
        self.busy = true;
        let command = pending.command.clone();
        let started = self.execute(command);
        if !started {
            error!(address = %self.shared.address, "command failed to start");
            self.fail_current(GattStatus::Error);
        }
    }

    fn execute(&mut self, command: Command) -> bool {
        // Resolved before the link borrow; needs the mirrored services.
        let ccc_value = match &command {
            Command::SetNotify { id, enable } => Some(self.ccc_value(*id, *enable)),
            _ => None,
        };
        let Some(link) = self.link.as_mut() else {
            return false;
        };
        let mut hold_queue = false;
        let started = match command {
            Command::ReadCharacteristic(id) => link.read_characteristic(id),
            Command::WriteCharacteristic {
                id,
                value,
                write_type,
            } => {
                let started = link.write_characteristic(id, &value, write_type);
                if started {
                    self.current_write = Some(value);
                }
                started
            }
            Command::ReadDescriptor(id) => link.read_descriptor(id),
            Command::WriteDescriptor { id, value } => {
                let started = link.write_descriptor(id, &value);
                if started {
                    self.current_write = Some(value);
                }
                started
            }
            Command::SetNotify { id, enable } => {
                if link.set_characteristic_notification(id, enable) {
                    let value = ccc_value.unwrap_or([0x00, 0x00]);
                    let ccc = DescriptorId::new(id.service, id.characteristic, CCC_DESCRIPTOR_UUID);
                    link.write_descriptor(ccc, &value)
                } else {
                    false
                }
            }
            Command::ReadRssi => link.read_rssi(),
            Command::RequestMtu(mtu) => link.request_mtu(mtu),
            Command::RequestConnectionPriority(priority) => {
                // No completion callback exists for this request; hold the
                // queue for a settle period instead.
                hold_queue = link.request_connection_priority(priority);
                hold_queue
            }
            Command::SetPreferredPhy { tx, rx, options } => link.set_preferred_phy(tx, rx, options),
            Command::ReadPhy => link.read_phy(),
            Command::CreateBond => {
                self.bonds.begin_manual_bond();
                link.create_bond()
            }
        };
        if hold_queue {
            let _ = self.spawn_timer(PRIORITY_SETTLE, |gen| SessionMsg::PrioritySettled { gen });
        }
        started
    }

    /// CCC payload for enabling/disabling, picking notification over
    /// indication when both are supported.
    fn ccc_value(&self, id: CharacteristicId, enable: bool) -> [u8; 2] {
        if !enable {
            return [0x00, 0x00];
        }
        let notify = self
            .shared
            .mirror
            .lock()
            .services
            .iter()
            .find(|s| s.uuid == id.service)
            .and_then(|s| s.characteristic(id.characteristic))
            .map(|c| c.properties.supports_notify())
            .unwrap_or(true);
        if notify {
            [0x01, 0x00]
        } else {
            [0x02, 0x00]
        }
    }

    fn completed_command(&mut self) {
        self.busy = false;
        self.blocked_for_bonding = false;
        self.current_write = None;
        self.queue.pop_front();
        self.next_command();
    }

    /// Release the queue without popping so the head runs again.
    fn retry_current(&mut self) {
        self.busy = false;
        self.blocked_for_bonding = false;
        self.next_command();
    }

    fn fail_current(&mut self, status: GattStatus) {
        let Some(pending) = self.queue.front() else {
            return;
        };
        match &pending.command {
            Command::ReadCharacteristic(id) => self.emit(PeripheralEvent::CharacteristicUpdated {
                characteristic: *id,
                value: Vec::new(),
                status,
            }),
            Command::WriteCharacteristic { id, value, .. } => {
                self.emit(PeripheralEvent::CharacteristicWritten {
                    characteristic: *id,
                    value: value.clone(),
                    status,
                })
            }
            Command::ReadDescriptor(id) => self.emit(PeripheralEvent::DescriptorRead {
                descriptor: *id,
                value: Vec::new(),
                status,
            }),
            Command::WriteDescriptor { id, value } => self.emit(PeripheralEvent::DescriptorWritten {
                descriptor: *id,
                value: value.clone(),
                status,
            }),
            Command::SetNotify { id, .. } => {
                let notifying = self.shared.mirror.lock().notifying.contains(id);
                self.emit(PeripheralEvent::NotificationStateUpdated {
                    characteristic: *id,
                    notifying,
                    status,
                })
            }
            Command::ReadRssi => self.emit(PeripheralEvent::RssiRead { rssi: 0, status }),
            Command::RequestMtu(_) => {
                let mtu = self.shared.mirror.lock().mtu;
                self.emit(PeripheralEvent::MtuChanged { mtu, status })
            }
            Command::RequestConnectionPriority(_) => {}
            Command::SetPreferredPhy { .. } | Command::ReadPhy => {
                self.emit(PeripheralEvent::PhyUpdated {
                    tx: PhyType::Le1M,
                    rx: PhyType::Le1M,
                    status,
                })
            }
            Command::CreateBond => self.emit(PeripheralEvent::BondingFailed),
        }
        self.completed_command();
    }

    /// An encryption failure parks the in-flight command until the stack
    /// finishes bonding, after which it is re-issued.
    fn park_for_bonding(&mut self, status: GattStatus) -> bool {
        if !status.requires_bonding() || !self.quirks.retry_commands_after_bonding {
            return false;
        }
        if !self.busy {
            return false;
        }
        warn!(address = %self.shared.address, ?status,
            "command needs encryption, waiting for bonding");
        self.blocked_for_bonding = true;
        true
    }

    fn handle_retry_blocked(&mut self, gen: u64) {
        if gen != self.timer_gen {
            return;
        }
        if !self.blocked_for_bonding {
            return;
        }
        if self.queue.front().is_none() {
            self.blocked_for_bonding = false;
            return;
        }
        debug!(address = %self.shared.address, "re-issuing command after bonding");
        self.retry_current();
    }

    // ---- GATT events ----

    fn handle_gatt(&mut self, event: GattEvent) {
        match event {
            GattEvent::ConnectionStateChanged { state, status } => {
                self.handle_connection_state_change(state, status)
            }
            GattEvent::ServicesDiscovered { result } => self.handle_services_discovered(result),
            GattEvent::CharacteristicRead { id, value, status } => {
                if self.park_for_bonding(status) {
                    return;
                }
                self.emit(PeripheralEvent::CharacteristicUpdated {
                    characteristic: id,
                    value,
                    status,
                });
                if self.in_flight_matches(|c| {
                    matches!(c, Command::ReadCharacteristic(cid) if *cid == id)
                }) {
                    self.completed_command();
                }
            }
            GattEvent::CharacteristicWritten { id, status } => {
                if self.park_for_bonding(status) {
                    return;
                }
                let value = self.current_write.take().unwrap_or_default();
                self.emit(PeripheralEvent::CharacteristicWritten {
                    characteristic: id,
                    value,
                    status,
                });
                if self.in_flight_matches(|c| {
                    matches!(c, Command::WriteCharacteristic { id: cid, .. } if *cid == id)
                }) {
                    self.completed_command();
                }
            }
            GattEvent::CharacteristicChanged { id, value } => {
                self.emit(PeripheralEvent::CharacteristicUpdated {
                    characteristic: id,
                    value,
                    status: GattStatus::Success,
                });
            }
            GattEvent::DescriptorRead { id, value, status } => {
                if self.park_for_bonding(status) {
                    return;
                }
                self.emit(PeripheralEvent::DescriptorRead {
                    descriptor: id,
                    value,
                    status,
                });
                if self
                    .in_flight_matches(|c| matches!(c, Command::ReadDescriptor(did) if *did == id))
                {
                    self.completed_command();
                }
            }
            GattEvent::DescriptorWritten { id, status } => {
                if self.park_for_bonding(status) {
                    return;
                }
                self.handle_descriptor_written(id, status);
            }
            GattEvent::MtuChanged { mtu, status } => {
                if status == GattStatus::Success {
                    self.shared.mirror.lock().mtu = mtu;
                }
                self.emit(PeripheralEvent::MtuChanged { mtu, status });
                // MTU changes also arrive unsolicited; only a queued MTU
                // request may be completed by one.
                if self.in_flight_matches(|c| matches!(c, Command::RequestMtu(_))) {
                    self.completed_command();
                }
            }
            GattEvent::PhyUpdated { tx, rx, status } => {
                self.emit(PeripheralEvent::PhyUpdated { tx, rx, status });
                if self.in_flight_matches(|c| matches!(c, Command::SetPreferredPhy { .. })) {
                    self.completed_command();
                }
            }
            GattEvent::PhyRead { tx, rx, status } => {
                self.emit(PeripheralEvent::PhyUpdated { tx, rx, status });
                if self.in_flight_matches(|c| matches!(c, Command::ReadPhy)) {
                    self.completed_command();
                }
            }
            GattEvent::RssiRead { rssi, status } => {
                self.emit(PeripheralEvent::RssiRead { rssi, status });
                if self.in_flight_matches(|c| matches!(c, Command::ReadRssi)) {
                    self.completed_command();
                }
            }
            GattEvent::ConnectionUpdated {
                interval,
                latency,
                timeout,
                status,
            } => {
                self.emit(PeripheralEvent::ConnectionParametersUpdated {
                    interval,
                    latency,
                    supervision_timeout: timeout,
                    status,
                });
            }
            GattEvent::BondStateChanged {
                new_state,
                previous,
            } => self.handle_bond_state(new_state, previous),
            GattEvent::PairingRequest { variant } => self.handle_pairing_request(variant),
        }
    }

    fn handle_descriptor_written(&mut self, id: DescriptorId, status: GattStatus) {
        let in_flight_notify = self.queue.front().and_then(|p| match &p.command {
            Command::SetNotify { id: cid, enable }
                if self.busy
                    && *cid == id.characteristic_id()
                    && id.descriptor == CCC_DESCRIPTOR_UUID =>
            {
                Some((*cid, *enable))
            }
            _ => None,
        });

        if let Some((characteristic, enable)) = in_flight_notify {
            let notifying = status == GattStatus::Success && enable;
            {
                let mut mirror = self.shared.mirror.lock();
                if notifying {
                    mirror.notifying.insert(characteristic);
                } else {
                    mirror.notifying.remove(&characteristic);
                }
            }
            self.emit(PeripheralEvent::NotificationStateUpdated {
                characteristic,
                notifying,
                status,
            });
            self.completed_command();
            return;
        }

        let value = self.current_write.take().unwrap_or_default();
        self.emit(PeripheralEvent::DescriptorWritten {
            descriptor: id,
            value,
            status,
        });
        if self.in_flight_matches(|c| matches!(c, Command::WriteDescriptor { id: did, .. } if *did == id))
        {
            self.completed_command();
        }
    }

    fn in_flight_matches(&self, predicate: impl Fn(&Command) -> bool) -> bool {
        self.busy
            && self
                .queue
                .front()
                .map(|p| predicate(&p.command))
                .unwrap_or(false)
    }

    // ---- bonding ----

    fn handle_bond_state(&mut self, new_state: BondState, previous: BondState) {
        self.shared.mirror.lock().bond_state = new_state;
        let ctx = {
            let mirror = self.shared.mirror.lock();
            BondContext {
                connected: mirror.connection_state == ConnectionState::Connected,
                services_discovered: mirror.services_discovered,
                discovery_in_progress: self.discovery_in_progress,
                command_blocked_for_bonding: self.blocked_for_bonding,
            }
        };
        for action in self.bonds.handle_transition(new_state, previous, ctx) {
            match action {
                BondAction::NotifyStarted => self.emit(PeripheralEvent::BondingStarted),
                BondAction::NotifySucceeded => self.emit(PeripheralEvent::BondingSucceeded),
                BondAction::NotifyFailed => self.emit(PeripheralEvent::BondingFailed),
                BondAction::NotifyLost => self.emit(PeripheralEvent::BondLost),
                BondAction::StartDiscovery => self.start_discovery(),
                BondAction::RetryBlockedCommand => {
                    let _ = self
                        .spawn_timer(RETRY_AFTER_BOND_DELAY, |gen| SessionMsg::RetryBlocked { gen });
                }
                BondAction::CompleteManualBond => {
                    if self.in_flight_matches(|c| matches!(c, Command::CreateBond)) {
                        self.completed_command();
                    }
                }
                BondAction::ResumeQueue => self.next_command(),
                BondAction::Disconnect => {
                    if let Some(link) = self.link.as_mut() {
                        link.disconnect();
                    }
                }
            }
        }
    }

    fn handle_pairing_request(&mut self, variant: crate::models::PairingVariant) {
        if variant != crate::models::PairingVariant::Pin {
            return;
        }
        let pin = self.pins.lock().get(&self.shared.address).cloned();
        match (pin, self.link.as_mut()) {
            (Some(pin), Some(link)) => {
                info!(address = %self.shared.address, "answering PIN request");
                link.set_pin(&pin);
            }
            _ => {
                debug!(address = %self.shared.address, "no PIN registered for pairing request");
            }
        }
    }
}
