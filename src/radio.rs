//! Capability boundary to the platform's BLE host stack.
//!
//! Everything above this module is platform neutral. A backend implements
//! [`RadioStack`] for adapter-level operations and hands out a
//! [`GattLink`] per connection. Link operations follow the classic GATT
//! driver contract: the method returns `true` if the operation was
//! accepted and started, and the eventual outcome arrives as a
//! [`GattEvent`] on the channel supplied at connect time. At most one
//! attribute operation may be in flight per link; the session's command
//! queue guarantees that.

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::models::{
    AdapterState, Advertisement, BondState, CharacteristicId, ConnectionPriority, ConnectionState,
    DescriptorId, DeviceAddress, GattStatus, HciStatus, PairingVariant, PhyOptions, PhyType,
    ScanFailure, ScanMode, Service, WriteType,
};

/// Hardware-level match criteria for a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFilter {
    ServiceUuid(Uuid),
    Address(DeviceAddress),
    /// Exact advertised name.
    Name(String),
}

/// Everything a backend needs to start a scan. Name substrings are matched
/// by the scan engine, not the radio, since most stacks only filter on
/// exact names.
#[derive(Debug, Clone, Default)]
pub struct ScanConfig {
    pub filters: Vec<ScanFilter>,
    pub name_substrings: Vec<String>,
    pub mode: Option<ScanMode>,
}

/// Token for a running hardware scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanHandle(pub u64);

/// Events from a running scan.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Sighting(Advertisement),
    Failed(ScanFailure),
}

/// Events from one GATT connection, delivered on the channel passed to
/// [`RadioStack::connect_gatt`].
#[derive(Debug, Clone)]
pub enum GattEvent {
    ConnectionStateChanged {
        state: ConnectionState,
        status: HciStatus,
    },
    ServicesDiscovered {
        result: Result<Vec<Service>, GattStatus>,
    },
    CharacteristicRead {
        id: CharacteristicId,
        value: Vec<u8>,
        status: GattStatus,
    },
    CharacteristicWritten {
        id: CharacteristicId,
        status: GattStatus,
    },
    /// Notification or indication; not tied to any queued command.
    CharacteristicChanged {
        id: CharacteristicId,
        value: Vec<u8>,
    },
    DescriptorRead {
        id: DescriptorId,
        value: Vec<u8>,
        status: GattStatus,
    },
    DescriptorWritten {
        id: DescriptorId,
        status: GattStatus,
    },
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
    PhyUpdated {
        tx: PhyType,
        rx: PhyType,
        status: GattStatus,
    },
    PhyRead {
        tx: PhyType,
        rx: PhyType,
        status: GattStatus,
    },
    RssiRead {
        rssi: i16,
        status: GattStatus,
    },
    ConnectionUpdated {
        interval: u16,
        latency: u16,
        timeout: u16,
        status: GattStatus,
    },
    BondStateChanged {
        new_state: BondState,
        previous: BondState,
    },
    PairingRequest {
        variant: PairingVariant,
    },
}

/// Adapter-level operations of the host stack.
pub trait RadioStack: Send + Sync {
    /// Start a hardware scan. Sightings and failures arrive on `events`.
    fn start_scan(
        &self,
        config: ScanConfig,
        events: UnboundedSender<ScanEvent>,
    ) -> Result<ScanHandle, ScanFailure>;

    fn stop_scan(&self, handle: ScanHandle);

    /// Open a GATT client for `address`. With `auto_connect` the stack
    /// waits indefinitely for the device to appear; without it the attempt
    /// is active and subject to the stack's own supervision timeout.
    fn connect_gatt(
        &self,
        address: &DeviceAddress,
        auto_connect: bool,
        events: UnboundedSender<GattEvent>,
    ) -> Result<Box<dyn GattLink>, HciStatus>;

    /// Whether the stack has this address in its device cache. Passive
    /// auto-connects only work for cached devices.
    fn is_cached(&self, address: &DeviceAddress) -> bool;

    /// Power state changes of the local adapter.
    fn adapter_events(&self) -> UnboundedReceiver<AdapterState>;
}

/// One GATT client connection. Methods return `true` when the operation
/// was started; completion arrives on the event channel.
pub trait GattLink: Send {
    fn discover_services(&mut self) -> bool;

    fn read_characteristic(&mut self, id: CharacteristicId) -> bool;

    fn write_characteristic(
        &mut self,
        id: CharacteristicId,
        value: &[u8],
        write_type: WriteType,
    ) -> bool;

    fn read_descriptor(&mut self, id: DescriptorId) -> bool;

    fn write_descriptor(&mut self, id: DescriptorId, value: &[u8]) -> bool;

    /// Route (or stop routing) value changes for this characteristic to
    /// the event channel. Local bookkeeping only; enabling notifications
    /// on the remote requires the CCC descriptor write.
    fn set_characteristic_notification(&mut self, id: CharacteristicId, enable: bool) -> bool;

    fn request_mtu(&mut self, mtu: u16) -> bool;

    /// Fire and forget: stacks accept the request without reporting
    /// completion.
    fn request_connection_priority(&mut self, priority: ConnectionPriority) -> bool;

    fn set_preferred_phy(&mut self, tx: PhyType, rx: PhyType, options: PhyOptions) -> bool;

    fn read_phy(&mut self) -> bool;

    fn read_rssi(&mut self) -> bool;

    /// Start pairing. Progress arrives as `BondStateChanged` events.
    fn create_bond(&mut self) -> bool;

    /// Answer a PIN pairing request.
    fn set_pin(&mut self, pin: &str) -> bool;

    /// Ask the stack to tear the link down. A `ConnectionStateChanged`
    /// event confirms the disconnect.
    fn disconnect(&mut self);

    /// Release the client. No further events will be delivered.
    fn close(&mut self);
}
