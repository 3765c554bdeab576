//! Value types shared across the crate: device addresses, advertisement
//! records, connection and bond state enums, status codes and the
//! attribute table model.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use uuid::Uuid;

use crate::error::BleError;

/// Client Characteristic Configuration descriptor, written to toggle
/// notifications and indications.
pub const CCC_DESCRIPTOR_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Default ATT MTU before negotiation.
pub const DEFAULT_MTU: u16 = 23;

/// Largest MTU a central may request.
pub const MAX_MTU: u16 = 517;

/// A peripheral's device address in `AA:BB:CC:DD:EE:FF` form.
///
/// Alphabetic hex digits must be uppercase, matching how the radio stack
/// reports addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Parse and validate an address string.
    pub fn new(address: &str) -> Result<Self, BleError> {
        if Self::is_valid(address) {
            Ok(Self(address.to_string()))
        } else {
            Err(BleError::InvalidAddress(address.to_string()))
        }
    }

    /// Check address syntax without constructing.
    pub fn is_valid(address: &str) -> bool {
        let bytes = address.as_bytes();
        if bytes.len() != 17 {
            return false;
        }
        for (i, b) in bytes.iter().enumerate() {
            if i % 3 == 2 {
                if *b != b':' {
                    return false;
                }
            } else if !(b.is_ascii_digit() || (b'A'..=b'F').contains(b)) {
                return false;
            }
        }
        true
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = BleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single advertisement sighting produced by the scan engine.
///
/// Sightings are handed to the caller as they arrive and are not retained
/// anywhere in this crate.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: DeviceAddress,
    /// Local name from the advertisement record, if present.
    pub local_name: Option<String>,
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Raw advertisement record bytes.
    pub data: Vec<u8>,
    pub discovered_at: Instant,
}

/// Connection state of a peripheral as reported by the radio stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Bond state of a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// Write mode for characteristic writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    /// Acknowledged write. Oversized payloads are chained by the stack, up
    /// to the 512-byte attribute limit.
    WithResponse,
    /// Unacknowledged write, limited to MTU - 3 bytes.
    WithoutResponse,
    /// Authenticated signed write, limited to MTU - 15 bytes.
    Signed,
}

/// Duty cycle for discovery scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ScanMode {
    LowPower,
    Balanced,
    LowLatency,
}

/// Why a scan could not be started or stopped working.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFailure {
    AlreadyStarted,
    RegistrationFailed,
    InternalError,
    Unsupported,
    OutOfResources,
    TooFrequent,
    Unknown,
}

/// Link-layer status codes carried by connection state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HciStatus {
    Success,
    /// The connect attempt or link supervision timed out.
    ConnectionTimeout,
    /// The remote device terminated the connection.
    RemoteUserTerminated,
    /// The local host terminated the connection.
    LocalHostTerminated,
    /// The connection could not be established at all, typically an
    /// address-type or caching mismatch. Retrying does not help.
    ConnectionFailedEstablishment,
    /// Unspecified stack error.
    Error,
}

impl HciStatus {
    pub fn is_establishment_failure(self) -> bool {
        self == HciStatus::ConnectionFailedEstablishment
    }
}

/// Classified connection failure reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The stack reported a timeout while connecting.
    Timeout,
    /// The connection could never be established; never retried.
    Establishment,
    Other(HciStatus),
}

impl ConnectFailure {
    pub fn classify(status: HciStatus) -> Self {
        match status {
            HciStatus::ConnectionFailedEstablishment => ConnectFailure::Establishment,
            HciStatus::ConnectionTimeout => ConnectFailure::Timeout,
            other => ConnectFailure::Other(other),
        }
    }

    pub fn is_establishment(self) -> bool {
        matches!(self, ConnectFailure::Establishment)
    }
}

/// ATT status of a completed attribute operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    ReadNotPermitted,
    WriteNotPermitted,
    InsufficientAuthentication,
    RequestNotSupported,
    InsufficientEncryption,
    InvalidAttributeLength,
    AuthorizationFailed,
    NoResources,
    Error,
}

impl GattStatus {
    /// Failures that mean the attribute needs an encrypted link and the
    /// operation must be retried once bonding completes.
    pub fn requires_bonding(self) -> bool {
        matches!(
            self,
            GattStatus::AuthorizationFailed
                | GattStatus::InsufficientAuthentication
                | GattStatus::InsufficientEncryption
        )
    }
}

/// PHY selection for `set_preferred_phy` and `read_phy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyType {
    Le1M,
    Le2M,
    LeCoded,
}

/// Coding scheme preference when the LE Coded PHY is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyOptions {
    NoPreferred,
    S2,
    S8,
}

/// Requested connection parameter profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPriority {
    Balanced,
    High,
    LowPower,
}

/// Power state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    On,
    TurningOn,
    Off,
    TurningOff,
}

/// Pairing request variants the stack may surface mid-bonding. Only the
/// fixed-PIN variant is answered programmatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingVariant {
    Pin,
    Passkey,
    Consent,
}

/// Characteristic property bits from the attribute table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties(pub u8);

impl CharacteristicProperties {
    pub const BROADCAST: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
    pub const SIGNED_WRITE: u8 = 0x40;

    pub fn supports_read(self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn supports_notify(self) -> bool {
        self.0 & Self::NOTIFY != 0
    }

    pub fn supports_indicate(self) -> bool {
        self.0 & Self::INDICATE != 0
    }

    pub fn supports_write_type(self, write_type: WriteType) -> bool {
        let bit = match write_type {
            WriteType::WithResponse => Self::WRITE,
            WriteType::WithoutResponse => Self::WRITE_WITHOUT_RESPONSE,
            WriteType::Signed => Self::SIGNED_WRITE,
        };
        self.0 & bit != 0
    }
}

/// A descriptor entry in the attribute table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub uuid: Uuid,
}

/// A characteristic entry in the attribute table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    pub fn descriptor(&self, uuid: Uuid) -> Option<&Descriptor> {
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }
}

/// A service discovered on a peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Reference to a characteristic by service and characteristic UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicId {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

/// Reference to a descriptor beneath a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorId {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub descriptor: Uuid,
}

impl DescriptorId {
    pub fn new(service: Uuid, characteristic: Uuid, descriptor: Uuid) -> Self {
        Self {
            service,
            characteristic,
            descriptor,
        }
    }

    pub fn characteristic_id(&self) -> CharacteristicId {
        CharacteristicId::new(self.service, self.characteristic)
    }
}

/// Events delivered on a peripheral's event channel once a connection has
/// been requested for it.
#[derive(Debug, Clone)]
pub enum PeripheralEvent {
    /// Service discovery finished; the session is usable from here on.
    ServicesDiscovered { services: Vec<Service> },
    /// A read completed or a notification/indication arrived.
    CharacteristicUpdated {
        characteristic: CharacteristicId,
        value: Vec<u8>,
        status: GattStatus,
    },
    CharacteristicWritten {
        characteristic: CharacteristicId,
        value: Vec<u8>,
        status: GattStatus,
    },
    DescriptorRead {
        descriptor: DescriptorId,
        value: Vec<u8>,
        status: GattStatus,
    },
    DescriptorWritten {
        descriptor: DescriptorId,
        value: Vec<u8>,
        status: GattStatus,
    },
    /// Completion of an enable/disable-notification command. Reported
    /// separately from ordinary descriptor writes.
    NotificationStateUpdated {
        characteristic: CharacteristicId,
        notifying: bool,
        status: GattStatus,
    },
    BondingStarted,
    BondingSucceeded,
    BondingFailed,
    BondLost,
    RssiRead {
        rssi: i16,
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
    ConnectionParametersUpdated {
        /// Connection interval in 1.25 ms units.
        interval: u16,
        latency: u16,
        /// Supervision timeout in 10 ms units.
        supervision_timeout: u16,
        status: GattStatus,
    },
}
