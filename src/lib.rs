//! BLE central connection-lifecycle management.
//!
//! The crate drives the central role of a BLE host stack: discovery
//! scanning with throttling-safe restarts, direct and autoconnect
//! connection establishment with timeout classification and retry,
//! serialized GATT attribute traffic per peripheral, bonding
//! coordination, and a cursor codec for attribute payloads.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ble_central::{CentralManager, CentralSettings};
//!
//! # fn radio() -> Arc<dyn ble_central::RadioStack> { unimplemented!() }
//! # async fn run() {
//! let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let central = CentralManager::new(radio(), events_tx, CentralSettings::default());
//! central.scan_for_peripherals();
//! while let Some(event) = events_rx.recv().await {
//!     // react to discoveries, connections, disconnections
//!     let _ = event;
//! }
//! # }
//! ```

mod bonding;
pub mod codec;
mod central;
mod error;
pub mod logging;
mod models;
mod peripheral;
pub mod radio;
mod scanner;
pub mod settings;

pub use central::{CentralEvent, CentralManager};
pub use codec::{AttributeCodec, ByteOrder, CodecError, DateTime, FormatType};
pub use error::BleError;
pub use models::{
    AdapterState, Advertisement, BondState, Characteristic, CharacteristicId,
    CharacteristicProperties, ConnectFailure, ConnectionPriority, ConnectionState, Descriptor,
    DescriptorId, DeviceAddress, GattStatus, HciStatus, PairingVariant, PeripheralEvent,
    PhyOptions, PhyType, ScanFailure, ScanMode, Service, WriteType, CCC_DESCRIPTOR_UUID,
    DEFAULT_MTU, MAX_MTU,
};
pub use peripheral::Peripheral;
pub use radio::{GattEvent, GattLink, RadioStack, ScanConfig, ScanEvent, ScanFilter, ScanHandle};
pub use settings::{CentralSettings, LogSettings, SettingsStore, StackQuirks};
