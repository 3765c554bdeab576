//! Scripted in-memory radio stack for driving the manager in tests.
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use ble_central::radio::{GattEvent, GattLink, RadioStack, ScanConfig, ScanEvent, ScanHandle};
use ble_central::{
    AdapterState, Advertisement, Characteristic, CharacteristicId, CharacteristicProperties,
    ConnectionPriority, Descriptor, DescriptorId, DeviceAddress, HciStatus, PhyOptions, PhyType,
    ScanFailure, Service, WriteType, CCC_DESCRIPTOR_UUID,
};

pub const HRS_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const HR_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
pub const HR_CONTROL: Uuid = Uuid::from_u128(0x00002a39_0000_1000_8000_00805f9b34fb);

pub const ADDRESS: &str = "12:23:34:98:76:54";

pub fn measurement_id() -> CharacteristicId {
    CharacteristicId::new(HRS_SERVICE, HR_MEASUREMENT)
}

pub fn control_id() -> CharacteristicId {
    CharacteristicId::new(HRS_SERVICE, HR_CONTROL)
}

pub fn ccc_id() -> DescriptorId {
    DescriptorId::new(HRS_SERVICE, HR_MEASUREMENT, CCC_DESCRIPTOR_UUID)
}

/// A heart-rate style service: a notifying measurement characteristic with
/// a CCC descriptor, and a writable control point.
pub fn sample_services() -> Vec<Service> {
    vec![Service {
        uuid: HRS_SERVICE,
        characteristics: vec![
            Characteristic {
                uuid: HR_MEASUREMENT,
                properties: CharacteristicProperties(
                    CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                ),
                descriptors: vec![Descriptor {
                    uuid: CCC_DESCRIPTOR_UUID,
                }],
            },
            Characteristic {
                uuid: HR_CONTROL,
                properties: CharacteristicProperties(
                    CharacteristicProperties::WRITE
                        | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
                ),
                descriptors: vec![],
            },
        ],
    }]
}

pub fn advertisement(address: &str, name: Option<&str>, rssi: i16) -> Advertisement {
    Advertisement {
        address: DeviceAddress::new(address).unwrap(),
        local_name: name.map(str::to_string),
        rssi,
        data: vec![0x02, 0x01, 0x06],
        discovered_at: Instant::now(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    DiscoverServices,
    ReadCharacteristic(CharacteristicId),
    WriteCharacteristic(CharacteristicId, Vec<u8>, WriteType),
    ReadDescriptor(DescriptorId),
    WriteDescriptor(DescriptorId, Vec<u8>),
    SetNotification(CharacteristicId, bool),
    RequestMtu(u16),
    RequestPriority(ConnectionPriority),
    SetPhy(PhyType, PhyType, PhyOptions),
    ReadPhy,
    ReadRssi,
    CreateBond,
    SetPin(String),
    Disconnect,
    Close,
}

/// Test-side view of one opened GATT link.
#[derive(Clone)]
pub struct MockLinkHandle {
    pub address: DeviceAddress,
    pub auto: bool,
    pub events: UnboundedSender<GattEvent>,
    pub calls: Arc<Mutex<Vec<LinkCall>>>,
    start_ok: Arc<AtomicBool>,
}

impl MockLinkHandle {
    pub fn send(&self, event: GattEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, predicate: impl Fn(&LinkCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    pub fn refuse_commands(&self) {
        self.start_ok.store(false, Ordering::SeqCst);
    }
}

struct MockLink {
    handle: MockLinkHandle,
}

impl MockLink {
    fn record(&mut self, call: LinkCall) -> bool {
        self.handle.calls.lock().push(call);
        self.handle.start_ok.load(Ordering::SeqCst)
    }
}

impl GattLink for MockLink {
    fn discover_services(&mut self) -> bool {
        self.record(LinkCall::DiscoverServices)
    }

    fn read_characteristic(&mut self, id: CharacteristicId) -> bool {
        self.record(LinkCall::ReadCharacteristic(id))
    }

    fn write_characteristic(
        &mut self,
        id: CharacteristicId,
        value: &[u8],
        write_type: WriteType,
    ) -> bool {
        self.record(LinkCall::WriteCharacteristic(id, value.to_vec(), write_type))
    }

    fn read_descriptor(&mut self, id: DescriptorId) -> bool {
        self.record(LinkCall::ReadDescriptor(id))
    }

    fn write_descriptor(&mut self, id: DescriptorId, value: &[u8]) -> bool {
        self.record(LinkCall::WriteDescriptor(id, value.to_vec()))
    }

    fn set_characteristic_notification(&mut self, id: CharacteristicId, enable: bool) -> bool {
        self.record(LinkCall::SetNotification(id, enable))
    }

    fn request_mtu(&mut self, mtu: u16) -> bool {
        self.record(LinkCall::RequestMtu(mtu))
    }

    fn request_connection_priority(&mut self, priority: ConnectionPriority) -> bool {
        self.record(LinkCall::RequestPriority(priority))
    }

    fn set_preferred_phy(&mut self, tx: PhyType, rx: PhyType, options: PhyOptions) -> bool {
        self.record(LinkCall::SetPhy(tx, rx, options))
    }

    fn read_phy(&mut self) -> bool {
        self.record(LinkCall::ReadPhy)
    }

    fn read_rssi(&mut self) -> bool {
        self.record(LinkCall::ReadRssi)
    }

    fn create_bond(&mut self) -> bool {
        self.record(LinkCall::CreateBond)
    }

    fn set_pin(&mut self, pin: &str) -> bool {
        self.record(LinkCall::SetPin(pin.to_string()))
    }

    fn disconnect(&mut self) {
        self.record(LinkCall::Disconnect);
    }

    fn close(&mut self) {
        self.record(LinkCall::Close);
    }
}

/// Test-side view of one started hardware scan.
#[derive(Clone)]
pub struct ScanStart {
    pub handle: ScanHandle,
    pub config: ScanConfig,
    pub events: UnboundedSender<ScanEvent>,
}

impl ScanStart {
    pub fn sight(&self, adv: Advertisement) {
        let _ = self.events.send(ScanEvent::Sighting(adv));
    }

    pub fn fail(&self, failure: ScanFailure) {
        let _ = self.events.send(ScanEvent::Failed(failure));
    }
}

#[derive(Default)]
pub struct MockState {
    next_scan_handle: u64,
    pub scan_starts: Vec<ScanStart>,
    pub stopped_scans: Vec<ScanHandle>,
    pub scan_script: VecDeque<Result<(), ScanFailure>>,
    pub links: Vec<MockLinkHandle>,
    pub connect_script: VecDeque<Result<(), HciStatus>>,
    pub cached: HashSet<DeviceAddress>,
    pub adapter_senders: Vec<UnboundedSender<AdapterState>>,
}

pub struct MockRadio {
    pub state: Mutex<MockState>,
}

impl MockRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
        })
    }

    pub fn mark_cached(&self, address: &str) {
        self.state
            .lock()
            .cached
            .insert(DeviceAddress::new(address).unwrap());
    }

    pub fn script_connect_failure(&self, status: HciStatus) {
        self.state.lock().connect_script.push_back(Err(status));
    }

    pub fn script_scan_failure(&self, failure: ScanFailure) {
        self.state.lock().scan_script.push_back(Err(failure));
    }

    pub fn send_adapter_state(&self, state: AdapterState) {
        for tx in &self.state.lock().adapter_senders {
            let _ = tx.send(state);
        }
    }

    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn scan_count(&self) -> usize {
        self.state.lock().scan_starts.len()
    }

    pub fn stopped_scan_count(&self) -> usize {
        self.state.lock().stopped_scans.len()
    }

    /// Wait for the n-th link to be opened.
    pub async fn link(&self, index: usize) -> MockLinkHandle {
        loop {
            if let Some(link) = self.state.lock().links.get(index).cloned() {
                return link;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }

    /// Wait for the n-th scan to be started.
    pub async fn scan(&self, index: usize) -> ScanStart {
        loop {
            if let Some(scan) = self.state.lock().scan_starts.get(index).cloned() {
                return scan;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }
}

impl RadioStack for MockRadio {
    fn start_scan(
        &self,
        config: ScanConfig,
        events: UnboundedSender<ScanEvent>,
    ) -> Result<ScanHandle, ScanFailure> {
        let mut state = self.state.lock();
        if let Some(Err(failure)) = state.scan_script.pop_front() {
            return Err(failure);
        }
        state.next_scan_handle += 1;
        let handle = ScanHandle(state.next_scan_handle);
        state.scan_starts.push(ScanStart {
            handle,
            config,
            events,
        });
        Ok(handle)
    }

    fn stop_scan(&self, handle: ScanHandle) {
        self.state.lock().stopped_scans.push(handle);
    }

    fn connect_gatt(
        &self,
        address: &DeviceAddress,
        auto_connect: bool,
        events: UnboundedSender<GattEvent>,
    ) -> Result<Box<dyn GattLink>, HciStatus> {
        let mut state = self.state.lock();
        if let Some(Err(status)) = state.connect_script.pop_front() {
            return Err(status);
        }
        let handle = MockLinkHandle {
            address: address.clone(),
            auto: auto_connect,
            events,
            calls: Arc::new(Mutex::new(Vec::new())),
            start_ok: Arc::new(AtomicBool::new(true)),
        };
        state.links.push(handle.clone());
        Ok(Box::new(MockLink { handle }))
    }

    fn is_cached(&self, address: &DeviceAddress) -> bool {
        self.state.lock().cached.contains(address)
    }

    fn adapter_events(&self) -> UnboundedReceiver<AdapterState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().adapter_senders.push(tx);
        rx
    }
}

/// Let spawned actors drain their queues and timers fire.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
}
