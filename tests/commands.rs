//! Attribute command queue: validation, serialization, retries and
//! notification toggling.

mod common;

use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver};

use ble_central::radio::GattEvent;
use ble_central::{
    BleError, BondState, CentralEvent, CentralManager, CentralSettings, ConnectionState,
    GattStatus, HciStatus, Peripheral, PeripheralEvent, WriteType,
};
use common::*;

struct Harness {
    radio: Arc<MockRadio>,
    central: CentralManager,
    events: UnboundedReceiver<CentralEvent>,
}

fn harness() -> Harness {
    let radio = MockRadio::new();
    let (tx, events) = mpsc::unbounded_channel();
    let central = CentralManager::new(radio.clone(), tx, CentralSettings::default());
    Harness {
        radio,
        central,
        events,
    }
}

/// Bring one peripheral to the ready state and hand back the link.
async fn ready_peripheral(
    h: &mut Harness,
) -> (Peripheral, UnboundedReceiver<PeripheralEvent>, MockLinkHandle) {
    let peripheral = h.central.get_peripheral(ADDRESS).unwrap();
    let (ptx, mut prx) = mpsc::unbounded_channel();
    h.central.connect(&peripheral, ptx);

    assert!(matches!(
        h.events.recv().await.unwrap(),
        CentralEvent::Connecting(_)
    ));
    let link = h.radio.link(0).await;
    link.send(GattEvent::ConnectionStateChanged {
        state: ConnectionState::Connected,
        status: HciStatus::Success,
    });
    assert!(matches!(
        h.events.recv().await.unwrap(),
        CentralEvent::Connected(_)
    ));
    link.send(GattEvent::ServicesDiscovered {
        result: Ok(sample_services()),
    });
    assert!(matches!(
        prx.recv().await.unwrap(),
        PeripheralEvent::ServicesDiscovered { .. }
    ));
    (peripheral, prx, link)
}

#[tokio::test(start_paused = true)]
async fn read_of_non_readable_characteristic_is_rejected_synchronously() {
    let mut h = harness();
    let (peripheral, _prx, link) = ready_peripheral(&mut h).await;

    // The control point is write-only.
    assert_eq!(
        peripheral.read_characteristic(control_id()),
        Err(BleError::NotReadable)
    );
    settle().await;
    assert_eq!(
        link.call_count(|c| matches!(c, LinkCall::ReadCharacteristic(_))),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn oversized_and_empty_writes_are_rejected_synchronously() {
    let mut h = harness();
    let (peripheral, _prx, link) = ready_peripheral(&mut h).await;

    // Default MTU 23 allows 20 bytes without response.
    let oversized = vec![0u8; 21];
    assert_eq!(
        peripheral.write_characteristic(control_id(), &oversized, WriteType::WithoutResponse),
        Err(BleError::ValueTooLong {
            length: 21,
            maximum: 20,
        })
    );
    assert_eq!(
        peripheral.write_characteristic(control_id(), &[], WriteType::WithResponse),
        Err(BleError::EmptyValue)
    );
    let too_long_for_attribute = vec![0u8; 513];
    assert_eq!(
        peripheral.write_characteristic(
            control_id(),
            &too_long_for_attribute,
            WriteType::WithResponse
        ),
        Err(BleError::ValueTooLong {
            length: 513,
            maximum: 512,
        })
    );
    settle().await;
    assert_eq!(
        link.call_count(|c| matches!(c, LinkCall::WriteCharacteristic(..))),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn commands_run_one_at_a_time_in_order() {
    let mut h = harness();
    let (peripheral, mut prx, link) = ready_peripheral(&mut h).await;

    peripheral.read_characteristic(measurement_id()).unwrap();
    peripheral
        .write_characteristic(control_id(), &[0x01], WriteType::WithResponse)
        .unwrap();
    settle().await;

    // Only the read is on the wire.
    assert_eq!(
        link.call_count(|c| matches!(c, LinkCall::ReadCharacteristic(_))),
        1
    );
    assert_eq!(
        link.call_count(|c| matches!(c, LinkCall::WriteCharacteristic(..))),
        0
    );

    link.send(GattEvent::CharacteristicRead {
        id: measurement_id(),
        value: vec![0x06, 0x48],
        status: GattStatus::Success,
    });
    match prx.recv().await.unwrap() {
        PeripheralEvent::CharacteristicUpdated { value, status, .. } => {
            assert_eq!(value, vec![0x06, 0x48]);
            assert_eq!(status, GattStatus::Success);
        }
        other => panic!("unexpected {other:?}"),
    }

    settle().await;
    assert_eq!(
        link.call_count(|c| matches!(c, LinkCall::WriteCharacteristic(..))),
        1
    );
    link.send(GattEvent::CharacteristicWritten {
        id: control_id(),
        status: GattStatus::Success,
    });
    match prx.recv().await.unwrap() {
        PeripheralEvent::CharacteristicWritten { value, status, .. } => {
            assert_eq!(value, vec![0x01]);
            assert_eq!(status, GattStatus::Success);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn unsolicited_mtu_change_does_not_complete_foreign_command() {
    let mut h = harness();
    let (peripheral, mut prx, link) = ready_peripheral(&mut h).await;

    peripheral.read_characteristic(measurement_id()).unwrap();
    peripheral.read_rssi().unwrap();
    settle().await;

    // The peripheral renegotiates MTU on its own while the read is in
    // flight.
    link.send(GattEvent::MtuChanged {
        mtu: 185,
        status: GattStatus::Success,
    });
    match prx.recv().await.unwrap() {
        PeripheralEvent::MtuChanged { mtu, .. } => assert_eq!(mtu, 185),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(peripheral.mtu(), 185);

    // The read is still the in-flight command; the RSSI request has not
    // started.
    settle().await;
    assert_eq!(link.call_count(|c| matches!(c, LinkCall::ReadRssi)), 0);

    link.send(GattEvent::CharacteristicRead {
        id: measurement_id(),
        value: vec![0x00],
        status: GattStatus::Success,
    });
    assert!(matches!(
        prx.recv().await.unwrap(),
        PeripheralEvent::CharacteristicUpdated { .. }
    ));
    settle().await;
    assert_eq!(link.call_count(|c| matches!(c, LinkCall::ReadRssi)), 1);
}

#[tokio::test(start_paused = true)]
async fn requested_mtu_change_completes_the_request() {
    let mut h = harness();
    let (peripheral, mut prx, link) = ready_peripheral(&mut h).await;

    assert_eq!(peripheral.request_mtu(5), Err(BleError::InvalidMtu(5)));

    peripheral.request_mtu(247).unwrap();
    peripheral.read_rssi().unwrap();
    settle().await;
    assert_eq!(
        link.call_count(|c| matches!(c, LinkCall::RequestMtu(247))),
        1
    );

    link.send(GattEvent::MtuChanged {
        mtu: 247,
        status: GattStatus::Success,
    });
    assert!(matches!(
        prx.recv().await.unwrap(),
        PeripheralEvent::MtuChanged { mtu: 247, .. }
    ));
    assert_eq!(peripheral.mtu(), 247);
    assert_eq!(
        peripheral.maximum_write_value_length(WriteType::WithoutResponse),
        244
    );

    // Completion released the queue.
    settle().await;
    assert_eq!(link.call_count(|c| matches!(c, LinkCall::ReadRssi)), 1);
}

#[tokio::test(start_paused = true)]
async fn encryption_failure_parks_command_until_bonded_then_retries_same_payload() {
    let mut h = harness();
    let (peripheral, mut prx, link) = ready_peripheral(&mut h).await;

    peripheral.read_characteristic(measurement_id()).unwrap();
    settle().await;
    assert_eq!(
        link.call_count(|c| matches!(c, LinkCall::ReadCharacteristic(_))),
        1
    );

    // Old stacks report the encryption requirement instead of pairing
    // silently.
    link.send(GattEvent::CharacteristicRead {
        id: measurement_id(),
        value: Vec::new(),
        status: GattStatus::InsufficientAuthentication,
    });
    settle().await;
    // No completion event; the command is parked.
    assert!(prx.try_recv().is_err());

    link.send(GattEvent::BondStateChanged {
        new_state: BondState::Bonding,
        previous: BondState::None,
    });
    assert!(matches!(
        prx.recv().await.unwrap(),
        PeripheralEvent::BondingStarted
    ));
    link.send(GattEvent::BondStateChanged {
        new_state: BondState::Bonded,
        previous: BondState::Bonding,
    });
    assert!(matches!(
        prx.recv().await.unwrap(),
        PeripheralEvent::BondingSucceeded
    ));
    assert_eq!(peripheral.bond_state(), BondState::Bonded);

    // After the grace delay the same read goes out again.
    settle().await;
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    assert_eq!(
        link.call_count(|c| matches!(c, LinkCall::ReadCharacteristic(_))),
        2
    );

    link.send(GattEvent::CharacteristicRead {
        id: measurement_id(),
        value: vec![0x2A],
        status: GattStatus::Success,
    });
    match prx.recv().await.unwrap() {
        PeripheralEvent::CharacteristicUpdated { value, status, .. } => {
            assert_eq!(value, vec![0x2A]);
            assert_eq!(status, GattStatus::Success);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn set_notify_writes_ccc_and_tracks_state() {
    let mut h = harness();
    let (peripheral, mut prx, link) = ready_peripheral(&mut h).await;

    // The control point has no notify property and no CCC descriptor.
    assert_eq!(
        peripheral.set_notify(control_id(), true),
        Err(BleError::NotifyNotSupported)
    );

    peripheral.set_notify(measurement_id(), true).unwrap();
    settle().await;
    assert_eq!(
        link.call_count(|c| matches!(c, LinkCall::SetNotification(_, true))),
        1
    );
    assert_eq!(
        link.call_count(
            |c| matches!(c, LinkCall::WriteDescriptor(id, value) if *id == ccc_id() && value == &[0x01, 0x00])
        ),
        1
    );

    link.send(GattEvent::DescriptorWritten {
        id: ccc_id(),
        status: GattStatus::Success,
    });
    match prx.recv().await.unwrap() {
        PeripheralEvent::NotificationStateUpdated {
            characteristic,
            notifying,
            status,
        } => {
            assert_eq!(characteristic, measurement_id());
            assert!(notifying);
            assert_eq!(status, GattStatus::Success);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(peripheral.is_notifying(measurement_id()));

    // Incoming notifications surface as value updates.
    link.send(GattEvent::CharacteristicChanged {
        id: measurement_id(),
        value: vec![0x06, 0x50],
    });
    match prx.recv().await.unwrap() {
        PeripheralEvent::CharacteristicUpdated { value, .. } => {
            assert_eq!(value, vec![0x06, 0x50])
        }
        other => panic!("unexpected {other:?}"),
    }

    // Disable writes the zero CCC value and clears the flag.
    peripheral.set_notify(measurement_id(), false).unwrap();
    settle().await;
    assert_eq!(
        link.call_count(
            |c| matches!(c, LinkCall::WriteDescriptor(id, value) if *id == ccc_id() && value == &[0x00, 0x00])
        ),
        1
    );
    link.send(GattEvent::DescriptorWritten {
        id: ccc_id(),
        status: GattStatus::Success,
    });
    match prx.recv().await.unwrap() {
        PeripheralEvent::NotificationStateUpdated { notifying, .. } => assert!(!notifying),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!peripheral.is_notifying(measurement_id()));
}

#[tokio::test(start_paused = true)]
async fn disconnect_clears_pending_commands() {
    let mut h = harness();
    let (peripheral, mut prx, link) = ready_peripheral(&mut h).await;

    peripheral.read_characteristic(measurement_id()).unwrap();
    peripheral
        .write_characteristic(control_id(), &[0x02], WriteType::WithoutResponse)
        .unwrap();
    settle().await;
    let calls_before = link.calls().len();

    link.send(GattEvent::ConnectionStateChanged {
        state: ConnectionState::Disconnected,
        status: HciStatus::RemoteUserTerminated,
    });
    assert!(matches!(
        h.events.recv().await.unwrap(),
        CentralEvent::Disconnected { .. }
    ));
    settle().await;

    // Nothing but the close went out after the drop.
    let calls_after = link.calls();
    assert_eq!(calls_after.len(), calls_before + 1);
    assert_eq!(calls_after.last(), Some(&LinkCall::Close));
    assert!(prx.try_recv().is_err());
    assert!(!peripheral.is_connected());
}

#[tokio::test(start_paused = true)]
async fn command_that_fails_to_start_reports_error_and_releases_queue() {
    let mut h = harness();
    let (peripheral, mut prx, link) = ready_peripheral(&mut h).await;

    link.refuse_commands();
    peripheral.read_characteristic(measurement_id()).unwrap();
    match prx.recv().await.unwrap() {
        PeripheralEvent::CharacteristicUpdated { status, .. } => {
            assert_eq!(status, GattStatus::Error)
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn commands_on_a_disconnected_peripheral_are_rejected() {
    let h = harness();
    let peripheral = h.central.get_peripheral(ADDRESS).unwrap();
    assert_eq!(
        peripheral.read_characteristic(measurement_id()),
        Err(BleError::NotConnected)
    );
    assert_eq!(peripheral.read_rssi(), Err(BleError::NotConnected));
    assert_eq!(peripheral.create_bond(), Err(BleError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn registered_pin_answers_pairing_request() {
    let mut h = harness();
    let address = ble_central::DeviceAddress::new(ADDRESS).unwrap();
    assert_eq!(
        h.central.set_pin_code(&address, "12345"),
        Err(BleError::InvalidPinCode)
    );
    assert_eq!(
        h.central.set_pin_code(&address, "12345a"),
        Err(BleError::InvalidPinCode)
    );
    h.central.set_pin_code(&address, "123456").unwrap();

    let (_peripheral, _prx, link) = ready_peripheral(&mut h).await;
    link.send(GattEvent::PairingRequest {
        variant: ble_central::PairingVariant::Pin,
    });
    settle().await;
    assert_eq!(
        link.call_count(|c| matches!(c, LinkCall::SetPin(pin) if pin == "123456")),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn manual_bond_completes_via_bond_transition() {
    let mut h = harness();
    let (peripheral, mut prx, link) = ready_peripheral(&mut h).await;

    peripheral.create_bond().unwrap();
    peripheral.read_rssi().unwrap();
    settle().await;
    assert_eq!(link.call_count(|c| matches!(c, LinkCall::CreateBond)), 1);
    assert_eq!(link.call_count(|c| matches!(c, LinkCall::ReadRssi)), 0);

    link.send(GattEvent::BondStateChanged {
        new_state: BondState::Bonding,
        previous: BondState::None,
    });
    assert!(matches!(
        prx.recv().await.unwrap(),
        PeripheralEvent::BondingStarted
    ));
    link.send(GattEvent::BondStateChanged {
        new_state: BondState::Bonded,
        previous: BondState::Bonding,
    });
    assert!(matches!(
        prx.recv().await.unwrap(),
        PeripheralEvent::BondingSucceeded
    ));

    // The bond command completed, releasing the RSSI read.
    settle().await;
    assert_eq!(link.call_count(|c| matches!(c, LinkCall::ReadRssi)), 1);
}
