//! Polling behavior: round-robin issue, timeout recovery, and the full
//! request → reassembly → decode → broker pipeline

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use evtel_broker::DataBroker;
use evtel_can::transport::{CanTransport, MockConfig, MockTransport};
use evtel_can::{CanManager, TransportConfig};
use evtel_core::{DataItems, ResponseSlot};
use evtel_vehicle::{create_decoder, VehicleManager};

fn recorder(broker: &DataBroker, items: DataItems) -> Arc<Mutex<Vec<f32>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    broker.register_callback(items, move |v| sink.lock().push(v));
    seen
}

#[tokio::test]
async fn evaluator_issues_one_request_per_tick_when_idle() {
    let broker = Arc::new(DataBroker::new());
    let mock = Arc::new(MockTransport::new(&MockConfig::default(), 60_000));
    let slot = Arc::new(ResponseSlot::new());
    let can = Arc::new(CanManager::new(
        mock.clone() as Arc<dyn CanTransport>,
        slot.clone(),
    ));
    can.spawn();

    let mut decoder = create_decoder("Leaf ZE1", broker).unwrap();
    decoder.set_request_mask(DataItems::LV_BATT_V | DataItems::SPEED);

    decoder.eval(&can).await;
    assert_eq!(mock.sent().len(), 1);
    assert_eq!(mock.sent()[0].data[2..4], [0x11, 0x03]);

    // Still in flight: no new request.
    decoder.eval(&can).await;
    decoder.eval(&can).await;
    assert_eq!(mock.sent().len(), 1);

    // A response frees the slot; the next tick moves to the next entry.
    decoder.rx_data(0x79A, &[0x62, 0x11, 0x03, 0xB4]);
    decoder.eval(&can).await;
    assert_eq!(mock.sent().len(), 2);
    assert_eq!(mock.sent()[1].data[2..4], [0x12, 0x1A]);

    // The rotation wraps back to the first entry.
    decoder.rx_data(0x79A, &[0x62, 0x12, 0x1A, 0x01, 0xF4]);
    decoder.eval(&can).await;
    assert_eq!(mock.sent().len(), 3);
    assert_eq!(mock.sent()[2].data[2..4], [0x11, 0x03]);
}

#[tokio::test]
async fn timeout_clears_in_flight_and_rotation_continues() {
    let broker = Arc::new(DataBroker::new());
    // Nothing is scripted, so every request times out after 50 ms.
    let mock = Arc::new(MockTransport::new(&MockConfig::default(), 50));
    let slot = Arc::new(ResponseSlot::new());
    let can = Arc::new(CanManager::new(
        mock.clone() as Arc<dyn CanTransport>,
        slot.clone(),
    ));
    can.spawn();

    let mut decoder = create_decoder("Leaf ZE1", broker).unwrap();
    decoder.set_request_mask(DataItems::LV_BATT_V | DataItems::SPEED);

    decoder.eval(&can).await;
    decoder.eval(&can).await;
    assert_eq!(mock.sent().len(), 1);

    // Wait out the request timer, then deliver the error the way the
    // vehicle manager does.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let error = slot.take_error().expect("timeout should have fired");
    decoder.note_error(error);

    decoder.eval(&can).await;
    assert_eq!(mock.sent().len(), 2);
    assert_eq!(mock.sent()[1].data[2..4], [0x12, 0x1A]);
}

#[tokio::test]
async fn full_pipeline_publishes_decoded_values() {
    let broker = Arc::new(DataBroker::new());
    let lv_volts = recorder(&broker, DataItems::LV_BATT_V);
    let hv_volts = recorder(&broker, DataItems::HV_BATT_V);
    let hv_amps = recorder(&broker, DataItems::HV_BATT_I);
    let speed = recorder(&broker, DataItems::SPEED);

    // The mock transport ships canned Leaf responses, including the
    // 53-byte multi-frame battery answer.
    let config = TransportConfig::Mock(MockConfig::default());
    let mut vm = VehicleManager::new("Leaf ZE1", &config, broker.clone())
        .await
        .unwrap();
    vm.set_request_item_mask(vm.supported_item_mask());

    for _ in 0..80 {
        vm.eval().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    broker.drain();

    let lv = lv_volts.lock();
    assert!(!lv.is_empty());
    assert!((lv[0] - 14.4).abs() < 1e-3);

    let hv = hv_volts.lock();
    assert!(!hv.is_empty());
    assert!((hv[0] - 360.0).abs() < 1e-3);

    let amps = hv_amps.lock();
    assert!(!amps.is_empty());
    assert!((amps[0] - 1.0).abs() < 1e-3);

    let kph = speed.lock();
    assert!(!kph.is_empty());
    assert!((kph[0] - 60.0).abs() < 1e-3);
}

#[tokio::test]
async fn unknown_vehicle_is_a_fatal_configuration_error() {
    let broker = Arc::new(DataBroker::new());
    let config = TransportConfig::Mock(MockConfig::default());
    let result = VehicleManager::new("Model T", &config, broker).await;
    assert!(matches!(
        result,
        Err(evtel_vehicle::VehicleError::UnknownVehicle(_))
    ));
}
