//! End-to-end ISO-TP reassembly over the mock transport

use std::sync::Arc;
use std::time::Duration;

use evtel_can::transport::mock::multi_frame;
use evtel_can::transport::{CanTransport, MockConfig, MockTransport};
use evtel_can::{CanManager, LinkEvent};
use evtel_core::{CanFrame, CanRequest, ResponseSlot, UdsResponse};

const REQ_HV_BATT_INFO: CanRequest = CanRequest::new(
    0x79B,
    0x7BB,
    8,
    [0x02, 0x21, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00],
);

fn rig() -> (Arc<MockTransport>, Arc<CanManager>, Arc<ResponseSlot>) {
    let mock = Arc::new(MockTransport::new(&MockConfig::default(), 5_000));
    let transport: Arc<dyn CanTransport> = mock.clone();
    let slot = Arc::new(ResponseSlot::new());
    let manager = Arc::new(CanManager::new(transport, slot.clone()));
    manager.spawn();
    (mock, manager, slot)
}

async fn wait_for_response(slot: &ResponseSlot, limit: Duration) -> Option<UdsResponse> {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if let Some(rsp) = slot.take() {
            return Some(rsp);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    None
}

#[tokio::test]
async fn multi_frame_response_delivers_once_with_flow_control() {
    let (mock, manager, slot) = rig();

    manager.transmit(&REQ_HV_BATT_INFO).await.unwrap();

    let mut payload = vec![0x61, 0x01];
    payload.extend((0u8..51).collect::<Vec<_>>());
    assert_eq!(payload.len(), 53);
    for frame in multi_frame(0x7BB, &payload) {
        mock.inject(LinkEvent::Frame(frame));
    }

    let rsp = wait_for_response(&slot, Duration::from_secs(2)).await.unwrap();
    assert_eq!(rsp.rsp_id, 0x7BB);
    assert_eq!(rsp.data, payload);

    // Exactly one delivery, one completion, one flow-control reply to the
    // request id.
    assert!(slot.take().is_none());
    assert_eq!(mock.completions(), 1);
    let fc = mock.flow_controls();
    assert_eq!(fc, vec![(0x79B, vec![0x30, 0, 0, 0, 0, 0, 0, 0])]);
}

#[tokio::test]
async fn sequence_mismatch_drops_without_delivery() {
    let (mock, manager, slot) = rig();

    manager.transmit(&REQ_HV_BATT_INFO).await.unwrap();

    let mut payload = vec![0x61, 0x01];
    payload.extend((0u8..51).collect::<Vec<_>>());
    let frames = multi_frame(0x7BB, &payload);

    // First frame, then a consecutive frame with sequence 3 instead of 1.
    mock.inject(LinkEvent::Frame(frames[0].clone()));
    let mut bad = frames[1].data().to_vec();
    bad[0] = 0x23;
    mock.inject(LinkEvent::Frame(CanFrame::new(0x7BB, &bad).unwrap()));
    // The genuine remainder no longer completes the PDU.
    for frame in &frames[1..] {
        mock.inject(LinkEvent::Frame(frame.clone()));
    }

    assert!(wait_for_response(&slot, Duration::from_millis(200)).await.is_none());
    assert_eq!(mock.completions(), 0);
}

#[tokio::test]
async fn frames_for_other_ids_are_ignored() {
    let (mock, manager, slot) = rig();

    manager.transmit(&REQ_HV_BATT_INFO).await.unwrap();

    // Same payload shape, wrong arbitration id.
    mock.inject(LinkEvent::Frame(
        CanFrame::new(0x7BC, &[0x04, 0x61, 0x01, 0xAA, 0xBB]).unwrap(),
    ));
    assert!(wait_for_response(&slot, Duration::from_millis(100)).await.is_none());

    // The expected id still completes afterwards.
    mock.inject(LinkEvent::Frame(
        CanFrame::new(0x7BB, &[0x04, 0x61, 0x01, 0xAA, 0xBB]).unwrap(),
    ));
    let rsp = wait_for_response(&slot, Duration::from_secs(1)).await.unwrap();
    assert_eq!(rsp.data, vec![0x61, 0x01, 0xAA, 0xBB]);
}

#[tokio::test]
async fn interleaved_noise_does_not_corrupt_reassembly() {
    let (mock, manager, slot) = rig();

    manager.transmit(&REQ_HV_BATT_INFO).await.unwrap();

    let mut payload = vec![0x61, 0x01];
    payload.extend((10u8..30).collect::<Vec<_>>());
    let frames = multi_frame(0x7BB, &payload);

    for frame in frames {
        // Noise on another id between every legitimate frame.
        mock.inject(LinkEvent::Frame(
            CanFrame::new(0x123, &[0x21, 0xFF, 0xFF]).unwrap(),
        ));
        mock.inject(LinkEvent::Frame(frame));
    }

    let rsp = wait_for_response(&slot, Duration::from_secs(1)).await.unwrap();
    assert_eq!(rsp.data, payload);
}

#[tokio::test]
async fn unmatched_request_times_out() {
    let mock = Arc::new(MockTransport::new(&MockConfig::default(), 50));
    let transport: Arc<dyn CanTransport> = mock.clone();
    let slot = Arc::new(ResponseSlot::new());
    let manager = Arc::new(CanManager::new(transport, slot.clone()));
    manager.spawn();

    manager.transmit(&REQ_HV_BATT_INFO).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    let mut error = None;
    while tokio::time::Instant::now() < deadline {
        if let Some(e) = slot.take_error() {
            error = Some(e);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(error, Some(evtel_core::InterfaceError::Timeout));
}
