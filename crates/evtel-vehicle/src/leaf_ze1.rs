//! Nissan Leaf ZE1 (2018-2025) platform decoder

use std::sync::Arc;

use async_trait::async_trait;

use evtel_broker::DataBroker;
use evtel_can::CanManager;
use evtel_core::{CanRequest, DataItems, InterfaceError, ItemRange};

use crate::decoder::{VehicleDecoder, VehicleProfile};
use crate::manager::resolve_index;
use crate::scheduler::RequestScheduler;

// Catalogue indices.
const UDS_GEAR_POSITION: usize = 0;
const UDS_12V_BATT_V: usize = 1;
const UDS_12V_BATT_I: usize = 2;
const UDS_LV_AUX_PWR: usize = 3;
const UDS_AC_AUX_PWR: usize = 4;
const UDS_SPEED: usize = 5;
const UDS_HV_BATT_INFO: usize = 6;
const UDS_HV_BATT_TEMP: usize = 7;
const UDS_TORQUE: usize = 8;

const NUM_REQUESTS: usize = 9;

const GEAR_REVERSE: u8 = 2;

pub static PROFILE: VehicleProfile = VehicleProfile {
    name: "Leaf ZE1",
    supported_items: DataItems::from_bits_truncate(
        DataItems::HV_BATT_V.bits()
            | DataItems::HV_BATT_I.bits()
            | DataItems::HV_BATT_MIN_T.bits()
            | DataItems::HV_BATT_MAX_T.bits()
            | DataItems::LV_BATT_V.bits()
            | DataItems::LV_BATT_I.bits()
            | DataItems::AUX_KW.bits()
            | DataItems::FRONT_TORQUE.bits()
            | DataItems::SPEED.bits(),
    ),
    power_kw_range: ItemRange::new(-40.0, 160.0),
    aux_kw_range: ItemRange::new(0.0, 8.0),
    torque_nm_range: ItemRange::new(-100.0, 250.0),
    hv_batt_i_range: ItemRange::new(-150.0, 450.0),
    lv_batt_v_range: ItemRange::new(10.0, 16.0),
    can_is_500k: true,
    req_timeout_ms: 500,
};

// UDS request catalogue (indices must match the constants above).
const REQ_GEAR_POSITION: CanRequest =
    CanRequest::new(0x797, 0x79A, 8, [0x03, 0x22, 0x11, 0x56, 0, 0, 0, 0]);
const REQ_12V_BATT_V: CanRequest =
    CanRequest::new(0x797, 0x79A, 8, [0x03, 0x22, 0x11, 0x03, 0, 0, 0, 0]);
const REQ_12V_BATT_I: CanRequest =
    CanRequest::new(0x797, 0x79A, 8, [0x03, 0x22, 0x11, 0x83, 0, 0, 0, 0]);
const REQ_LV_AUX_PWR: CanRequest =
    CanRequest::new(0x797, 0x79A, 8, [0x03, 0x22, 0x11, 0x52, 0, 0, 0, 0]);
const REQ_AC_AUX_PWR: CanRequest =
    CanRequest::new(0x797, 0x79A, 8, [0x03, 0x22, 0x11, 0x51, 0, 0, 0, 0]);
const REQ_SPEED: CanRequest =
    CanRequest::new(0x797, 0x79A, 8, [0x03, 0x22, 0x12, 0x1A, 0, 0, 0, 0]);
const REQ_HV_BATT_INFO: CanRequest =
    CanRequest::new(0x79B, 0x7BB, 8, [0x02, 0x21, 0x01, 0, 0, 0, 0, 0]);
const REQ_HV_BATT_TEMP: CanRequest =
    CanRequest::new(0x79B, 0x7BB, 8, [0x02, 0x21, 0x04, 0, 0, 0, 0, 0]);
const REQ_TORQUE: CanRequest =
    CanRequest::new(0x784, 0x78C, 8, [0x03, 0x22, 0x12, 0x25, 0, 0, 0, 0]);

pub(crate) const CATALOGUE: [&CanRequest; NUM_REQUESTS] = [
    &REQ_GEAR_POSITION,
    &REQ_12V_BATT_V,
    &REQ_12V_BATT_I,
    &REQ_LV_AUX_PWR,
    &REQ_AC_AUX_PWR,
    &REQ_SPEED,
    &REQ_HV_BATT_INFO,
    &REQ_HV_BATT_TEMP,
    &REQ_TORQUE,
];

/// Pack temperature sensor transform: `(min_raw, base °F, reference raw,
/// slope °F per count)`. Each row covers raws down to `min_raw`.
const TEMP_SEGMENTS: [(i16, f32, i16, f32); 12] = [
    (589, 162.0, 0, 0.181),
    (569, 57.2, 579, 0.18),
    (558, 60.8, 558, 0.16363636363636364),
    (548, 62.6, 548, 0.18),
    (537, 64.4, 537, 0.16363636363636364),
    (447, 66.2, 527, 0.18),
    (438, 82.4, 438, 0.2),
    (428, 84.2, 428, 0.18),
    (365, 86.0, 419, 0.2),
    (357, 98.6, 357, 0.225),
    (348, 100.4, 348, 0.2),
    (316, 102.2, 340, 0.225),
];

const TEMP_SEGMENT_FLOOR: (i16, f32, i16, f32) = (i16::MIN, 109.4, 309, 0.2571428571428572);

fn hv_batt_temp_f(raw: i16) -> f32 {
    if raw == 1021 {
        return 1.0;
    }
    let (_, base, reference, slope) = TEMP_SEGMENTS
        .iter()
        .copied()
        .find(|&(min, ..)| raw >= min)
        .unwrap_or(TEMP_SEGMENT_FLOOR);
    base + f32::from(reference.wrapping_sub(raw)) * slope
}

fn fahrenheit_to_celsius(f: f32) -> f32 {
    (f - 32.0) * 5.0 / 9.0
}

pub struct LeafZe1 {
    broker: Arc<DataBroker>,
    scheduler: RequestScheduler,
    // Reverse gear flips the sign of the published torque.
    in_reverse: bool,
    // AUX power is the sum of two separately polled loads.
    lv_aux_kw: f32,
    ac_aux_kw: f32,
}

impl LeafZe1 {
    pub fn new(broker: Arc<DataBroker>) -> Self {
        Self {
            broker,
            scheduler: RequestScheduler::new(),
            in_reverse: false,
            lv_aux_kw: 0.0,
            ac_aux_kw: 0.0,
        }
    }
}

#[async_trait]
impl VehicleDecoder for LeafZe1 {
    fn profile(&self) -> &'static VehicleProfile {
        &PROFILE
    }

    async fn init(&mut self, can: &CanManager) {
        // The car's gateway already filters the OBD bus for us.
        can.set_response_filter(false);
    }

    async fn eval(&mut self, can: &CanManager) {
        self.scheduler.eval(can).await;
    }

    fn set_request_mask(&mut self, mask: DataItems) {
        let mut required = [false; NUM_REQUESTS];
        required[UDS_GEAR_POSITION] = mask.wants(DataItems::FRONT_TORQUE);
        required[UDS_12V_BATT_V] = mask.wants(DataItems::LV_BATT_V);
        required[UDS_12V_BATT_I] = mask.wants(DataItems::LV_BATT_I);
        required[UDS_LV_AUX_PWR] = mask.wants(DataItems::AUX_KW);
        required[UDS_AC_AUX_PWR] = mask.wants(DataItems::AUX_KW);
        required[UDS_SPEED] = mask.wants(DataItems::SPEED);
        required[UDS_HV_BATT_INFO] =
            mask.wants(DataItems::HV_BATT_V | DataItems::HV_BATT_I);
        required[UDS_HV_BATT_TEMP] =
            mask.wants(DataItems::HV_BATT_MIN_T | DataItems::HV_BATT_MAX_T);
        required[UDS_TORQUE] = mask.wants(DataItems::FRONT_TORQUE);

        let list = CATALOGUE
            .iter()
            .zip(required)
            .filter_map(|(request, keep)| keep.then_some(*request))
            .collect();
        self.scheduler.set_list(list);
    }

    fn rx_data(&mut self, rsp_id: u32, data: &[u8]) {
        self.scheduler.note_response();

        match resolve_index(rsp_id, data, &CATALOGUE) {
            Some(UDS_GEAR_POSITION) => {
                if data.len() == 4 {
                    self.in_reverse = data[3] == GEAR_REVERSE;
                }
            }
            Some(UDS_12V_BATT_V) => {
                if data.len() == 4 {
                    let volts = f32::from(data[3]) * 0.08;
                    self.broker.set_value(DataItems::LV_BATT_V, volts);
                }
            }
            Some(UDS_12V_BATT_I) => {
                if data.len() == 5 {
                    let raw = i16::from_be_bytes([data[3], data[4]]);
                    self.broker
                        .set_value(DataItems::LV_BATT_I, f32::from(raw) / 256.0);
                }
            }
            Some(UDS_LV_AUX_PWR) => {
                if data.len() == 4 {
                    self.lv_aux_kw = f32::from(data[3]) * 0.1;
                    self.broker
                        .set_value(DataItems::AUX_KW, self.lv_aux_kw + self.ac_aux_kw);
                }
            }
            Some(UDS_AC_AUX_PWR) => {
                if data.len() == 4 {
                    self.ac_aux_kw = f32::from(data[3]) * 0.25;
                    self.broker
                        .set_value(DataItems::AUX_KW, self.lv_aux_kw + self.ac_aux_kw);
                }
            }
            Some(UDS_SPEED) => {
                if data.len() == 5 {
                    let raw = u16::from_be_bytes([data[3], data[4]]);
                    self.broker
                        .set_value(DataItems::SPEED, f32::from(raw) / 10.0);
                }
            }
            Some(UDS_HV_BATT_INFO) => {
                if data.len() == 53 {
                    // The second current reading averages better than the
                    // instantaneous one at offset 2.
                    let amps =
                        i32::from_be_bytes([data[8], data[9], data[10], data[11]]) as f32 / 1024.0;
                    self.broker.set_value(DataItems::HV_BATT_I, amps);

                    let volts =
                        f32::from(u16::from_be_bytes([data[20], data[21]])) / 100.0;
                    self.broker.set_value(DataItems::HV_BATT_V, volts);
                }
            }
            Some(UDS_HV_BATT_TEMP) => {
                if data.len() == 31 {
                    // Three of the four sensor slots are populated on the ZE1.
                    let t0 = fahrenheit_to_celsius(hv_batt_temp_f(i16::from_be_bytes([
                        data[2], data[3],
                    ])));
                    let t1 = fahrenheit_to_celsius(hv_batt_temp_f(i16::from_be_bytes([
                        data[5], data[6],
                    ])));
                    let t3 = fahrenheit_to_celsius(hv_batt_temp_f(i16::from_be_bytes([
                        data[11], data[12],
                    ])));

                    self.broker
                        .set_value(DataItems::HV_BATT_MIN_T, t0.min(t1).min(t3));
                    self.broker
                        .set_value(DataItems::HV_BATT_MAX_T, t0.max(t1).max(t3));
                }
            }
            Some(UDS_TORQUE) => {
                if data.len() == 5 {
                    let raw = i16::from_be_bytes([data[3], data[4]]);
                    let mut torque = f32::from(raw) / 64.0;
                    // Reverse drives the motor the same direction as regen
                    // in a forward gear; flip the sign so reverse shows as
                    // propulsion rather than regeneration.
                    if self.in_reverse {
                        torque = -torque;
                    }
                    self.broker.set_value(DataItems::FRONT_TORQUE, torque);
                }
            }
            _ => {}
        }
    }

    fn note_error(&mut self, error: InterfaceError) {
        // Timeouts are the only error expected here.
        if error == InterfaceError::Timeout {
            self.scheduler.note_timeout();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_transform_matches_known_points() {
        // Sentinel raw value.
        assert_eq!(hv_batt_temp_f(1021), 1.0);
        // Top segment: 162.0 - raw * 0.181.
        assert!((hv_batt_temp_f(600) - (162.0 - 600.0 * 0.181)).abs() < 1e-4);
        // Mid segment anchored at its own lower bound.
        assert!((hv_batt_temp_f(438) - 82.4).abs() < 1e-4);
        // Floor segment.
        assert!((hv_batt_temp_f(300) - (109.4 + 9.0 * 0.2571428571428572)).abs() < 1e-4);
    }

    #[test]
    fn catalogue_indices_line_up() {
        assert_eq!(CATALOGUE[UDS_TORQUE].req_id, 0x784);
        assert_eq!(CATALOGUE[UDS_HV_BATT_INFO].rsp_id, 0x7BB);
        assert_eq!(CATALOGUE[UDS_SPEED].data[3], 0x1A);
    }

    #[test]
    fn mask_compaction_selects_exactly_the_required_entries() {
        let mut decoder = LeafZe1::new(Arc::new(DataBroker::new()));

        // Torque needs the gear position as well.
        decoder.set_request_mask(DataItems::FRONT_TORQUE);
        assert_eq!(
            decoder.scheduler.list(),
            &[&REQ_GEAR_POSITION, &REQ_TORQUE]
        );

        decoder.set_request_mask(DataItems::LV_BATT_V);
        assert_eq!(decoder.scheduler.list(), &[&REQ_12V_BATT_V]);

        // AUX is the sum of two loads, so both requests are compiled in.
        decoder.set_request_mask(DataItems::AUX_KW);
        assert_eq!(
            decoder.scheduler.list(),
            &[&REQ_LV_AUX_PWR, &REQ_AC_AUX_PWR]
        );

        decoder.set_request_mask(DataItems::empty());
        assert!(decoder.scheduler.list().is_empty());

        // Every single-bit mask compiles to a subset of the catalogue.
        for (item, _) in DataItems::LABELED {
            decoder.set_request_mask(item);
            assert!(decoder
                .scheduler
                .list()
                .iter()
                .all(|request| CATALOGUE.contains(request)));
        }
    }

    #[test]
    fn torque_sign_follows_gear_position() {
        let broker = Arc::new(DataBroker::new());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        broker.register_callback(DataItems::FRONT_TORQUE, move |v| sink.lock().push(v));

        let mut decoder = LeafZe1::new(broker.clone());

        // 2048 / 64 = 32 N·m in drive.
        decoder.rx_data(0x79A, &[0x62, 0x12, 0x25, 0x08, 0x00]);
        broker.drain();
        // Shift to reverse: the same raw torque now publishes negated.
        decoder.rx_data(0x79A, &[0x62, 0x11, 0x56, GEAR_REVERSE]);
        decoder.rx_data(0x79A, &[0x62, 0x12, 0x25, 0x08, 0x00]);
        broker.drain();

        assert_eq!(*seen.lock(), vec![32.0, -32.0]);
    }
}
