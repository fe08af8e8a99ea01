//! Volkswagen MEB platform decoder (RWD and AWD variants)

use std::sync::Arc;

use async_trait::async_trait;

use evtel_broker::DataBroker;
use evtel_can::CanManager;
use evtel_core::{CanRequest, DataItems, InterfaceError, ItemRange};

use crate::decoder::{VehicleDecoder, VehicleProfile};
use crate::manager::resolve_index;
use crate::scheduler::RequestScheduler;

// Catalogue indices.
const UDS_12V_BATT_INFO: usize = 0;
const UDS_GPS_INFO: usize = 1;
const UDS_HV_AUX_PWR: usize = 2;
const UDS_HV_BATT_CUR: usize = 3;
const UDS_HV_BATT_MIN_T: usize = 4;
const UDS_HV_BATT_MAX_T: usize = 5;
const UDS_HV_BATT_VOLT: usize = 6;
const UDS_FRONT_TORQUE: usize = 7;
const UDS_REAR_TORQUE: usize = 8;
const UDS_GEAR_POSITION: usize = 9;
const UDS_SPEED: usize = 10;

const NUM_REQUESTS: usize = 11;

const GEAR_REVERSE: u8 = 0x07;

pub static RWD_PROFILE: VehicleProfile = VehicleProfile {
    name: "VW MEB RWD",
    supported_items: DataItems::from_bits_truncate(
        DataItems::HV_BATT_V.bits()
            | DataItems::HV_BATT_I.bits()
            | DataItems::HV_BATT_MIN_T.bits()
            | DataItems::HV_BATT_MAX_T.bits()
            | DataItems::LV_BATT_V.bits()
            | DataItems::LV_BATT_I.bits()
            | DataItems::AUX_KW.bits()
            | DataItems::REAR_TORQUE.bits()
            | DataItems::SPEED.bits()
            | DataItems::GPS_ELEVATION.bits(),
    ),
    power_kw_range: ItemRange::new(-200.0, 300.0),
    aux_kw_range: ItemRange::new(0.0, 16.0),
    torque_nm_range: ItemRange::new(-150.0, 350.0),
    hv_batt_i_range: ItemRange::new(-400.0, 600.0),
    lv_batt_v_range: ItemRange::new(10.0, 16.0),
    can_is_500k: true,
    req_timeout_ms: 500,
};

pub static AWD_PROFILE: VehicleProfile = VehicleProfile {
    name: "VW MEB AWD",
    supported_items: DataItems::from_bits_truncate(
        DataItems::HV_BATT_V.bits()
            | DataItems::HV_BATT_I.bits()
            | DataItems::HV_BATT_MIN_T.bits()
            | DataItems::HV_BATT_MAX_T.bits()
            | DataItems::LV_BATT_V.bits()
            | DataItems::LV_BATT_I.bits()
            | DataItems::AUX_KW.bits()
            | DataItems::FRONT_TORQUE.bits()
            | DataItems::REAR_TORQUE.bits()
            | DataItems::SPEED.bits()
            | DataItems::GPS_ELEVATION.bits(),
    ),
    power_kw_range: ItemRange::new(-200.0, 300.0),
    aux_kw_range: ItemRange::new(0.0, 16.0),
    torque_nm_range: ItemRange::new(-150.0, 350.0),
    hv_batt_i_range: ItemRange::new(-400.0, 800.0),
    lv_batt_v_range: ItemRange::new(10.0, 16.0),
    can_is_500k: true,
    req_timeout_ms: 500,
};

// UDS request catalogue (indices must match the constants above). The BMS
// and drive controllers answer on 29-bit gateway addresses; speed comes
// from the functional OBD broadcast (service 01, PID 0D).
const REQ_12V_BATT_INFO: CanRequest =
    CanRequest::new(0x710, 0x77A, 8, [0x03, 0x22, 0x2A, 0xF7, 0, 0, 0, 0]);
const REQ_GPS_INFO: CanRequest =
    CanRequest::new(0x767, 0x7D1, 8, [0x03, 0x22, 0x24, 0x30, 0, 0, 0, 0]);
const REQ_AUX_POWER: CanRequest = CanRequest::new(
    0x17FC0076,
    0x17FE0076,
    8,
    [0x03, 0x22, 0x03, 0x64, 0, 0, 0, 0],
);
const REQ_HV_BATT_CURRENT: CanRequest = CanRequest::new(
    0x17FC007B,
    0x17FE007B,
    8,
    [0x03, 0x22, 0x1E, 0x3D, 0, 0, 0, 0],
);
const REQ_HV_BATT_MIN_T: CanRequest = CanRequest::new(
    0x17FC007B,
    0x17FE007B,
    8,
    [0x03, 0x22, 0x1E, 0x0F, 0, 0, 0, 0],
);
const REQ_HV_BATT_MAX_T: CanRequest = CanRequest::new(
    0x17FC007B,
    0x17FE007B,
    8,
    [0x03, 0x22, 0x1E, 0x0E, 0, 0, 0, 0],
);
const REQ_HV_BATT_VOLT: CanRequest = CanRequest::new(
    0x17FC007B,
    0x17FE007B,
    8,
    [0x03, 0x22, 0x1E, 0x3B, 0, 0, 0, 0],
);
const REQ_FRONT_TORQUE: CanRequest = CanRequest::new(
    0x17FC0076,
    0x17FE0076,
    8,
    [0x03, 0x22, 0x03, 0x35, 0, 0, 0, 0],
);
const REQ_REAR_TORQUE: CanRequest = CanRequest::new(
    0x17FC0076,
    0x17FE0076,
    8,
    [0x03, 0x22, 0x03, 0x3B, 0, 0, 0, 0],
);
const REQ_GEAR_POS: CanRequest = CanRequest::new(
    0x17FC0076,
    0x17FE0076,
    8,
    [0x03, 0x22, 0x21, 0x0E, 0, 0, 0, 0],
);
const REQ_SPEED: CanRequest = CanRequest::new(
    0x18DB33F1,
    0x18DAF101,
    8,
    [0x02, 0x01, 0x0D, 0, 0, 0, 0, 0],
);

pub(crate) const CATALOGUE: [&CanRequest; NUM_REQUESTS] = [
    &REQ_12V_BATT_INFO,
    &REQ_GPS_INFO,
    &REQ_AUX_POWER,
    &REQ_HV_BATT_CURRENT,
    &REQ_HV_BATT_MIN_T,
    &REQ_HV_BATT_MAX_T,
    &REQ_HV_BATT_VOLT,
    &REQ_FRONT_TORQUE,
    &REQ_REAR_TORQUE,
    &REQ_GEAR_POS,
    &REQ_SPEED,
];

pub struct VwMeb {
    profile: &'static VehicleProfile,
    broker: Arc<DataBroker>,
    scheduler: RequestScheduler,
    in_reverse: bool,
}

impl VwMeb {
    pub fn new(profile: &'static VehicleProfile, broker: Arc<DataBroker>) -> Self {
        Self {
            profile,
            broker,
            scheduler: RequestScheduler::new(),
            in_reverse: false,
        }
    }

    fn publish_torque(&self, item: DataItems, raw: i16) {
        let mut torque = f32::from(raw);
        // As on the Leaf: reverse looks like forward regen at the motor,
        // so gear knowledge flips the sign.
        if self.in_reverse {
            torque = -torque;
        }
        self.broker.set_value(item, torque);
    }
}

#[async_trait]
impl VehicleDecoder for VwMeb {
    fn profile(&self) -> &'static VehicleProfile {
        self.profile
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
        required[UDS_12V_BATT_INFO] =
            mask.wants(DataItems::LV_BATT_V | DataItems::LV_BATT_I);
        required[UDS_GPS_INFO] = mask.wants(DataItems::GPS_ELEVATION);
        required[UDS_HV_AUX_PWR] = mask.wants(DataItems::AUX_KW);
        required[UDS_HV_BATT_CUR] = mask.wants(DataItems::HV_BATT_I);
        required[UDS_HV_BATT_MIN_T] = mask.wants(DataItems::HV_BATT_MIN_T);
        required[UDS_HV_BATT_MAX_T] = mask.wants(DataItems::HV_BATT_MAX_T);
        required[UDS_HV_BATT_VOLT] =
            mask.wants(DataItems::HV_BATT_V | DataItems::AUX_KW);
        required[UDS_FRONT_TORQUE] = mask.wants(DataItems::FRONT_TORQUE);
        required[UDS_REAR_TORQUE] = mask.wants(DataItems::REAR_TORQUE);
        required[UDS_GEAR_POSITION] =
            mask.wants(DataItems::FRONT_TORQUE | DataItems::REAR_TORQUE);
        required[UDS_SPEED] = mask.wants(DataItems::SPEED);

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
            Some(UDS_12V_BATT_INFO) => {
                if data.len() == 26 {
                    let raw_v = u16::from_be_bytes([data[3], data[4]]);
                    self.broker
                        .set_value(DataItems::LV_BATT_V, f32::from(raw_v) / 1024.0 + 4.26);
                    let raw_i = i32::from_be_bytes([data[5], data[6], data[7], data[8]]);
                    self.broker
                        .set_value(DataItems::LV_BATT_I, raw_i as f32 / 1024.0);
                }
            }
            Some(UDS_GPS_INFO) => {
                if data.len() == 33 {
                    let raw = i16::from_be_bytes([data[31], data[32]]);
                    self.broker
                        .set_value(DataItems::GPS_ELEVATION, f32::from(raw) - 501.0);
                }
            }
            Some(UDS_HV_AUX_PWR) => {
                if data.len() == 5 {
                    let raw = i16::from_be_bytes([data[3], data[4]]);
                    self.broker
                        .set_value(DataItems::AUX_KW, f32::from(raw) / 10.0);
                }
            }
            Some(UDS_HV_BATT_CUR) => {
                if data.len() == 8 {
                    let raw = i32::from_be_bytes([data[3], data[4], data[5], data[6]]);
                    self.broker
                        .set_value(DataItems::HV_BATT_I, (raw - 150_000) as f32 / 100.0);
                }
            }
            Some(UDS_HV_BATT_MIN_T) => {
                if data.len() == 7 {
                    let raw = i16::from_be_bytes([data[3], data[4]]) / 64;
                    self.broker
                        .set_value(DataItems::HV_BATT_MIN_T, f32::from(raw));
                }
            }
            Some(UDS_HV_BATT_MAX_T) => {
                if data.len() == 7 {
                    let raw = i16::from_be_bytes([data[3], data[4]]) / 64;
                    self.broker
                        .set_value(DataItems::HV_BATT_MAX_T, f32::from(raw));
                }
            }
            Some(UDS_HV_BATT_VOLT) => {
                if data.len() == 5 {
                    let raw = i16::from_be_bytes([data[3], data[4]]);
                    self.broker
                        .set_value(DataItems::HV_BATT_V, f32::from(raw) / 4.0);
                }
            }
            Some(UDS_FRONT_TORQUE) => {
                if data.len() == 5 {
                    self.publish_torque(
                        DataItems::FRONT_TORQUE,
                        i16::from_be_bytes([data[3], data[4]]),
                    );
                }
            }
            Some(UDS_REAR_TORQUE) => {
                if data.len() == 5 {
                    self.publish_torque(
                        DataItems::REAR_TORQUE,
                        i16::from_be_bytes([data[3], data[4]]),
                    );
                }
            }
            Some(UDS_GEAR_POSITION) => {
                if data.len() == 5 {
                    self.in_reverse = data[4] == GEAR_REVERSE;
                }
            }
            Some(UDS_SPEED) => {
                if data.len() == 3 {
                    self.broker.set_value(DataItems::SPEED, f32::from(data[2]));
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
    fn variants_differ_only_in_torque_coverage_and_current_range() {
        assert!(AWD_PROFILE.supported_items.contains(DataItems::FRONT_TORQUE));
        assert!(!RWD_PROFILE.supported_items.contains(DataItems::FRONT_TORQUE));
        assert!(RWD_PROFILE.supported_items.contains(DataItems::REAR_TORQUE));
        assert_eq!(AWD_PROFILE.hv_batt_i_range.max, 800.0);
        assert_eq!(RWD_PROFILE.hv_batt_i_range.max, 600.0);
    }

    #[test]
    fn catalogue_indices_line_up() {
        assert_eq!(CATALOGUE[UDS_SPEED].req_id, 0x18DB33F1);
        assert_eq!(CATALOGUE[UDS_HV_BATT_CUR].rsp_id, 0x17FE007B);
        assert_eq!(CATALOGUE[UDS_GEAR_POSITION].data[3], 0x0E);
    }

    #[test]
    fn mask_compaction_selects_exactly_the_required_entries() {
        let mut decoder = VwMeb::new(&RWD_PROFILE, Arc::new(DataBroker::new()));

        decoder.set_request_mask(DataItems::REAR_TORQUE);
        assert_eq!(
            decoder.scheduler.list(),
            &[&REQ_REAR_TORQUE, &REQ_GEAR_POS]
        );

        // HV voltage also feeds the aux-power computation.
        decoder.set_request_mask(DataItems::AUX_KW);
        assert_eq!(
            decoder.scheduler.list(),
            &[&REQ_AUX_POWER, &REQ_HV_BATT_VOLT]
        );

        decoder.set_request_mask(DataItems::empty());
        assert!(decoder.scheduler.list().is_empty());
    }

    #[test]
    fn battery_temperature_keeps_integer_scaling() {
        let broker = Arc::new(DataBroker::new());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        broker.register_callback(DataItems::HV_BATT_MIN_T, move |v| sink.lock().push(v));

        let mut decoder = VwMeb::new(&AWD_PROFILE, broker.clone());
        // Raw 1600 / 64 truncates to 25 °C; 1599 / 64 truncates to 24 °C.
        decoder.rx_data(0x17FE007B, &[0x62, 0x1E, 0x0F, 0x06, 0x40, 0x00, 0x00]);
        broker.drain();
        decoder.rx_data(0x17FE007B, &[0x62, 0x1E, 0x0F, 0x06, 0x3F, 0x00, 0x00]);
        broker.drain();

        assert_eq!(*seen.lock(), vec![25.0, 24.0]);
    }
}
