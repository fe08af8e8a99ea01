//! evtel-vehicle - Vehicle decoder modules and the polling manager
//!
//! A vehicle decoder knows the UDS request catalogue of one EV platform,
//! compiles the subset needed for a capability mask, schedules requests
//! round-robin, extracts physical quantities from the responses, and
//! publishes them through the data broker. The vehicle manager selects a
//! decoder by name, builds the transport from the decoder's profile, and
//! shuttles responses from the receive path into the decoder.

pub mod decoder;
pub mod leaf_ze1;
pub mod manager;
pub mod scheduler;
pub mod vw_meb;

use std::sync::Arc;

use evtel_broker::DataBroker;

pub use decoder::{VehicleDecoder, VehicleProfile};
pub use manager::{resolve_index, VehicleError, VehicleManager};

/// Profiles of every implemented vehicle, in selection order.
pub fn profiles() -> [&'static VehicleProfile; 3] {
    [&leaf_ze1::PROFILE, &vw_meb::AWD_PROFILE, &vw_meb::RWD_PROFILE]
}

/// Names of every implemented vehicle.
pub fn vehicle_names() -> Vec<&'static str> {
    profiles().iter().map(|p| p.name).collect()
}

/// Look up a vehicle profile by its display name.
pub fn profile(name: &str) -> Option<&'static VehicleProfile> {
    profiles().into_iter().find(|p| p.name == name)
}

/// Instantiate the decoder for `name`, publishing through `broker`.
pub fn create_decoder(name: &str, broker: Arc<DataBroker>) -> Option<Box<dyn VehicleDecoder>> {
    match name {
        n if n == leaf_ze1::PROFILE.name => Some(Box::new(leaf_ze1::LeafZe1::new(broker))),
        n if n == vw_meb::AWD_PROFILE.name => {
            Some(Box::new(vw_meb::VwMeb::new(&vw_meb::AWD_PROFILE, broker)))
        }
        n if n == vw_meb::RWD_PROFILE.name => {
            Some(Box::new(vw_meb::VwMeb::new(&vw_meb::RWD_PROFILE, broker)))
        }
        _ => None,
    }
}
