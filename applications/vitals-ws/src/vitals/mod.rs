pub mod alerts;
pub mod reading;
pub mod store;

pub use alerts::{CriticalAlert, Metric};
pub use reading::{Reading, VitalSignsPayload};
pub use store::{DeviceStats, VitalSignsStore};
