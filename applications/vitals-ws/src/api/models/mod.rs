pub mod devices;
pub mod vitals;
