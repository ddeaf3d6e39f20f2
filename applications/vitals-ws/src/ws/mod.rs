pub mod connection;
pub mod handler;
pub mod protocol;
pub mod session;

pub use handler::{health_check, live_handler, ws_handler, AppState, ConnectionGuard};
pub use protocol::{DeviceMessage, ServerMessage};
pub use session::{ConnectionState, DeviceConnection, Reply};
