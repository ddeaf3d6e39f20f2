pub mod api;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod upstream;
pub mod vitals;
pub mod ws;

// Re-export commonly used items
pub use api::create_router;
pub use config::Config;
pub use error::{AppError, Result};
pub use vitals::Reading;
pub use ws::{AppState, DeviceMessage, ServerMessage};
