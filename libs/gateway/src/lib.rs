pub mod bridge;
pub mod config;
pub mod facade;
pub mod lifecycle;
pub mod router;
pub mod wire;

pub use config::{GatewayConfig, GatewayConfigValidationError};
pub use facade::GatewayState;
pub use router::Router;
