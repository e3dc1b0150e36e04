mod response;
mod server;

pub use response::ApiError;
pub use server::{GatewayServer, GatewayState, HealthResponse};
