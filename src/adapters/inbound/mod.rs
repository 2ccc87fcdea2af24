mod admin_server;
mod gateway_server;

pub use admin_server::{router as admin_router, AdminServer, AdminState, RegisterResponse};
pub use gateway_server::{router as gateway_router, GatewayServer, GatewayState, MAX_BODY_BYTES};
