//! coedit gateway - WebSocket/HTTP surface over the coordinator

pub mod rpc;
pub mod server;
pub mod ws;

pub use server::{build_router, start_gateway};
pub use ws::WsState;
