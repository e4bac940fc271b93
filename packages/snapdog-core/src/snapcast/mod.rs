//! The Snapcast integration: state repository (C1), JSON-RPC client (C2) and
//! the service facade (C3) that bridges the two into domain events.

pub mod rpc;
pub mod service;
pub mod state;

pub use rpc::{RpcClient, RpcError};
pub use service::SnapcastService;
pub use state::SnapcastState;
