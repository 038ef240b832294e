//! Agent RPC (C9): the wire format, server, and client halves of the peer
//! protocol.

pub mod client;
pub mod server;
pub mod wire;

pub use client::RpcClient;
pub use server::{serve, RpcServerContext};
