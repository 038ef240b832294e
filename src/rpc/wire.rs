//! Agent RPC (C9) wire types and framing.
//!
//! Every message is length-prefixed: a 4-byte big-endian length followed by
//! a JSON body — simple enough to avoid pulling in a gRPC stack the rest of
//! this codebase doesn't use.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RtrmError};
use crate::peer::PeerRole;

/// Largest frame body this daemon will read, guarding against a
/// misbehaving/hostile peer sending a huge length prefix.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcStatus {
    Ok,
    Fail,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRoleWire {
    Master,
    Slave,
}

impl From<PeerRole> for PeerRoleWire {
    fn from(role: PeerRole) -> Self {
        match role {
            PeerRole::Master => PeerRoleWire::Master,
            PeerRole::Slave => PeerRoleWire::Slave,
        }
    }
}

impl From<PeerRoleWire> for PeerRole {
    fn from(role: PeerRoleWire) -> Self {
        match role {
            PeerRoleWire::Master => PeerRole::Master,
            PeerRoleWire::Slave => PeerRole::Slave,
        }
    }
}

/// Requests this protocol defines, every one carrying a mandatory
/// `sender_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    Discover { sender_id: u32, caller_role: PeerRoleWire },
    Ping { sender_id: u32 },
    GetResourceStatus { sender_id: u32, path: String },
    GetWorkloadStatus { sender_id: u32 },
    GetChannelStatus { sender_id: u32 },
    SendJoinRequest { sender_id: u32, path: String },
    SendDisjoinRequest { sender_id: u32, path: String },
    SendScheduleRequest { sender_id: u32, instance_id: u32, application_schedule_request: String },
    SetNodeManagementAction { sender_id: u32, action_code: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcReply {
    Discover { status: RpcStatus, remote_role: PeerRoleWire, assigned_id: u16 },
    Ping { status: RpcStatus },
    ResourceStatus {
        status: RpcStatus,
        total: u64,
        used: u64,
        /// Telemetry not backed by a sensor on this platform; always `None`.
        power_mw: Option<f64>,
        /// Telemetry not backed by a sensor on this platform; always `None`.
        temperature: Option<f64>,
        load: f64,
        degradation: f64,
    },
    WorkloadStatus { status: RpcStatus, nr_running: u64, nr_ready: u64 },
    ChannelStatus { status: RpcStatus, connected: bool, latency_ms: u64 },
    Simple { status: RpcStatus },
}

impl RpcReply {
    pub fn status(&self) -> RpcStatus {
        match self {
            RpcReply::Discover { status, .. }
            | RpcReply::Ping { status }
            | RpcReply::ResourceStatus { status, .. }
            | RpcReply::WorkloadStatus { status, .. }
            | RpcReply::ChannelStatus { status, .. }
            | RpcReply::Simple { status } => *status,
        }
    }
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)
        .map_err(|e| RtrmError::ConfigInvalid(format!("rpc encode failed: {e}")))?;
    let len = u32::try_from(body.len())
        .map_err(|_| RtrmError::ConfigInvalid("rpc frame too large to encode".into()))?;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| RtrmError::PeerUnreachable { id: 0, reason: e.to_string() })?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| RtrmError::PeerUnreachable { id: 0, reason: e.to_string() })?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| RtrmError::PeerUnreachable { id: 0, reason: e.to_string() })?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(RtrmError::ConfigInvalid(format!("rpc frame of {len} bytes exceeds the limit")));
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| RtrmError::PeerUnreachable { id: 0, reason: e.to_string() })?;
    serde_json::from_slice(&body).map_err(|e| RtrmError::ConfigInvalid(format!("rpc decode failed: {e}")))
}
