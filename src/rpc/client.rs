//! Agent RPC client (C9, client half): the `PeerTransport` used by the Peer
//! Directory, plus the other unary calls this protocol defines, wrapped with
//! the circuit breaker / retry infra (C15/C16) the rest of this codebase
//! uses for anything that talks over a socket.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{Result, RtrmError};
use crate::peer::{DiscoverReply, PeerRole, PeerTransport};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::rpc::wire::{read_frame, write_frame, PeerRoleWire, RpcReply, RpcRequest, RpcStatus};

const DISCOVER_TIMEOUT: Duration = Duration::from_secs(2);
const PING_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP-backed RPC client. One breaker per peer address, so a single dead
/// peer can't fast-fail calls to every other peer in the range.
pub struct RpcClient {
    local_id: u32,
    port: u16,
    breakers: Mutex<std::collections::HashMap<Ipv4Addr, CircuitBreaker>>,
}

impl RpcClient {
    pub fn new(local_id: u32, port: u16) -> Self {
        Self { local_id, port, breakers: Mutex::new(std::collections::HashMap::new()) }
    }

    async fn breaker_for(&self, addr: Ipv4Addr) -> CircuitBreaker {
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(addr)
            .or_insert_with(|| CircuitBreaker::new(format!("rpc:{addr}"), CircuitBreakerConfig::default()))
            .clone()
    }

    /// Connect, send one request, read one reply, all within `timeout`.
    /// Tracked through the per-address circuit breaker.
    async fn call(&self, addr: Ipv4Addr, request: RpcRequest, timeout: Duration) -> Result<RpcReply> {
        let breaker = self.breaker_for(addr).await;
        if !breaker.is_allowed().await {
            return Err(RtrmError::PeerUnreachable { id: 0, reason: format!("{addr}: circuit open") });
        }

        let outcome = tokio::time::timeout(timeout, async {
            let mut stream = TcpStream::connect((addr, self.port))
                .await
                .map_err(|e| RtrmError::PeerUnreachable { id: 0, reason: e.to_string() })?;
            write_frame(&mut stream, &request).await?;
            read_frame(&mut stream).await
        })
        .await;

        match outcome {
            Ok(Ok(reply)) => {
                breaker.record_success().await;
                Ok(reply)
            }
            Ok(Err(e)) => {
                breaker.record_failure().await;
                Err(e)
            }
            Err(_) => {
                breaker.record_failure().await;
                Err(RtrmError::PeerUnreachable { id: 0, reason: format!("{addr}: rpc timed out") })
            }
        }
    }

    /// Like [`RpcClient::call`], but retries transient failures with
    /// exponential backoff. A breaker that's already open rejects every
    /// attempt identically, so this costs nothing extra once a peer is
    /// known to be down.
    async fn call_with_retry(&self, addr: Ipv4Addr, request: RpcRequest, timeout: Duration) -> Result<RpcReply> {
        retry_with_backoff(&RetryConfig::default(), || self.call(addr, request.clone(), timeout)).await
    }

    /// `GetResourceStatus` against a remote peer. Returns
    /// `(total, used)` on success.
    pub async fn resource_status(&self, addr: Ipv4Addr, path: &str) -> Result<(u64, u64)> {
        let reply = self
            .call_with_retry(
                addr,
                RpcRequest::GetResourceStatus { sender_id: self.local_id, path: path.to_string() },
                DEFAULT_TIMEOUT,
            )
            .await?;
        match reply {
            RpcReply::ResourceStatus { status: RpcStatus::Ok, total, used, .. } => Ok((total, used)),
            _ => Err(RtrmError::PeerUnreachable { id: 0, reason: "resource status request failed".into() }),
        }
    }

    /// `GetWorkloadStatus` against a remote peer. Returns `(running, ready)`.
    pub async fn workload_status(&self, addr: Ipv4Addr) -> Result<(u64, u64)> {
        let reply = self
            .call_with_retry(addr, RpcRequest::GetWorkloadStatus { sender_id: self.local_id }, DEFAULT_TIMEOUT)
            .await?;
        match reply {
            RpcReply::WorkloadStatus { status: RpcStatus::Ok, nr_running, nr_ready } => Ok((nr_running, nr_ready)),
            _ => Err(RtrmError::PeerUnreachable { id: 0, reason: "workload status request failed".into() }),
        }
    }

    /// `GetChannelStatus` against a remote peer — the reported latency is the
    /// remote side's own measurement of this round trip, unused
    /// here beyond surfacing it to callers.
    pub async fn channel_status(&self, addr: Ipv4Addr) -> Result<u64> {
        let reply = self
            .call_with_retry(addr, RpcRequest::GetChannelStatus { sender_id: self.local_id }, DEFAULT_TIMEOUT)
            .await?;
        match reply {
            RpcReply::ChannelStatus { status: RpcStatus::Ok, latency_ms, .. } => Ok(latency_ms),
            _ => Err(RtrmError::PeerUnreachable { id: 0, reason: "channel status request failed".into() }),
        }
    }

    pub async fn send_join_request(&self, addr: Ipv4Addr, path: &str) -> Result<()> {
        let reply = self
            .call_with_retry(
                addr,
                RpcRequest::SendJoinRequest { sender_id: self.local_id, path: path.to_string() },
                DEFAULT_TIMEOUT,
            )
            .await?;
        expect_ok(reply)
    }

    pub async fn send_disjoin_request(&self, addr: Ipv4Addr, path: &str) -> Result<()> {
        let reply = self
            .call_with_retry(
                addr,
                RpcRequest::SendDisjoinRequest { sender_id: self.local_id, path: path.to_string() },
                DEFAULT_TIMEOUT,
            )
            .await?;
        expect_ok(reply)
    }

    pub async fn set_node_management_action(&self, addr: Ipv4Addr, action_code: u32) -> Result<()> {
        let reply = self
            .call_with_retry(
                addr,
                RpcRequest::SetNodeManagementAction { sender_id: self.local_id, action_code },
                DEFAULT_TIMEOUT,
            )
            .await?;
        expect_ok(reply)
    }
}

fn expect_ok(reply: RpcReply) -> Result<()> {
    if reply.status() == RpcStatus::Ok {
        Ok(())
    } else {
        Err(RtrmError::PeerUnreachable { id: 0, reason: "peer returned a failure status".into() })
    }
}

#[async_trait]
impl PeerTransport for RpcClient {
    async fn discover(&self, addr: Ipv4Addr, caller_role: PeerRole) -> Result<DiscoverReply> {
        let reply = self
            .call(
                addr,
                RpcRequest::Discover { sender_id: self.local_id, caller_role: caller_role.into() },
                DISCOVER_TIMEOUT,
            )
            .await?;
        match reply {
            RpcReply::Discover { status: RpcStatus::Ok, remote_role, assigned_id } => {
                Ok(DiscoverReply { role: PeerRole::from(remote_role), assigned_id })
            }
            _ => Err(RtrmError::PeerUnreachable { id: 0, reason: "discover request failed".into() }),
        }
    }

    /// `Ok(None)` both on an explicit FAIL reply and on a connection-level
    /// failure — the Peer Directory treats both identically as a missed
    /// sample, so only a circuit-open rejection is worth distinguishing, and
    /// it never happens here since `ping` always degrades instead of
    /// propagating.
    async fn ping(&self, addr: Ipv4Addr, sender_id: u16) -> Result<Option<u64>> {
        let started = Instant::now();
        match self.call(addr, RpcRequest::Ping { sender_id: sender_id as u32 }, PING_TIMEOUT).await {
            Ok(RpcReply::Ping { status: RpcStatus::Ok }) => Ok(Some(started.elapsed().as_millis() as u64)),
            Ok(_) => Ok(None),
            Err(e) => {
                debug!(%addr, err = %e, "ping failed");
                Ok(None)
            }
        }
    }
}
