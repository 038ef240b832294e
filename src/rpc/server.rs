//! Agent RPC server (C9): accepts peer connections and answers the wire
//! protocol's request surface against the local Accounter/Registry/Directory.

use std::sync::Arc;
use std::time::Instant;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::app::registry::ApplicationRegistry;
use crate::app::ExcState;
use crate::error::Result;
use crate::peer::{PeerDirectory, PeerRole};
use crate::res::accounter::{ResourceAccounter, COMMITTED_VIEW};
use crate::res::path::ResourcePath;
use crate::rpc::wire::{read_frame, write_frame, PeerRoleWire, RpcReply, RpcRequest, RpcStatus};

/// Shared state the RPC server answers requests against.
pub struct RpcServerContext {
    pub accounter: Arc<ResourceAccounter>,
    pub registry: Arc<ApplicationRegistry>,
    pub directory: Arc<PeerDirectory>,
    pub local_role: PeerRole,
}

/// Accept loop. Spawns one task per connection; each connection handles one
/// request at a time.
pub async fn serve(ctx: Arc<RpcServerContext>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!(%addr, "rpc connection accepted");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(ctx, socket).await {
                        warn!(%addr, err = %e, "rpc connection ended with an error");
                    }
                });
            }
            Err(e) => warn!(err = %e, "rpc accept failed"),
        }
    }
}

async fn handle_connection(ctx: Arc<RpcServerContext>, mut socket: TcpStream) -> Result<()> {
    loop {
        let started = Instant::now();
        let request: RpcRequest = match read_frame(&mut socket).await {
            Ok(r) => r,
            Err(_) => return Ok(()), // peer closed the connection
        };
        let reply = handle_request(&ctx, request, started).await;
        write_frame(&mut socket, &reply).await?;
    }
}

pub(crate) async fn handle_request(ctx: &RpcServerContext, request: RpcRequest, started: Instant) -> RpcReply {
    match request {
        RpcRequest::Discover { sender_id, caller_role: _ } => {
            info!(sender_id, "discover request received");
            RpcReply::Discover {
                status: RpcStatus::Ok,
                remote_role: PeerRoleWire::from(ctx.local_role),
                assigned_id: 0,
            }
        }
        RpcRequest::Ping { sender_id: _ } => RpcReply::Ping { status: RpcStatus::Ok },
        RpcRequest::GetResourceStatus { sender_id, path } => {
            handle_resource_status(ctx, sender_id, &path).await
        }
        RpcRequest::GetWorkloadStatus { sender_id } => handle_workload_status(ctx, sender_id).await,
        RpcRequest::GetChannelStatus { sender_id } => {
            debug!(sender_id, "channel status requested");
            let latency_ms = started.elapsed().as_millis() as u64;
            RpcReply::ChannelStatus { status: RpcStatus::Ok, connected: true, latency_ms }
        }
        RpcRequest::SendJoinRequest { sender_id, path } => {
            info!(sender_id, path, "join request received (no-op, single-system accounter)");
            RpcReply::Simple { status: RpcStatus::Ok }
        }
        RpcRequest::SendDisjoinRequest { sender_id, path } => {
            info!(sender_id, path, "disjoin request received (no-op, single-system accounter)");
            RpcReply::Simple { status: RpcStatus::Ok }
        }
        RpcRequest::SendScheduleRequest { sender_id, instance_id, .. } => {
            warn!(sender_id, instance_id, "schedule delegation requested but not supported by this instance");
            RpcReply::Simple { status: RpcStatus::Fail }
        }
        RpcRequest::SetNodeManagementAction { sender_id, action_code } => {
            info!(sender_id, action_code, "node management action received (no-op)");
            RpcReply::Simple { status: RpcStatus::Ok }
        }
    }
}

async fn handle_resource_status(ctx: &RpcServerContext, sender_id: u32, path: &str) -> RpcReply {
    let parsed = match ResourcePath::parse(path) {
        Ok(p) => p,
        Err(_) => return RpcReply::Simple { status: RpcStatus::Fail },
    };
    // Paths received over the wire carry a remote sysN prefix; rewrite to
    // sys0 before any local lookup.
    let local_path = parsed.rewrite_to_local_system();
    debug!(sender_id, path, local = %local_path.to_dotted(), "resource status requested");

    let total = match ctx.accounter.total(&local_path).await {
        Ok(t) => t,
        Err(_) => return RpcReply::Simple { status: RpcStatus::Fail },
    };
    let used = ctx.accounter.used(&local_path, COMMITTED_VIEW).await.unwrap_or(0);
    let load = if total == 0 { 0.0 } else { used as f64 / total as f64 };

    RpcReply::ResourceStatus {
        status: RpcStatus::Ok,
        total,
        used,
        power_mw: None,
        temperature: None,
        load,
        degradation: 0.0,
    }
}

async fn handle_workload_status(ctx: &RpcServerContext, sender_id: u32) -> RpcReply {
    debug!(sender_id, "workload status requested");
    let running = ctx.registry.by_state(ExcState::Running).await.len() as u64;
    let ready = ctx.registry.by_state(ExcState::Ready).await.len() as u64;
    RpcReply::WorkloadStatus { status: RpcStatus::Ok, nr_running: running, nr_ready: ready }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::recipe::{Constraints, Recipe};
    use crate::app::{make_uid, Exc};
    use crate::res::tree::ResourceTree;
    use std::sync::Arc as StdArc;
    use std::time::Instant;

    fn ctx() -> RpcServerContext {
        let mut tree = ResourceTree::new();
        tree.register(ResourcePath::parse("sys0.mem0").unwrap(), 1024).unwrap();
        let accounter = StdArc::new(ResourceAccounter::new(tree));
        let registry = StdArc::new(ApplicationRegistry::new());
        let directory = StdArc::new(PeerDirectory::new(
            StdArc::new(NoopTransport),
            std::net::Ipv4Addr::new(127, 0, 0, 1),
            (std::net::Ipv4Addr::new(127, 0, 0, 1), std::net::Ipv4Addr::new(127, 0, 0, 1)),
            false,
            false,
        ));
        RpcServerContext { accounter, registry, directory, local_role: PeerRole::Slave }
    }

    struct NoopTransport;
    #[async_trait::async_trait]
    impl crate::peer::PeerTransport for NoopTransport {
        async fn discover(
            &self,
            _addr: std::net::Ipv4Addr,
            _caller_role: PeerRole,
        ) -> Result<crate::peer::DiscoverReply> {
            unreachable!()
        }
        async fn ping(&self, _addr: std::net::Ipv4Addr, _sender_id: u16) -> Result<Option<u64>> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn resource_status_rewrites_remote_system_prefix() {
        let ctx = ctx();
        let reply = handle_request(
            &ctx,
            RpcRequest::GetResourceStatus { sender_id: 3, path: "sys3.mem0".to_string() },
            Instant::now(),
        )
        .await;
        match reply {
            RpcReply::ResourceStatus { status, total, used, .. } => {
                assert_eq!(status, RpcStatus::Ok);
                assert_eq!(total, 1024);
                assert_eq!(used, 0);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn workload_status_counts_running_and_ready() {
        let ctx = ctx();
        let recipe = StdArc::new(Recipe { name: "r".into(), awms: vec![], constraints: Constraints::default() });
        let mut e1 = Exc::new(make_uid(1, 0), "e1", 5, recipe.clone());
        e1.transition(ExcState::Ready).unwrap();
        ctx.registry.register(e1).await;
        let mut e2 = Exc::new(make_uid(2, 0), "e2", 5, recipe);
        e2.transition(ExcState::Ready).unwrap();
        ctx.registry.register(e2).await;

        let reply = handle_request(&ctx, RpcRequest::GetWorkloadStatus { sender_id: 1 }, Instant::now()).await;
        match reply {
            RpcReply::WorkloadStatus { nr_ready, nr_running, .. } => {
                assert_eq!(nr_ready, 2);
                assert_eq!(nr_running, 0);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_resource_path_fails_gracefully() {
        let ctx = ctx();
        let reply = handle_request(
            &ctx,
            RpcRequest::GetResourceStatus { sender_id: 1, path: "sys0.gpu0".to_string() },
            Instant::now(),
        )
        .await;
        assert_eq!(reply.status(), RpcStatus::Fail);
    }
}
