use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bgp_rs::Message;
use futures::SinkExt;
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use super::peer::PeerTask;
use super::{
    CommandTx, Dispatcher, LinkStateDecoder, MessageCodec, PacketStats, PeerContext,
    SessionCommand, SessionError, SessionInfo, SessionState,
};
use crate::config::{BgpConfig, ConfigState};
use crate::rib::{NlriAttributes, NlriKey, PeerRib, RouteDistinguisher};
use crate::utils::SystemStats;

struct RunningTask {
    commands: CommandTx,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PeerSlot {
    context: PeerContext,
    task: Option<RunningTask>,
}

impl PeerSlot {
    fn live_task(&self) -> Option<&RunningTask> {
        self.task.as_ref().filter(|task| !task.handle.is_finished())
    }

    /// Drop a finished task, logging a panic
    async fn reap(&mut self, addr: IpAddr) {
        let finished = match &self.task {
            Some(task) => task.handle.is_finished(),
            None => false,
        };
        if !finished {
            return;
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.handle.await {
                warn!("Session task for {} failed: {}", addr, err);
            }
        }
    }
}

struct ManagerInner {
    config: Arc<BgpConfig>,
    //                 remote_ip: peer
    peers: Mutex<HashMap<IpAddr, PeerSlot>>,
    dispatcher: Dispatcher,
    // Bounds concurrent session teardowns
    barrier: Semaphore,
    listener: Mutex<Option<JoinHandle<()>>>,
    system: SystemStats,
}

/// Connection controller: accepts inbound peers, starts outbound ones
/// and exposes per-peer RIBs and counters
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(config: Arc<BgpConfig>, decoder: Arc<dyn LinkStateDecoder>) -> Self {
        let speaker = config.speaker();
        Self {
            inner: Arc::new(ManagerInner {
                config,
                peers: Mutex::new(HashMap::new()),
                dispatcher: Dispatcher::new(decoder, speaker.dispatch_workers),
                barrier: Semaphore::new(speaker.barrier_workers.max(1)),
                listener: Mutex::new(None),
                system: SystemStats::new(),
            }),
        }
    }

    pub fn config(&self) -> &Arc<BgpConfig> {
        &self.inner.config
    }

    /// Bind the listener and connect self-initiated peers
    ///   Fails unless both local AS and router-id are configured
    pub async fn start(&self) -> io::Result<SocketAddr> {
        let config = &self.inner.config;
        let state = config.state();
        if state != ConfigState::Ready {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Speaker not ready to start [{}]", state),
            ));
        }
        let speaker = config.speaker();
        let listener = TcpListener::bind((speaker.listen_addr, speaker.listen_port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening for BGP-LS peers on {}", local_addr);

        let manager = self.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => manager.handle_inbound(stream, remote).await,
                    Err(err) => warn!("Error accepting connection: {}", err),
                }
            }
        });
        if let Some(previous) = self.inner.listener.lock().await.replace(accept) {
            previous.abort();
        }

        for peer in config.peers() {
            if peer.self_initiated && config.is_peer_connectable(peer.router_id) {
                self.connect_peer(peer.router_id).await;
            }
        }
        Ok(local_addr)
    }

    /// Stop listening and end every session
    pub async fn stop(&self) {
        if let Some(listener) = self.inner.listener.lock().await.take() {
            listener.abort();
        }
        let tasks: Vec<(IpAddr, RunningTask)> = {
            let mut peers = self.inner.peers.lock().await;
            peers
                .iter_mut()
                .filter_map(|(addr, slot)| slot.task.take().map(|task| (*addr, task)))
                .collect()
        };
        for (addr, task) in tasks {
            end_task(addr, task, SessionError::AdminShutdown).await;
            self.inner.config.set_peer_conn_state(addr, SessionState::Idle);
        }
        self.inner.dispatcher.close();
        self.inner.barrier.close();
        info!("Stopped all sessions");
    }

    async fn handle_inbound(&self, stream: TcpStream, remote: SocketAddr) {
        let addr = remote.ip();
        let config = &self.inner.config;
        if config.state() != ConfigState::Ready {
            warn!("Rejecting connection from {}: speaker not ready", remote);
            tokio::spawn(reject(stream));
            return;
        }
        if !config.is_peer_configured(addr) {
            warn!("Unexpected connection from {}: Not a configured peer", remote);
            tokio::spawn(reject(stream));
            return;
        }

        let mut peers = self.inner.peers.lock().await;
        let slot = peers.entry(addr).or_default();
        slot.reap(addr).await;
        let state = config.get_peer_conn_state(addr);
        let speaker = config.speaker();
        match state {
            // Collision, the session decides which connection survives
            SessionState::OpenSent | SessionState::OpenConfirm | SessionState::Established => (),
            _ if config.count_in_state(SessionState::Established) >= speaker.max_sessions => {
                warn!(
                    "Rejecting connection from {}: {} sessions already established",
                    remote, speaker.max_sessions
                );
                tokio::spawn(reject(stream));
                return;
            }
            _ => (),
        }

        let stream = match slot.live_task() {
            Some(task) => {
                debug!("Handing connection from {} to its session task [{}]", remote, state);
                match task.commands.send(SessionCommand::Accept(stream)) {
                    Ok(()) => return,
                    // Task ended after the liveness check, start over with the stream
                    Err(mpsc::error::SendError(SessionCommand::Accept(stream))) => stream,
                    Err(_) => return,
                }
            }
            None => stream,
        };
        slot.task = Some(self.spawn_task(addr, slot.context.clone(), Some(stream)));
    }

    fn spawn_task(
        &self,
        addr: IpAddr,
        context: PeerContext,
        inbound: Option<TcpStream>,
    ) -> RunningTask {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = PeerTask::new(
            addr,
            Arc::clone(&self.inner.config),
            context,
            self.inner.dispatcher.clone(),
            rx,
        );
        RunningTask {
            commands,
            handle: tokio::spawn(task.run(inbound)),
        }
    }

    /// Add a peer in Idle, false if it already exists
    pub async fn add_peer(&self, addr: IpAddr, remote_as: u32, hold_time: Option<u16>) -> bool {
        if !self.inner.config.add_peer(addr, remote_as, hold_time) {
            return false;
        }
        self.inner.peers.lock().await.entry(addr).or_default();
        true
    }

    /// End any session with the peer (Cease/Deconfigured) and forget it
    pub async fn remove_peer(&self, addr: IpAddr) -> bool {
        if !self.inner.config.is_peer_configured(addr) {
            return false;
        }
        self.end_session(addr, SessionError::Deconfigured).await;
        let removed = self.inner.config.remove_peer(addr);
        self.inner.peers.lock().await.remove(&addr);
        removed
    }

    /// Start connecting to an Idle peer
    pub async fn connect_peer(&self, addr: IpAddr) -> bool {
        let config = &self.inner.config;
        if config.state() != ConfigState::Ready {
            warn!("Can't connect {}: speaker not ready", addr);
            return false;
        }
        if !config.connect_peer(addr) {
            return false;
        }
        let mut peers = self.inner.peers.lock().await;
        let slot = peers.entry(addr).or_default();
        slot.reap(addr).await;
        if let Some(task) = slot.live_task() {
            if task.commands.send(SessionCommand::Connect).is_ok() {
                debug!("Session task for {} told to connect", addr);
                return true;
            }
        }
        info!("Connecting to {}", addr);
        slot.task = Some(self.spawn_task(addr, slot.context.clone(), None));
        true
    }

    /// End any session with the peer (Cease/Admin shutdown), leaving it configured in Idle
    pub async fn disconnect_peer(&self, addr: IpAddr) -> bool {
        if !self.inner.config.is_peer_configured(addr) {
            return false;
        }
        self.end_session(addr, SessionError::AdminShutdown).await;
        self.inner.config.disconnect_peer(addr)
    }

    async fn end_session(&self, addr: IpAddr, reason: SessionError) {
        let _permit = match self.inner.barrier.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Controller stopped, not ending session with {}", addr);
                return;
            }
        };
        let task = match self.inner.peers.lock().await.get_mut(&addr) {
            Some(slot) => slot.task.take(),
            None => None,
        };
        if let Some(task) = task {
            end_task(addr, task, reason).await;
        }
    }

    pub fn is_peer_configured(&self, addr: IpAddr) -> bool {
        self.inner.config.is_peer_configured(addr)
    }

    pub fn is_peer_connectable(&self, addr: IpAddr) -> bool {
        self.inner.config.is_peer_connectable(addr)
    }

    pub fn get_peer_conn_state(&self, addr: IpAddr) -> SessionState {
        self.inner.config.get_peer_conn_state(addr)
    }

    async fn context(&self, addr: IpAddr) -> Option<PeerContext> {
        self.inner
            .peers
            .lock()
            .await
            .get(&addr)
            .map(|slot| slot.context.clone())
    }

    /// Copy of everything learned from a peer
    pub async fn rib(&self, addr: IpAddr) -> Option<PeerRib> {
        Some(self.context(addr).await?.rib.snapshot())
    }

    pub async fn rib_entry(&self, addr: IpAddr, key: &NlriKey) -> Option<NlriAttributes> {
        self.context(addr)
            .await?
            .rib
            .read(|rib| rib.adj_rib_in.get(key).cloned())
    }

    pub async fn vpn_rib_entry(
        &self,
        addr: IpAddr,
        rd: &RouteDistinguisher,
        key: &NlriKey,
    ) -> Option<NlriAttributes> {
        self.context(addr)
            .await?
            .rib
            .read(|rib| rib.vpn_adj_rib_in.get_vpn(rd, key).cloned())
    }

    pub async fn packet_stats(&self, addr: IpAddr) -> Option<Arc<PacketStats>> {
        Some(Arc::clone(&self.context(addr).await?.stats))
    }

    pub async fn session_info(&self, addr: IpAddr) -> Option<SessionInfo> {
        self.context(addr).await?.session_info()
    }

    pub fn system_stats(&self) -> &SystemStats {
        &self.inner.system
    }
}

/// Tell a peer task to stop and wait for its teardown
async fn end_task(addr: IpAddr, task: RunningTask, reason: SessionError) {
    if task.commands.send(SessionCommand::Stop(reason)).is_err() {
        debug!("Session task for {} already ended", addr);
    }
    if let Err(err) = task.handle.await {
        warn!("Session task for {} failed: {}", addr, err);
    }
}

/// Refuse a connection with Cease/Connection Rejected
async fn reject(stream: TcpStream) {
    let notification = match SessionError::ConnectionRejected.notification() {
        Some(notification) => notification,
        None => return,
    };
    let mut protocol = Framed::new(stream, MessageCodec::new());
    if let Err(err) = protocol.send(Message::Notification(notification)).await {
        debug!("Couldn't send NOTIFICATION: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use bgp_rs::Update;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio::time::sleep;

    use crate::rib::parse::tests::node_nlri;
    use crate::rib::RibUpdate;
    use crate::session::decode::tests::{mp_reach, origin_igp, update_bytes};
    use crate::session::fsm::tests::peer_open;
    use crate::session::{
        IgnoreLinkState, Incoming, LinkStateUpdate, MessageProtocol, Rfc7752Decoder,
        BGP_LS_SAFI,
    };

    /// Decodes Link-State NLRI, panics on an UPDATE without any
    struct PanicOnEmpty;

    impl LinkStateDecoder for PanicOnEmpty {
        fn decode(&self, update: &LinkStateUpdate) -> Result<Vec<RibUpdate>, SessionError> {
            if update.reach.is_none() && update.unreach.is_none() {
                panic!("No Link-State NLRI");
            }
            Rfc7752Decoder.decode(update)
        }
    }

    fn speaker(router_id: [u8; 4], local_as: u32) -> Arc<BgpConfig> {
        let config = Arc::new(BgpConfig::default());
        config.set_local_as(local_as);
        config.set_router_id(Ipv4Addr::from(router_id));
        config
    }

    fn listen_on_loopback(config: &BgpConfig, port: u16) -> BgpConfig {
        let mut speaker = config.speaker();
        speaker.listen_addr = "127.0.0.1".parse().unwrap();
        speaker.listen_port = port;
        speaker.peer_port = port;
        BgpConfig::new(speaker)
    }

    async fn wait_for_state(manager: &SessionManager, addr: IpAddr, state: SessionState) {
        for _ in 0..100 {
            if manager.get_peer_conn_state(addr) == state {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "{} never reached {} (stuck in {})",
            addr,
            state,
            manager.get_peer_conn_state(addr)
        );
    }

    /// Passive speaker (AS 65000) expecting 127.0.0.1 in AS 65001
    async fn passive_manager(decoder: Arc<dyn LinkStateDecoder>) -> (SessionManager, SocketAddr) {
        let config = Arc::new(listen_on_loopback(&speaker([1, 1, 1, 1], 65000), 0));
        let manager = SessionManager::new(config, decoder);
        assert!(manager.add_peer(loopback(), 65001, None).await);
        let addr = manager.start().await.unwrap();
        (manager, addr)
    }

    fn loopback() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    /// Open a session to `addr` as AS 65001, advertising BGP-LS
    async fn dial(addr: SocketAddr) -> MessageProtocol<TcpStream> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Framed::new(stream, MessageCodec::new());
        let open = peer_open(65001, Ipv4Addr::new(2, 2, 2, 2), true);
        client.send(Message::Open(open)).await.unwrap();
        match client.next().await {
            Some(Ok(Incoming::Message(Message::Open(open)))) => assert_eq!(open.peer_asn, 65000),
            other => panic!("Unexpected {:?}", other),
        }
        match client.next().await {
            Some(Ok(Incoming::Message(Message::KeepAlive))) => (),
            other => panic!("Unexpected {:?}", other),
        }
        client.send(Message::KeepAlive).await.unwrap();
        client
    }

    async fn wait_for_rib_len(manager: &SessionManager, addr: IpAddr, len: usize) {
        for _ in 0..100 {
            if manager.rib(addr).await.map(|rib| rib.len()) == Some(len) {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("RIB for {} never held {} entries", addr, len);
    }

    #[tokio::test]
    async fn test_start_requires_ready() {
        let config = Arc::new(BgpConfig::default());
        config.set_local_as(65000);
        let manager = SessionManager::new(config, Arc::new(IgnoreLinkState));
        assert!(manager.start().await.is_err());
        assert!(!manager.connect_peer("127.0.0.1".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn test_reject_unknown_peer() {
        let config = Arc::new(listen_on_loopback(&speaker([1, 1, 1, 1], 65000), 0));
        let manager = SessionManager::new(config, Arc::new(IgnoreLinkState));
        let addr = manager.start().await.unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut protocol = Framed::new(stream, MessageCodec::new());
        match protocol.next().await {
            Some(Ok(Incoming::Message(Message::Notification(n)))) => {
                assert_eq!((n.major_err_code, n.minor_err_code), (6, 5));
            }
            other => panic!("Unexpected {:?}", other),
        }
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_peer_admin() {
        let config = Arc::new(listen_on_loopback(&speaker([1, 1, 1, 1], 65000), 0));
        let manager = SessionManager::new(config, Arc::new(IgnoreLinkState));
        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(manager.add_peer(peer, 65001, None).await);
        assert!(!manager.add_peer(peer, 65001, None).await);
        assert!(manager.is_peer_connectable(peer));
        assert_eq!(manager.rib(peer).await.map(|rib| rib.len()), Some(0));
        assert!(manager.session_info(peer).await.is_none());

        assert!(manager.disconnect_peer(peer).await);
        assert!(manager.remove_peer(peer).await);
        assert!(!manager.is_peer_configured(peer));
        assert_eq!(manager.get_peer_conn_state(peer), SessionState::Invalid);
        assert!(manager.rib(peer).await.is_none());
        assert!(!manager.remove_peer(peer).await);
        assert!(!manager.disconnect_peer(peer).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loopback_session() {
        // Reserve a port for the passive side
        let port = {
            let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
            reserved.local_addr().unwrap().port()
        };
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();

        // Both speakers are reached through 127.0.0.1
        let passive_config = Arc::new(listen_on_loopback(&speaker([2, 2, 2, 2], 65002), port));
        let passive = SessionManager::new(passive_config, Arc::new(IgnoreLinkState));
        passive.add_peer(loopback, 65001, Some(30)).await;
        passive.start().await.unwrap();

        let active_config = listen_on_loopback(&speaker([1, 1, 1, 1], 65001), port);
        let active_config = Arc::new(active_config);
        let active = SessionManager::new(active_config, Arc::new(IgnoreLinkState));
        active.add_peer(loopback, 65002, Some(90)).await;
        // Outbound only, the passive side owns the port
        assert!(active.connect_peer(loopback).await);

        wait_for_state(&active, loopback, SessionState::Established).await;
        wait_for_state(&passive, loopback, SessionState::Established).await;
        let mut info = None;
        for _ in 0..100 {
            info = active.session_info(loopback).await;
            if info.is_some() {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        let info = info.unwrap();
        assert_eq!(info.remote_as, 65002);
        assert_eq!(info.remote_id, Ipv4Addr::new(2, 2, 2, 2));
        assert_eq!(info.negotiated_hold_time, 30);
        assert!(info.ls_capability);
        assert!(active.packet_stats(loopback).await.unwrap().sent() >= 2);

        // Not connectable while a session is up
        assert!(!active.connect_peer(loopback).await);

        assert!(active.disconnect_peer(loopback).await);
        assert_eq!(active.get_peer_conn_state(loopback), SessionState::Idle);
        assert!(active.session_info(loopback).await.is_none());
        wait_for_state(&passive, loopback, SessionState::Idle).await;

        passive.stop().await;
        active.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_task_panic_resets_peer() {
        let (manager, addr) = passive_manager(Arc::new(PanicOnEmpty)).await;
        let peer = loopback();

        let mut client = dial(addr).await;
        wait_for_state(&manager, peer, SessionState::Established).await;
        let update = update_bytes(&[
            origin_igp(),
            mp_reach(BGP_LS_SAFI, &[10, 0, 0, 1], &node_nlri(1, None)),
        ]);
        client.get_mut().write_all(&update).await.unwrap();
        wait_for_rib_len(&manager, peer, 1).await;

        let empty = Update {
            withdrawn_routes: vec![],
            attributes: vec![],
            announced_routes: vec![],
        };
        client.send(Message::Update(empty)).await.unwrap();
        wait_for_state(&manager, peer, SessionState::Idle).await;
        assert!(manager.session_info(peer).await.is_none());
        wait_for_rib_len(&manager, peer, 0).await;

        // The next connection gets a fresh task
        drop(client);
        let _client = dial(addr).await;
        wait_for_state(&manager, peer, SessionState::Established).await;
        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_passive_peer_reconnects() {
        let (manager, addr) = passive_manager(Arc::new(IgnoreLinkState)).await;
        let peer = loopback();

        let client = dial(addr).await;
        wait_for_state(&manager, peer, SessionState::Established).await;
        drop(client);
        wait_for_state(&manager, peer, SessionState::Idle).await;

        // Handed to the task still waiting on the peer
        let _client = dial(addr).await;
        wait_for_state(&manager, peer, SessionState::Established).await;
        let info = manager.session_info(peer).await.unwrap();
        assert_eq!(info.remote_id, Ipv4Addr::new(2, 2, 2, 2));
        assert!(info.ls_capability);
        manager.stop().await;
    }
}
