use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};
use tokio_util::codec::Framed;

use super::poller::{connect, ConnectRetry};
use super::session::Collision;
use super::{
    CommandRx, Dispatcher, Fsm, MessageCodec, PeerContext, Session, SessionCommand,
    SessionParams, SessionState,
};
use crate::config::BgpConfig;

// Pause before re-opening a self-initiated session that dropped
const IDLE_HOLD_TIME: Duration = Duration::from_secs(5);

enum Connection {
    Outbound(TcpStream),
    Inbound(TcpStream),
    // Won a collision, OPEN already received
    Resumed(Collision),
    // Told to connect again
    Retry,
    Stopped,
}

/// Puts the peer back in Idle with nothing learned, however the task ends
///   Covers panics and aborted tasks, which skip the session teardown
struct ResetOnExit {
    addr: IpAddr,
    config: Arc<BgpConfig>,
    context: PeerContext,
}

impl Drop for ResetOnExit {
    fn drop(&mut self) {
        let flushed = self.context.rib.flush();
        self.context.set_session_info(None);
        self.config.set_peer_conn_state(self.addr, SessionState::Idle);
        if thread::panicking() {
            warn!(
                "Session task for {} panicked, flushed {} RIB entries",
                self.addr, flushed
            );
        } else {
            debug!("Session task for {} ended", self.addr);
        }
    }
}

/// Owns every session with one peer, from the first connection until an admin stop
///   Passive peers, and peers out of connect retries, wait for the next connection
pub(crate) struct PeerTask {
    addr: IpAddr,
    config: Arc<BgpConfig>,
    context: PeerContext,
    dispatcher: Dispatcher,
    commands: CommandRx,
}

impl PeerTask {
    pub(crate) fn new(
        addr: IpAddr,
        config: Arc<BgpConfig>,
        context: PeerContext,
        dispatcher: Dispatcher,
        commands: CommandRx,
    ) -> Self {
        Self {
            addr,
            config,
            context,
            dispatcher,
            commands,
        }
    }

    /// Run sessions until stopped, starting from an inbound connection if given
    pub(crate) async fn run(mut self, inbound: Option<TcpStream>) {
        let _reset = ResetOnExit {
            addr: self.addr,
            config: Arc::clone(&self.config),
            context: self.context.clone(),
        };
        let mut next = inbound.map(Connection::Inbound);
        loop {
            let params = match SessionParams::from_config(&self.config, self.addr) {
                Some(params) => params,
                None => {
                    debug!("{} is no longer configured, ending peer task", self.addr);
                    break;
                }
            };
            let mut fsm = Fsm::new(params, Arc::clone(&self.config));
            let connection = match next.take() {
                Some(connection) => connection,
                None if self.config.is_self_initiated(self.addr) => {
                    if let Err(err) = fsm.connect() {
                        warn!("Can't connect {}: {}", self.addr, err);
                        break;
                    }
                    self.establish(&mut fsm).await
                }
                None => self.wait_for_peer().await,
            };
            if let Err(err) = fsm.connect() {
                warn!("Can't start session with {}: {}", self.addr, err);
                break;
            }
            let session = match connection {
                Connection::Outbound(stream) => self.session(fsm, stream),
                Connection::Inbound(stream) => self.session(fsm, stream).initiated_by_peer(),
                Connection::Resumed(collision) => Session::resume(
                    fsm,
                    collision,
                    self.context.clone(),
                    self.dispatcher.clone(),
                ),
                Connection::Retry => continue,
                Connection::Stopped => break,
            };
            info!("New session started: {}", session);
            let end = session.serve(&mut self.commands).await;
            if let Some(collision) = end.replacement {
                next = Some(Connection::Resumed(collision));
                continue;
            }
            if end.reason.is_admin() {
                break;
            }
            if self.config.is_self_initiated(self.addr) {
                match self.idle_hold().await {
                    Some(connection) => next = Some(connection),
                    None => info!("Reconnecting to {}", self.addr),
                }
            }
        }
    }

    fn session(&self, fsm: Fsm, stream: TcpStream) -> Session<TcpStream> {
        Session::new(
            fsm,
            Framed::new(stream, MessageCodec::new()),
            self.context.clone(),
            self.dispatcher.clone(),
        )
    }

    /// Connect/Active loop for a self-initiated peer
    ///   An inbound connection handed over by the listener wins over our own attempt
    async fn establish(&mut self, fsm: &mut Fsm) -> Connection {
        let speaker = self.config.speaker();
        let peer_addr = SocketAddr::new(self.addr, speaker.peer_port);
        let mut retry = ConnectRetry::new(
            speaker.max_conn_retry_count,
            Duration::from_secs(speaker.max_conn_retry_time.into()),
            Instant::now(),
        );
        loop {
            tokio::select! {
                connected = connect(peer_addr, speaker.listen_addr) => match connected {
                    Ok(stream) => return Connection::Outbound(stream),
                    Err(err) => {
                        debug!("Connect to {} failed: {}", peer_addr, err);
                        fsm.connect_failed();
                    }
                },
                command = self.commands.recv() => {
                    if let Some(connection) = handle_command(fsm, command) {
                        return connection;
                    }
                    continue;
                }
            }

            let delay = match retry.next_delay(Instant::now()) {
                Some(delay) => delay,
                None => {
                    warn!(
                        "Giving up on {} after {} retries",
                        peer_addr,
                        retry.attempts()
                    );
                    fsm.stop();
                    return self.wait_for_peer().await;
                }
            };
            debug!("Retrying {} in {:?}", peer_addr, delay);
            tokio::select! {
                _ = sleep(delay) => {
                    if let Err(err) = fsm.connect() {
                        warn!("Can't reconnect {}: {}", self.addr, err);
                        return Connection::Stopped;
                    }
                },
                command = self.commands.recv() => {
                    if let Some(connection) = handle_command(fsm, command) {
                        return connection;
                    }
                    // Asked to connect now
                    if let Err(err) = fsm.connect() {
                        warn!("Can't reconnect {}: {}", self.addr, err);
                        return Connection::Stopped;
                    }
                }
            }
        }
    }

    /// Idle until the peer connects or the controller asks for a new attempt
    async fn wait_for_peer(&mut self) -> Connection {
        debug!("Waiting for {} to connect", self.addr);
        match self.commands.recv().await {
            Some(SessionCommand::Accept(stream)) => Connection::Inbound(stream),
            Some(SessionCommand::Connect) => Connection::Retry,
            Some(SessionCommand::Stop(reason)) => {
                debug!("Stopped while waiting: {}", reason);
                Connection::Stopped
            }
            None => Connection::Stopped,
        }
    }

    /// Wait before reconnecting; None when it's time to connect again
    async fn idle_hold(&mut self) -> Option<Connection> {
        tokio::select! {
            _ = sleep(IDLE_HOLD_TIME) => None,
            command = self.commands.recv() => match command {
                Some(SessionCommand::Accept(stream)) => Some(Connection::Inbound(stream)),
                Some(SessionCommand::Connect) => None,
                Some(SessionCommand::Stop(_)) | None => Some(Connection::Stopped),
            },
        }
    }
}

/// None keeps the connect attempt going
fn handle_command(fsm: &mut Fsm, command: Option<SessionCommand>) -> Option<Connection> {
    match command {
        Some(SessionCommand::Accept(stream)) => Some(Connection::Inbound(stream)),
        Some(SessionCommand::Connect) => None,
        Some(SessionCommand::Stop(reason)) => {
            debug!("Stopped while connecting: {}", reason);
            fsm.stop();
            Some(Connection::Stopped)
        }
        None => {
            fsm.stop();
            Some(Connection::Stopped)
        }
    }
}
