use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr};

use bgp_rs::{Message, Open};
use chrono::{DateTime, Utc};
use futures::future::pending;
use futures::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::codec::{Incoming, MessageProtocol};
use super::fsm::validate_open;
use super::{
    CommandRx, Dispatcher, Fsm, FsmResponse, HoldTimer, MessageCodec, PeerContext, SessionCommand,
    SessionError, SessionState,
};
use crate::utils::{format_time_as_elapsed, get_message_type};

/// Second connection from the peer that won collision resolution
///   Our OPEN was already sent on it and its OPEN already received
#[derive(Debug)]
pub(crate) struct Collision {
    pub(crate) protocol: MessageProtocol<TcpStream>,
    pub(crate) open: Open,
}

/// Why a session ended, and the connection that takes over if it lost a collision
#[derive(Debug)]
pub struct SessionEnd {
    pub reason: SessionError,
    pub(crate) replacement: Option<Collision>,
}

/// A `Session` is a stream for processing BGP messages and
/// handling peer timeouts
pub struct Session<T> {
    pub(crate) addr: IpAddr,
    pub(crate) fsm: Fsm,
    pub(crate) protocol: MessageProtocol<T>,
    pub(crate) connect_time: DateTime<Utc>,
    pub(crate) hold_timer: HoldTimer,
    context: PeerContext,
    dispatcher: Dispatcher,
    // Transport was opened by the peer
    inbound: bool,
    // Colliding connection from the peer, waiting on its OPEN
    candidate: Option<MessageProtocol<TcpStream>>,
    replacement: Option<Collision>,
    // OPEN already received while this connection was a collision candidate
    received_open: Option<Open>,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Build a session over a connected transport, FSM in Connect or Active
    pub fn new(
        fsm: Fsm,
        protocol: MessageProtocol<T>,
        context: PeerContext,
        dispatcher: Dispatcher,
    ) -> Self {
        let hold_time = fsm.params().hold_time;
        Session {
            addr: fsm.params().peer,
            fsm,
            protocol,
            connect_time: Utc::now(),
            hold_timer: HoldTimer::new(hold_time),
            context,
            dispatcher,
            inbound: false,
            candidate: None,
            replacement: None,
            received_open: None,
        }
    }

    /// Mark the transport as accepted from the peer
    pub fn initiated_by_peer(mut self) -> Self {
        self.inbound = true;
        self
    }

    pub fn state(&self) -> SessionState {
        self.fsm.state()
    }

    /// Drive the session until it ends, then tear it down
    pub async fn serve(mut self, commands: &mut CommandRx) -> SessionEnd {
        let reason = match self.open().await {
            Ok(()) => loop {
                if let Err(err) = self.run(commands).await {
                    break err;
                }
            },
            Err(err) => err,
        };
        self.teardown(&reason).await;
        SessionEnd {
            reason,
            replacement: self.replacement.take(),
        }
    }

    /// Send our OPEN: Connect -> OpenSent
    async fn open(&mut self) -> Result<(), SessionError> {
        match self.fsm.state() {
            SessionState::Active => self.fsm.connect()?,
            SessionState::Connect => (),
            _ => return Ok(()),
        }
        let open = self.fsm.tcp_established()?;
        match self.received_open.take() {
            // Sent before this connection won the collision
            Some(remote) => self.process_message(Message::Open(remote).into()).await,
            None => Ok(self.send_message(Message::Open(open)).await?),
        }
    }

    /// Main function for making progress with the session
    /// Waits for an incoming message, a HoldTimer event or a controller command
    pub async fn run(&mut self, commands: &mut CommandRx) -> Result<(), SessionError> {
        trace!("Hold time on {}: {}", self.addr, self.hold_timer);

        tokio::select! {
            message = self.protocol.next() => {
                match message {
                    // Framed stream is exhausted, remote side closed connection
                    None => Err(SessionError::TransportError(format!(
                        "Connection closed by {}",
                        self.addr
                    ))),
                    // Message received, update session and reply if required
                    Some(Ok(message)) => {
                        trace!("[{}] Incoming: {}", self.addr, message.message_type());
                        self.context.stats.increment_received();
                        self.hold_timer.received();
                        self.process_message(message).await
                    }
                    // Header or body failed to decode
                    Some(Err(err)) => Err(err),
                }
            },
            message = next_candidate(&mut self.candidate) => self.process_candidate(message).await,
            // Hold Timer
            keepalive = self.hold_timer.should_send_keepalive() => {
                let should_send = keepalive?;
                if should_send && self.accepts_keepalives() {
                    self.send_message(Message::KeepAlive).await?;
                }
                Ok(())
            },
            command = commands.recv() => {
                match command {
                    Some(SessionCommand::Stop(reason)) => Err(reason),
                    Some(SessionCommand::Accept(stream)) => {
                        self.accept_candidate(stream).await;
                        Ok(())
                    }
                    Some(SessionCommand::Connect) => {
                        debug!("Already connected to {} [{}]", self.addr, self.fsm.state());
                        Ok(())
                    }
                    None => Err(SessionError::AdminShutdown),
                }
            },
        }
    }

    fn accepts_keepalives(&self) -> bool {
        matches!(
            self.fsm.state(),
            SessionState::OpenConfirm | SessionState::Established
        )
    }

    async fn process_message(&mut self, message: Incoming) -> Result<(), SessionError> {
        let response = match self.fsm.receive(message) {
            Ok(response) => response,
            Err(err) => {
                if let SessionError::FiniteStateMachine(_) = err {
                    self.context.stats.increment_wrong();
                }
                return Err(err);
            }
        };
        match response {
            FsmResponse::Opened { reply, hold_time } => {
                self.hold_timer = HoldTimer::new(hold_time);
                self.send_message(reply).await?;
            }
            FsmResponse::Established => {
                self.context.set_session_info(self.fsm.info().cloned());
                if let Some(candidate) = self.candidate.take() {
                    debug!("Established with {}, closing colliding connection", self.addr);
                    close_candidate(candidate, SessionError::ConnectionCollision).await;
                }
            }
            FsmResponse::Update(update) => {
                let _permit = self
                    .dispatcher
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| SessionError::AdminShutdown)?;
                let changes = self.dispatcher.decoder.decode(&update)?;
                trace!("[{}] UPDATE -> {} RIB changes", self.addr, changes.len());
                self.context.rib.apply(changes);
            }
            FsmResponse::Empty => (),
        }
        Ok(())
    }

    /// Second connection from the peer (RFC 4271, Section 6.8)
    ///   Only a session still waiting on OPEN/KEEPALIVE can collide,
    ///   otherwise the new connection is closed with a Cease
    async fn accept_candidate(&mut self, stream: TcpStream) {
        let remote = stream.peer_addr().ok();
        let mut candidate = Framed::new(stream, MessageCodec::new());
        let waiting = matches!(
            self.fsm.state(),
            SessionState::OpenSent | SessionState::OpenConfirm
        );
        if !waiting || self.candidate.is_some() {
            debug!(
                "Closing duplicate connection from {:?} [{}]",
                remote,
                self.fsm.state(),
            );
            close_candidate(candidate, SessionError::ConnectionCollision).await;
            return;
        }
        debug!("Connection collision with {:?}, sending OPEN", remote);
        match candidate
            .send(Message::Open(self.fsm.create_open()))
            .await
        {
            Ok(()) => self.candidate = Some(candidate),
            Err(err) => debug!("Couldn't send OPEN to {:?}: {}", remote, err),
        }
    }

    /// Resolve a collision once the candidate's OPEN arrives
    ///   The connection opened by the speaker with the higher BGP Identifier is kept
    async fn process_candidate(
        &mut self,
        message: Option<Result<Incoming, SessionError>>,
    ) -> Result<(), SessionError> {
        let candidate = match self.candidate.take() {
            Some(candidate) => candidate,
            None => return Ok(()),
        };
        let open = match message {
            Some(Ok(Incoming::Message(Message::Open(open)))) => open,
            Some(Ok(other)) => {
                debug!("Expected OPEN on colliding connection, got {}", other.message_type());
                close_candidate(candidate, SessionError::FiniteStateMachine(1)).await;
                return Ok(());
            }
            Some(Err(err)) => {
                close_candidate(candidate, err).await;
                return Ok(());
            }
            None => {
                debug!("Colliding connection from {} closed", self.addr);
                return Ok(());
            }
        };
        self.context.stats.increment_received();
        if let Err(err) = validate_open(self.fsm.params(), &open) {
            close_candidate(candidate, err).await;
            return Ok(());
        }
        let local_id = self.fsm.params().router_id;
        let remote_id = Ipv4Addr::from(open.identifier);
        if !self.inbound && local_id < remote_id {
            info!(
                "Collision with {}: keeping the connection opened by {}",
                self.addr, remote_id
            );
            self.replacement = Some(Collision {
                protocol: candidate,
                open,
            });
            return Err(SessionError::ConnectionCollision);
        }
        info!(
            "Collision with {}: keeping the existing connection [{}]",
            self.addr,
            self.fsm.state()
        );
        close_candidate(candidate, SessionError::ConnectionCollision).await;
        Ok(())
    }

    // Send a message, and flush the send buffer afterwards
    pub async fn send_message(&mut self, message: Message) -> Result<(), io::Error> {
        let message_type = get_message_type(&message);
        trace!("[{}] Outgoing: {}", self.addr, message_type);
        self.protocol.send(message).await?;
        self.context.stats.increment_sent();
        self.hold_timer.sent();
        Ok(())
    }

    /// Notify the peer (best effort), clear learned state and return to Idle
    async fn teardown(&mut self, reason: &SessionError) {
        if let Some(notification) = reason.notification() {
            if let Err(err) = self.send_message(Message::Notification(notification)).await {
                debug!("Couldn't send NOTIFICATION to {}: {}", self.addr, err);
            }
        }
        if let Some(candidate) = self.candidate.take() {
            close_candidate(candidate, SessionError::ConnectionCollision).await;
        }
        let flushed = self.context.rib.flush();
        self.context.set_session_info(None);
        self.fsm.stop();
        match reason {
            SessionError::ConnectionCollision => {
                info!("Session replaced with {}: {}", self.addr, reason)
            }
            reason if reason.is_admin() => info!("Session ended with {}: {}", self.addr, reason),
            reason => warn!("Session ended with {}: {}", self.addr, reason),
        }
        debug!("Flushed {} RIB entries for {}", flushed, self.addr);
    }
}

impl Session<TcpStream> {
    /// Continue on the connection that won a collision, FSM in Connect
    pub(crate) fn resume(
        fsm: Fsm,
        collision: Collision,
        context: PeerContext,
        dispatcher: Dispatcher,
    ) -> Self {
        let mut session =
            Session::new(fsm, collision.protocol, context, dispatcher).initiated_by_peer();
        session.received_open = Some(collision.open);
        session
    }
}

/// Next message on the colliding connection, if there is one
async fn next_candidate(
    candidate: &mut Option<MessageProtocol<TcpStream>>,
) -> Option<Result<Incoming, SessionError>> {
    match candidate {
        Some(protocol) => protocol.next().await,
        None => pending().await,
    }
}

async fn close_candidate(mut candidate: MessageProtocol<TcpStream>, reason: SessionError) {
    if let Some(notification) = reason.notification() {
        if let Err(err) = candidate.send(Message::Notification(notification)).await {
            debug!("Couldn't send NOTIFICATION on colliding connection: {}", err);
        }
    }
}

impl<T> fmt::Display for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Session {} state={} uptime={} hold_time={}>",
            self.addr,
            self.fsm.state(),
            format_time_as_elapsed(self.connect_time),
            self.hold_timer,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::Arc;

    use bgp_rs::{Notification, Update};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use crate::config::BgpConfig;
    use crate::rib::parse::tests::{node_nlri, prefix_nlri};
    use crate::rib::tests::{node_key, prefix_key};
    use crate::rib::{NlriKind, RouteDistinguisher};
    use crate::session::decode::tests::{
        ls_attribute, mp_reach, mp_unreach, origin_igp, update_bytes,
    };
    use crate::session::fsm::tests::{params, peer_open};
    use crate::session::{
        IgnoreLinkState, LinkStateDecoder, Rfc7752Decoder, SessionParams, BGP_LS_SAFI,
        BGP_LS_VPN_SAFI,
    };

    struct Harness {
        config: Arc<BgpConfig>,
        context: PeerContext,
        session: Session<DuplexStream>,
        // The "remote" speaker
        remote: MessageProtocol<DuplexStream>,
    }

    fn harness(params: SessionParams, decoder: Arc<dyn LinkStateDecoder>) -> Harness {
        let config = Arc::new(BgpConfig::default());
        config.set_local_as(params.local_as);
        config.set_router_id(params.router_id);
        config.add_peer(params.peer, params.remote_as, Some(params.hold_time));
        let mut fsm = Fsm::new(params, Arc::clone(&config));
        fsm.connect().unwrap();

        let (local, remote) = duplex(4096);
        let context = PeerContext::new();
        let session = Session::new(
            fsm,
            Framed::new(local, MessageCodec::new()),
            context.clone(),
            Dispatcher::new(decoder, 2),
        );
        Harness {
            config,
            context,
            session,
            remote: Framed::new(remote, MessageCodec::new()),
        }
    }

    fn remote_open(asn: u32) -> Message {
        Message::Open(peer_open(asn, Ipv4Addr::new(2, 2, 2, 2), false))
    }

    fn empty_update() -> Message {
        Message::Update(Update {
            withdrawn_routes: vec![],
            attributes: vec![],
            announced_routes: vec![],
        })
    }

    fn cease() -> Message {
        Message::Notification(Notification {
            major_err_code: 6,
            minor_err_code: 4,
            data: vec![],
        })
    }

    async fn expect<S>(remote: &mut MessageProtocol<S>) -> Message
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match remote.next().await.unwrap().unwrap() {
            Incoming::Message(message) => message,
            Incoming::Update(update) => Message::Update(update.update),
        }
    }

    async fn expect_notification<S>(remote: &mut MessageProtocol<S>) -> (u8, u8)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match expect(remote).await {
            Message::Notification(n) => (n.major_err_code, n.minor_err_code),
            other => panic!("Unexpected {:?}", other),
        }
    }

    /// Run until one more message is processed (hold timer ticks may come first)
    async fn receive_one<S>(session: &mut Session<S>, commands: &mut CommandRx)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let before = session.context.stats.received();
        while session.context.stats.received() == before {
            session.run(commands).await.unwrap();
        }
    }

    /// Keep the session running until `until` completes
    async fn drive<S, F>(session: &mut Session<S>, commands: &mut CommandRx, until: F) -> F::Output
    where
        S: AsyncRead + AsyncWrite + Unpin,
        F: Future,
    {
        tokio::pin!(until);
        loop {
            tokio::select! {
                output = &mut until => return output,
                result = session.run(commands) => result.unwrap(),
            }
        }
    }

    /// OPEN/KEEPALIVE exchange from OpenSent up to Established
    async fn finish_establish<S>(
        session: &mut Session<S>,
        remote: &mut MessageProtocol<S>,
        commands: &mut CommandRx,
        open: Message,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        remote.send(open).await.unwrap();
        receive_one(session, commands).await;
        assert!(matches!(expect(remote).await, Message::KeepAlive));
        assert_eq!(session.state(), SessionState::OpenConfirm);

        remote.send(Message::KeepAlive).await.unwrap();
        receive_one(session, commands).await;
        assert_eq!(session.state(), SessionState::Established);
    }

    async fn establish(
        session: &mut Session<DuplexStream>,
        remote: &mut MessageProtocol<DuplexStream>,
        commands: &mut CommandRx,
    ) {
        session.open().await.unwrap();
        assert!(matches!(expect(remote).await, Message::Open(_)));
        assert_eq!(session.state(), SessionState::OpenSent);
        finish_establish(session, remote, commands, remote_open(65001)).await;
    }

    /// A second TCP connection from the peer: (listener side, peer side)
    async fn colliding_connection() -> (TcpStream, MessageProtocol<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let peer_side = Framed::new(client.unwrap(), MessageCodec::new());
        (accepted.unwrap().0, peer_side)
    }

    #[tokio::test]
    async fn test_establish_and_learn() {
        let rd = RouteDistinguisher::from_asn(65000, 1);
        let Harness {
            config,
            context,
            mut session,
            mut remote,
        } = harness(params(65001), Arc::new(Rfc7752Decoder));
        let peer = session.addr;
        let (_commands_tx, mut commands) = mpsc::unbounded_channel();

        establish(&mut session, &mut remote, &mut commands).await;
        assert_eq!(config.get_peer_conn_state(peer), SessionState::Established);
        assert_eq!(context.session_info().unwrap().remote_as, 65001);

        // Written raw, bgp-rs can't encode Link-State NLRI
        let nlri = [node_nlri(1, None), prefix_nlri("10.0.0.0/24", None)].concat();
        let advertise = update_bytes(&[
            origin_igp(),
            mp_reach(BGP_LS_SAFI, &[10, 0, 0, 1], &nlri),
            ls_attribute("r1"),
        ]);
        let vpn = update_bytes(&[
            origin_igp(),
            mp_reach(BGP_LS_VPN_SAFI, &[10, 0, 0, 1], &node_nlri(2, Some(&rd))),
        ]);
        let withdraw = update_bytes(&[mp_unreach(
            BGP_LS_SAFI,
            &prefix_nlri("10.0.0.0/24", None),
        )]);
        for update in [advertise, vpn].iter() {
            remote.get_mut().write_all(update).await.unwrap();
            receive_one(&mut session, &mut commands).await;
        }
        context.rib.read(|rib| {
            assert_eq!(rib.adj_rib_in.len(NlriKind::Node), 1);
            let prefix = rib.adj_rib_in.get(&prefix_key("10.0.0.0/24")).unwrap();
            assert!(prefix.path_attributes.link_state.ends_with(b"r1"));
            assert!(rib.vpn_adj_rib_in.get_vpn(&rd, &node_key(2)).is_some());
            assert!(rib.vpn_adj_rib_in.get_aggregate(&node_key(2)).is_some());
        });
        remote.get_mut().write_all(&withdraw).await.unwrap();
        receive_one(&mut session, &mut commands).await;
        context.rib.read(|rib| {
            assert!(rib.adj_rib_in.get(&node_key(1)).is_some());
            assert_eq!(rib.adj_rib_in.len(NlriKind::Prefix), 0);
        });
        assert_eq!(context.stats.received(), 5);

        remote.send(cease()).await.unwrap();
        match session.serve(&mut commands).await.reason {
            SessionError::NotificationReceived(n) => assert_eq!(n.major_err_code, 6),
            other => panic!("Unexpected {:?}", other),
        }
        assert!(context.rib.read(|rib| rib.is_empty()));
        assert!(context.session_info().is_none());
        assert_eq!(config.get_peer_conn_state(peer), SessionState::Idle);
        // Counters survive the session
        assert_eq!(context.stats.received(), 6);
    }

    #[tokio::test]
    async fn test_malformed_link_state_nlri() {
        let Harness {
            context,
            mut session,
            mut remote,
            ..
        } = harness(params(65001), Arc::new(Rfc7752Decoder));
        let (_commands_tx, mut commands) = mpsc::unbounded_channel();
        establish(&mut session, &mut remote, &mut commands).await;

        let nlri = node_nlri(1, None);
        let truncated = update_bytes(&[mp_reach(BGP_LS_SAFI, &[], &nlri[..nlri.len() - 3])]);
        remote.get_mut().write_all(&truncated).await.unwrap();
        match session.serve(&mut commands).await.reason {
            SessionError::MalformedUpdate(9, _) => (),
            other => panic!("Unexpected {:?}", other),
        }
        assert_eq!(expect_notification(&mut remote).await, (3, 9));
        assert!(context.rib.read(|rib| rib.is_empty()));
    }

    #[tokio::test]
    async fn test_admin_stop() {
        let Harness {
            config,
            context,
            mut session,
            mut remote,
        } = harness(params(65001), Arc::new(IgnoreLinkState));
        let peer = session.addr;
        let (commands_tx, mut commands) = mpsc::unbounded_channel();
        establish(&mut session, &mut remote, &mut commands).await;

        commands_tx
            .send(SessionCommand::Stop(SessionError::AdminShutdown))
            .unwrap();
        let end = session.serve(&mut commands).await;
        assert!(end.reason.is_admin());
        assert!(end.replacement.is_none());
        assert_eq!(expect_notification(&mut remote).await, (6, 2));
        assert!(context.session_info().is_none());
        assert_eq!(config.get_peer_conn_state(peer), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_bad_open() {
        let Harness {
            config,
            context,
            session,
            mut remote,
        } = harness(params(65001), Arc::new(IgnoreLinkState));
        let peer = session.addr;
        let (_commands_tx, mut commands) = mpsc::unbounded_channel();

        remote.send(remote_open(65099)).await.unwrap();
        match session.serve(&mut commands).await.reason {
            SessionError::OpenAsnMismatch(65099, 65001) => (),
            other => panic!("Unexpected {:?}", other),
        }
        assert!(matches!(expect(&mut remote).await, Message::Open(_)));
        assert_eq!(expect_notification(&mut remote).await, (2, 2));
        assert_eq!(config.get_peer_conn_state(peer), SessionState::Idle);
        assert_eq!(context.stats.wrong(), 0);
    }

    #[tokio::test]
    async fn test_wrong_message_in_open_sent() {
        let Harness {
            context,
            session,
            mut remote,
            ..
        } = harness(params(65001), Arc::new(IgnoreLinkState));
        let (_commands_tx, mut commands) = mpsc::unbounded_channel();

        remote.send(empty_update()).await.unwrap();
        match session.serve(&mut commands).await.reason {
            SessionError::FiniteStateMachine(1) => (),
            other => panic!("Unexpected {:?}", other),
        }
        assert_eq!(context.stats.wrong(), 1);
        assert!(matches!(expect(&mut remote).await, Message::Open(_)));
        assert_eq!(expect_notification(&mut remote).await, (5, 1));
    }

    #[tokio::test]
    async fn test_bad_message_length() {
        let Harness {
            mut session,
            mut remote,
            ..
        } = harness(params(65001), Arc::new(IgnoreLinkState));
        let (_commands_tx, mut commands) = mpsc::unbounded_channel();
        establish(&mut session, &mut remote, &mut commands).await;

        // KEEPALIVE claiming 20 bytes
        let mut keepalive = vec![0xff; 16];
        keepalive.extend_from_slice(&[0, 20, 4, 0]);
        remote.get_mut().write_all(&keepalive).await.unwrap();
        match session.serve(&mut commands).await.reason {
            SessionError::MessageHeader(2, data) => assert_eq!(data, vec![0, 20]),
            other => panic!("Unexpected {:?}", other),
        }
        match expect(&mut remote).await {
            Message::Notification(n) => {
                assert_eq!((n.major_err_code, n.minor_err_code), (1, 2));
                assert_eq!(n.data, vec![0, 20]);
            }
            other => panic!("Unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hold_time_expired() {
        let mut short_hold = params(65001);
        short_hold.hold_time = 3;
        let Harness {
            config,
            context,
            mut session,
            mut remote,
        } = harness(short_hold, Arc::new(Rfc7752Decoder));
        let peer = session.addr;
        let (_commands_tx, mut commands) = mpsc::unbounded_channel();
        establish(&mut session, &mut remote, &mut commands).await;
        assert_eq!(context.session_info().unwrap().negotiated_hold_time, 3);

        let advertise = update_bytes(&[mp_reach(BGP_LS_SAFI, &[], &node_nlri(1, None))]);
        remote.get_mut().write_all(&advertise).await.unwrap();
        receive_one(&mut session, &mut commands).await;
        assert_eq!(context.rib.read(|rib| rib.len()), 1);

        // Remote goes quiet
        match session.serve(&mut commands).await.reason {
            SessionError::HoldTimeExpired(3) => (),
            other => panic!("Unexpected {:?}", other),
        }
        let notification = loop {
            match expect(&mut remote).await {
                Message::KeepAlive => continue,
                Message::Notification(n) => break n,
                other => panic!("Unexpected {:?}", other),
            }
        };
        assert_eq!(
            (notification.major_err_code, notification.minor_err_code),
            (4, 0)
        );
        assert!(context.rib.read(|rib| rib.is_empty()));
        assert!(context.session_info().is_none());
        assert_eq!(config.get_peer_conn_state(peer), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_remote_close() {
        let Harness {
            config,
            session,
            remote,
            ..
        } = harness(params(65001), Arc::new(IgnoreLinkState));
        let peer = session.addr;
        let (_commands_tx, mut commands) = mpsc::unbounded_channel();
        drop(remote);
        match session.serve(&mut commands).await.reason {
            SessionError::TransportError(_) => (),
            other => panic!("Unexpected {:?}", other),
        }
        assert_eq!(config.get_peer_conn_state(peer), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_collision_higher_remote_id() {
        let Harness {
            config,
            context,
            mut session,
            mut remote,
        } = harness(params(65001), Arc::new(IgnoreLinkState));
        let peer = session.addr;
        let (commands_tx, mut commands) = mpsc::unbounded_channel();
        session.open().await.unwrap();
        assert!(matches!(expect(&mut remote).await, Message::Open(_)));

        let (accepted, mut peer_side) = colliding_connection().await;
        commands_tx.send(SessionCommand::Accept(accepted)).unwrap();
        let open = drive(&mut session, &mut commands, expect(&mut peer_side)).await;
        assert!(matches!(open, Message::Open(_)));

        // 2.2.2.2 > 1.1.1.1: the peer's connection replaces ours
        peer_side.send(remote_open(65001)).await.unwrap();
        let end = session.serve(&mut commands).await;
        assert!(matches!(end.reason, SessionError::ConnectionCollision));
        assert_eq!(expect_notification(&mut remote).await, (6, 7));
        let collision = end.replacement.unwrap();
        assert_eq!(config.get_peer_conn_state(peer), SessionState::Idle);

        let mut fsm = Fsm::new(params(65001), Arc::clone(&config));
        fsm.connect().unwrap();
        let dispatcher = Dispatcher::new(Arc::new(IgnoreLinkState), 1);
        let mut resumed = Session::resume(fsm, collision, context.clone(), dispatcher);
        resumed.open().await.unwrap();
        // OPEN was already exchanged, only the KEEPALIVE is left
        assert!(matches!(expect(&mut peer_side).await, Message::KeepAlive));
        assert_eq!(resumed.state(), SessionState::OpenConfirm);
        peer_side.send(Message::KeepAlive).await.unwrap();
        receive_one(&mut resumed, &mut commands).await;
        assert_eq!(config.get_peer_conn_state(peer), SessionState::Established);
        assert_eq!(
            context.session_info().unwrap().remote_id,
            Ipv4Addr::new(2, 2, 2, 2)
        );
    }

    #[tokio::test]
    async fn test_collision_keeps_existing() {
        let Harness {
            mut session,
            mut remote,
            ..
        } = harness(params(65001), Arc::new(IgnoreLinkState));
        let (commands_tx, mut commands) = mpsc::unbounded_channel();
        session.open().await.unwrap();
        assert!(matches!(expect(&mut remote).await, Message::Open(_)));

        let (accepted, mut peer_side) = colliding_connection().await;
        commands_tx.send(SessionCommand::Accept(accepted)).unwrap();
        drive(&mut session, &mut commands, expect(&mut peer_side)).await;

        // 1.0.0.1 < 1.1.1.1: our own connection wins
        let low_id = peer_open(65001, Ipv4Addr::new(1, 0, 0, 1), false);
        peer_side.send(Message::Open(low_id.clone())).await.unwrap();
        let code = drive(&mut session, &mut commands, expect_notification(&mut peer_side)).await;
        assert_eq!(code, (6, 7));
        assert!(session.candidate.is_none());
        assert_eq!(session.state(), SessionState::OpenSent);
        finish_establish(&mut session, &mut remote, &mut commands, Message::Open(low_id)).await;
    }

    #[tokio::test]
    async fn test_collision_with_inbound_session() {
        let Harness {
            mut session,
            mut remote,
            ..
        } = harness(params(65001), Arc::new(IgnoreLinkState));
        session = session.initiated_by_peer();
        let (commands_tx, mut commands) = mpsc::unbounded_channel();
        session.open().await.unwrap();
        assert!(matches!(expect(&mut remote).await, Message::Open(_)));

        // Both connections came from the peer, the first one stays
        let (accepted, mut peer_side) = colliding_connection().await;
        commands_tx.send(SessionCommand::Accept(accepted)).unwrap();
        drive(&mut session, &mut commands, expect(&mut peer_side)).await;
        peer_side.send(remote_open(65001)).await.unwrap();
        let code = drive(&mut session, &mut commands, expect_notification(&mut peer_side)).await;
        assert_eq!(code, (6, 7));
        assert_eq!(session.state(), SessionState::OpenSent);
    }

    #[tokio::test]
    async fn test_connection_while_established() {
        let Harness {
            mut session,
            mut remote,
            ..
        } = harness(params(65001), Arc::new(IgnoreLinkState));
        let (commands_tx, mut commands) = mpsc::unbounded_channel();
        establish(&mut session, &mut remote, &mut commands).await;

        let (accepted, mut peer_side) = colliding_connection().await;
        commands_tx.send(SessionCommand::Accept(accepted)).unwrap();
        let code = drive(&mut session, &mut commands, expect_notification(&mut peer_side)).await;
        assert_eq!(code, (6, 7));
        assert_eq!(session.state(), SessionState::Established);
    }
}
