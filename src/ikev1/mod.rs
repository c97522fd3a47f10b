use log::{debug, info, trace, warn};
use rand::Rng;
use std::{
    collections::HashMap,
    error, fmt,
    future::{self, Future},
    io,
    net::{IpAddr, SocketAddr},
    pin::pin,
    str::FromStr,
    sync::Arc,
    task::Poll,
    time::{Duration, Instant},
};
use tokio::{net::UdpSocket, runtime, signal, sync::mpsc, task::JoinSet, time};

use crate::logger::fmt_slice_hex;

mod control;
mod crypto;
mod fragment;
mod idmatch;
mod kernel;
mod message;
mod monitor;
mod proposal;
mod registry;
mod scheduler;
mod session;
#[cfg(test)]
mod testing;

pub use proposal::CheckLevel;

use fragment::{FragmentHeader, FragmentStatus, FRAGMENT_MAX_LENGTH};
use message::{ExchangeType, InputMessage, PayloadType, ISAKMP_HEADER_LENGTH};
use proposal::{IsakmpSa, Lifetimes, NegotiationError};
use registry::SessionRegistry;
use session::{IsakmpIndex, Phase1Handle, Phase1Id, SessionError, Side};

const MAX_DATAGRAM_SIZE: usize = 1500;
// A timer firing this late means the host was suspended.
const SLEEP_DETECT_THRESHOLD: Duration = Duration::from_secs(20);

/// Which traffic direction keeps a session from being idle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IdleDirection {
    Inbound,
    Outbound,
    Any,
}

impl FromStr for IdleDirection {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<IdleDirection, &'static str> {
        match s.to_lowercase().as_str() {
            "inbound" => Ok(IdleDirection::Inbound),
            "outbound" => Ok(IdleDirection::Outbound),
            "any" => Ok(IdleDirection::Any),
            _ => Err("Unsupported idle direction"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DpdAlgorithm {
    Default,
    InboundDetect,
    BlackholeDetect,
}

impl FromStr for DpdAlgorithm {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<DpdAlgorithm, &'static str> {
        match s.to_lowercase().as_str() {
            "default" => Ok(DpdAlgorithm::Default),
            "inbound-detect" => Ok(DpdAlgorithm::InboundDetect),
            "blackhole-detect" => Ok(DpdAlgorithm::BlackholeDetect),
            _ => Err("Unsupported DPD algorithm"),
        }
    }
}

impl FromStr for CheckLevel {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<CheckLevel, &'static str> {
        match s.to_lowercase().as_str() {
            "obey" => Ok(CheckLevel::Obey),
            "strict" => Ok(CheckLevel::Strict),
            "claim" => Ok(CheckLevel::Claim),
            "exact" => Ok(CheckLevel::Exact),
            _ => Err("Unsupported proposal check level"),
        }
    }
}

/// Policy applied to every remote peer.
#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub proposals: Vec<IsakmpSa>,
    pub check_level: CheckLevel,
    pub idle_timeout: u32,
    pub idle_direction: IdleDirection,
    pub dpd_interval: u32,
    pub dpd_algorithm: DpdAlgorithm,
    pub retry_counter: u32,
    pub verbose_proposals: bool,
    pub fragmentation: bool,
}

impl Default for RemoteConfig {
    fn default() -> RemoteConfig {
        RemoteConfig {
            proposals: vec![],
            check_level: CheckLevel::Strict,
            idle_timeout: 0,
            idle_direction: IdleDirection::Any,
            dpd_interval: 0,
            dpd_algorithm: DpdAlgorithm::Default,
            retry_counter: 5,
            verbose_proposals: false,
            fragmentation: true,
        }
    }
}

/// Parses a phase 1 proposal in the `<enc>[keylen]-<hash>-<dhgroup>-<auth>` form,
/// for example `aes256-sha256-modp2048-psk`.
pub fn parse_ike_proposal(value: &str, lifetime: u32) -> Result<IsakmpSa, &'static str> {
    use crypto::{AuthMethod, DhGroup, EncryptionAlgorithm, HashAlgorithm};

    let mut parts = value.split('-');
    let mut next = || parts.next().ok_or("Proposal is missing a component");
    let encryption = next()?;
    // Key length suffix, "3des" keeps its leading digit.
    let split_at = encryption
        .char_indices()
        .skip(1)
        .find(|(_, c)| c.is_ascii_digit())
        .map_or(encryption.len(), |(i, _)| i);
    let (encryption, key_length) = encryption.split_at(split_at);
    let (encryption, default_key_length) = match encryption.to_lowercase().as_str() {
        "des" => (EncryptionAlgorithm::Des, 0),
        "3des" => (EncryptionAlgorithm::TripleDes, 0),
        "blowfish" => (EncryptionAlgorithm::Blowfish, 0),
        "cast" => (EncryptionAlgorithm::Cast, 0),
        "aes" => (EncryptionAlgorithm::Aes, 128),
        "camellia" => (EncryptionAlgorithm::Camellia, 128),
        _ => return Err("Unsupported encryption algorithm"),
    };
    let key_length = if key_length.is_empty() {
        default_key_length
    } else {
        key_length
            .parse::<u16>()
            .map_err(|_| "Failed to parse key length")?
    };
    let hash = match next()?.to_lowercase().as_str() {
        "md5" => HashAlgorithm::Md5,
        "sha1" => HashAlgorithm::Sha1,
        "sha256" => HashAlgorithm::Sha256,
        "sha384" => HashAlgorithm::Sha384,
        "sha512" => HashAlgorithm::Sha512,
        _ => return Err("Unsupported hash algorithm"),
    };
    let dh_group = match next()?.to_lowercase().as_str() {
        "modp768" => DhGroup::Modp768,
        "modp1024" => DhGroup::Modp1024,
        "modp1536" => DhGroup::Modp1536,
        "modp2048" => DhGroup::Modp2048,
        "modp3072" => DhGroup::Modp3072,
        "modp4096" => DhGroup::Modp4096,
        "modp6144" => DhGroup::Modp6144,
        "modp8192" => DhGroup::Modp8192,
        _ => return Err("Unsupported DH group"),
    };
    let auth_method = match next()?.to_lowercase().as_str() {
        "psk" => AuthMethod::PreSharedKey,
        "rsasig" => AuthMethod::RsaSignature,
        "xauth-psk" => AuthMethod::XauthPskResponder,
        "hybrid-rsa" => AuthMethod::HybridRsaResponder,
        _ => return Err("Unsupported authentication method"),
    };
    Ok(IsakmpSa {
        prop_no: 1,
        trns_no: 1,
        encryption,
        key_length,
        hash,
        auth_method,
        dh_group,
        lifetimes: Lifetimes {
            seconds: lifetime,
            kilobytes: 0,
        },
    })
}

pub struct Config {
    pub port: u16,
    pub nat_port: u16,
    pub listen_ips: Vec<IpAddr>,
    pub remote: RemoteConfig,
}

pub struct Server {
    listen_ips: Vec<IpAddr>,
    port: u16,
    nat_port: u16,
    remote: Arc<RemoteConfig>,
}

impl Server {
    pub fn new(config: Config) -> Result<Server, IKEv1Error> {
        if config.remote.proposals.is_empty() {
            return Err("No phase 1 proposals configured".into());
        }
        Ok(Server {
            listen_ips: config.listen_ips,
            port: config.port,
            nat_port: config.nat_port,
            remote: Arc::new(config.remote),
        })
    }

    pub fn run(self) -> Result<(), IKEv1Error> {
        // The session registry is single-threaded.
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(self.serve())
    }

    async fn serve(self) -> Result<(), IKEv1Error> {
        let mut sockets = Sockets::new(&self.listen_ips, self.port, self.nat_port).await?;
        let mut responder = Responder::new(self.remote.clone(), sockets.create_sender());
        let mut shutdown = pin!(signal::ctrl_c());
        loop {
            let deadline = responder.registry.next_deadline();
            let (datagram, timer_fired, shutdown_requested) = {
                let mut receive_udp = pin!(sockets.receive_datagram());
                let mut timer = pin!(async move {
                    match deadline {
                        Some(deadline) => time::sleep_until(deadline.into()).await,
                        None => future::pending().await,
                    }
                });
                let mut shutdown = shutdown.as_mut();
                future::poll_fn(move |cx| {
                    let mut ready = false;
                    let received_udp = receive_udp.as_mut().poll(cx);
                    ready = ready || received_udp.is_ready();
                    let received_udp = match received_udp {
                        Poll::Ready(datagram) => Some(datagram),
                        Poll::Pending => None,
                    };
                    let timer_fired = timer.as_mut().poll(cx).is_ready();
                    ready = ready || timer_fired;
                    let shutdown_requested = match shutdown.as_mut().poll(cx) {
                        Poll::Ready(res) => Some(res),
                        Poll::Pending => None,
                    };
                    ready = ready || shutdown_requested.is_some();
                    if ready {
                        Poll::Ready((received_udp, timer_fired, shutdown_requested))
                    } else {
                        Poll::Pending
                    }
                })
                .await
            };
            if let Some(res) = shutdown_requested {
                if let Err(err) = res {
                    warn!("Failed to wait for shutdown signal: {}", err);
                }
                info!("Shutting down, flushing {} sessions", responder.registry.len());
                responder.registry.flush(Instant::now());
                break;
            }
            let now = Instant::now();
            if timer_fired {
                if let Some(deadline) = deadline {
                    if now.saturating_duration_since(deadline) > SLEEP_DETECT_THRESHOLD {
                        info!("Timers are late by {:?}, assuming a wake from sleep", now - deadline);
                        responder.registry.sweep_sleepwake(now);
                    }
                }
                let processed = responder.registry.process_timers(now);
                trace!("Processed {} timer events", processed);
            }
            match datagram {
                Some(Some(datagram)) => {
                    if let Err(err) = responder.process_datagram(&datagram, now).await {
                        warn!(
                            "Failed to process message from {}: {}",
                            datagram.remote_addr, err
                        );
                    }
                }
                Some(None) => {
                    warn!("Datagram channel closed");
                    return Err("Datagram channel closed".into());
                }
                None => {}
            }
        }
        sockets.shutdown().await
    }
}

/// Answers new phase 1 negotiations and routes fragments to their phase 1.
struct Responder {
    registry: SessionRegistry,
    config: Arc<RemoteConfig>,
    udp_sender: UdpSender,
}

impl Responder {
    fn new(config: Arc<RemoteConfig>, udp_sender: UdpSender) -> Responder {
        let registry = SessionRegistry::new(
            Box::new(kernel::LoggingKernel {}),
            Box::new(control::LoggingNotifier {}),
            Box::new(crypto::DigestIvDeriver {}),
        );
        Responder {
            registry,
            config,
            udp_sender,
        }
    }

    async fn process_datagram(
        &mut self,
        datagram: &UdpDatagram,
        now: Instant,
    ) -> Result<(), IKEv1Error> {
        let replies = self.handle_message(
            datagram.local_addr,
            datagram.remote_addr,
            &datagram.bytes,
            datagram.is_nat_port,
            now,
        )?;
        for reply in replies {
            let mut data = Vec::with_capacity(reply.len() + message::NON_ESP_MARKER_LENGTH);
            if datagram.is_nat_port {
                data.extend_from_slice(&[0u8; message::NON_ESP_MARKER_LENGTH]);
            }
            data.extend_from_slice(&reply);
            self.udp_sender
                .send_datagram(&datagram.local_addr, &datagram.remote_addr, &data)
                .await?;
        }
        Ok(())
    }

    fn handle_message(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        data: &[u8],
        is_nat: bool,
        now: Instant,
    ) -> Result<Vec<Vec<u8>>, IKEv1Error> {
        let message = InputMessage::from_datagram(data, is_nat)?;
        trace!("Received packet from {}\n{:?}", remote, message);
        let exchange = message.read_exchange_type()?;
        let index = IsakmpIndex {
            initiator_cookie: message.read_initiator_cookie(),
            responder_cookie: message.read_responder_cookie(),
        };

        if message.read_next_payload() == PayloadType::FRAGMENT {
            FragmentHeader::parse(message.raw_data())?;
            let existing = if index.responder_cookie == 0 {
                self.find_phase1_by_initiator(remote, index.initiator_cookie)
            } else {
                self.find_phase1(local, remote, &index)
            };
            let (phase1, created) = match existing {
                Some(phase1) => (phase1, false),
                None if index.responder_cookie == 0 && exchange.is_phase1() => (
                    self.start_phase1(local, remote, index.initiator_cookie, now)?,
                    true,
                ),
                None => {
                    debug!("Dropping fragment from {} for unknown ISAKMP-SA {}", remote, index);
                    return Ok(vec![]);
                }
            };
            let reassembled = match self.collect_fragment(phase1, message.raw_data()) {
                Ok(Some(reassembled)) => reassembled,
                Ok(None) => return Ok(vec![]),
                Err(err) => {
                    if created {
                        self.abandon_phase1(phase1, now)?;
                    }
                    return Err(err);
                }
            };
            return self.handle_message(local, remote, &reassembled, false, now);
        }

        if !exchange.is_phase1() {
            debug!(
                "{} exchange from {} for {} is handled by the exchange layer",
                exchange, remote, index
            );
            return Ok(vec![]);
        }
        if index.responder_cookie != 0 {
            match self.find_phase1(local, remote, &index) {
                Some(phase1) => {
                    let floated = self
                        .registry
                        .session(phase1.session)
                        .is_some_and(|session| session.ports_floated());
                    if is_nat && !floated {
                        if let Some(handle) = self.registry.phase1_mut(phase1) {
                            handle.local = local;
                            handle.remote = remote;
                        }
                        self.registry.float_ports(phase1)?;
                    }
                    debug!(
                        "{} message for ISAKMP-SA {} is handled by the exchange layer",
                        exchange, phase1
                    );
                }
                None => debug!("Unknown ISAKMP-SA {} from {}", index, remote),
            }
            return Ok(vec![]);
        }
        // The handle may already exist when its first message arrived in fragments.
        let existing = self.find_phase1_by_initiator(remote, index.initiator_cookie);
        if let Some(phase1) = existing {
            if self
                .registry
                .phase1(phase1)
                .is_some_and(|handle| handle.approval.is_some())
            {
                debug!("Retransmitted first message for {} from {}", index, remote);
                return Ok(vec![]);
            }
        }

        let sa_payload = match message.iter_payloads().next() {
            Some(Ok(payload)) if payload.payload_type() == PayloadType::SECURITY_ASSOCIATION => {
                payload.data()
            }
            Some(Err(err)) => return Err(err.into()),
            _ => {
                debug!("First {} message from {} has no SA payload", exchange, remote);
                return Ok(vec![]);
            }
        };
        let phase1 = match existing {
            Some(phase1) => phase1,
            None => self.start_phase1(local, remote, index.initiator_cookie, now)?,
        };
        let approval = match proposal::check_phase1_proposal(sa_payload, &self.config) {
            Ok(approval) => approval,
            Err(err) => {
                self.abandon_phase1(phase1, now)?;
                return Err(err.into());
            }
        };
        info!(
            "Approved ISAKMP-SA {} proposal {} from {}",
            phase1, approval.sa, remote
        );
        let handle = self
            .registry
            .phase1_mut(phase1)
            .ok_or(SessionError::UnknownPhase1(phase1))?;
        handle.approval = Some(approval.sa);
        let reply = build_sa_reply(&handle.index, exchange, &approval.sa_payload)?;
        if self.config.fragmentation && reply.len() > FRAGMENT_MAX_LENGTH {
            Ok(fragment::fragment_message(&reply, is_nat)?)
        } else {
            Ok(vec![reply])
        }
    }

    /// Adds a fragment to the chain of `phase1`, returning the message once every fragment arrived.
    fn collect_fragment(
        &mut self,
        phase1: Phase1Id,
        data: &[u8],
    ) -> Result<Option<Vec<u8>>, IKEv1Error> {
        let handle = self
            .registry
            .phase1_mut(phase1)
            .ok_or(SessionError::UnknownPhase1(phase1))?;
        if handle.fragments.extract(data)? == FragmentStatus::Incomplete {
            return Ok(None);
        }
        let reassembled = handle.fragments.reassemble()?;
        let reassembled_message = InputMessage::from_datagram(&reassembled, false)?;
        if reassembled_message.read_next_payload() == PayloadType::FRAGMENT {
            return Err("Reassembled message is a fragment".into());
        }
        Ok(Some(reassembled))
    }

    fn find_phase1(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        index: &IsakmpIndex,
    ) -> Option<Phase1Id> {
        let session = self.registry.lookup(local, remote, Some(index), false)?;
        let phase1 = self.registry.session(session)?.find_phase1_by_index(index)?;
        Some(Phase1Id {
            session,
            index: phase1,
        })
    }

    fn find_phase1_by_initiator(
        &self,
        remote: SocketAddr,
        initiator_cookie: u64,
    ) -> Option<Phase1Id> {
        self.registry
            .sessions()
            .filter(|session| session.key().remote.ip() == remote.ip())
            .find_map(|session| {
                session
                .phase1s()
                    .find(|(_, phase1)| phase1.index.initiator_cookie == initiator_cookie)
                    .map(|(index, _)| Phase1Id {
                        session: session.id(),
                        index,
                    })
            })
    }

    fn start_phase1(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        initiator_cookie: u64,
        now: Instant,
    ) -> Result<Phase1Id, IKEv1Error> {
        let session = self
            .registry
            .lookup(local, remote, None, true)
            .ok_or("Failed to create session")?;
        let mut responder_cookie = 0;
        while responder_cookie == 0 {
            responder_cookie = rand::thread_rng().gen::<u64>();
        }
        let index = IsakmpIndex {
            initiator_cookie,
            responder_cookie,
        };
        debug!(
            "Starting ISAKMP-SA {} with {}, responder cookie {}",
            index,
            remote,
            fmt_slice_hex(&responder_cookie.to_be_bytes())
        );
        let handle = Phase1Handle::new(Side::Responder, local, remote, index, self.config.clone());
        let phase1 = self.registry.link_phase1(session, handle, now)?;
        self.registry.start_negotiation_timer(phase1, now)?;
        Ok(phase1)
    }

    fn abandon_phase1(&mut self, phase1: Phase1Id, now: Instant) -> Result<(), IKEv1Error> {
        let only_phase1 = self
            .registry
            .session(phase1.session)
            .is_some_and(|session| session.phase1_indexes().len() == 1);
        if only_phase1 {
            self.registry.purge_phase1s_by_session(phase1.session, now)?;
        } else {
            self.registry.unlink_phase1(phase1, now)?;
        }
        Ok(())
    }
}

fn build_sa_reply(
    index: &IsakmpIndex,
    exchange: ExchangeType,
    sa_payload: &[u8],
) -> Result<Vec<u8>, IKEv1Error> {
    let payload_length = u16::try_from(message::GENERIC_HEADER_LENGTH + sa_payload.len())
        .map_err(|_| "SA payload is too long")?;
    let total_length = ISAKMP_HEADER_LENGTH + payload_length as usize;
    let mut reply = Vec::with_capacity(total_length);
    reply.extend_from_slice(&index.initiator_cookie.to_be_bytes());
    reply.extend_from_slice(&index.responder_cookie.to_be_bytes());
    reply.push(PayloadType::SECURITY_ASSOCIATION.to_u8());
    reply.push(0x10);
    reply.push(exchange.to_u8());
    reply.push(0);
    reply.extend_from_slice(&0u32.to_be_bytes());
    reply.extend_from_slice(&(total_length as u32).to_be_bytes());
    reply.push(PayloadType::NONE.to_u8());
    reply.push(0);
    reply.extend_from_slice(&payload_length.to_be_bytes());
    reply.extend_from_slice(sa_payload);
    Ok(reply)
}

struct Sockets {
    listen_rx: mpsc::Receiver<UdpDatagram>,
    send_tx: mpsc::Sender<SendUdpDatagram>,
    tasks: JoinSet<()>,
}

impl Sockets {
    async fn new(listen_ips: &[IpAddr], port: u16, nat_port: u16) -> Result<Sockets, IKEv1Error> {
        let mut sockets = HashMap::new();
        for listen_ip in listen_ips {
            for listen_port in [port, nat_port] {
                let socket = match UdpSocket::bind((*listen_ip, listen_port)).await {
                    Ok(socket) => socket,
                    Err(err) => {
                        log::error!("Failed to open listener on {}: {}", listen_ip, err);
                        return Err(err.into());
                    }
                };
                let listen_addr = socket.local_addr()?;
                info!("Started server on {}", listen_addr);
                sockets.insert(listen_addr, Arc::new(socket));
            }
        }
        let mut tasks = JoinSet::new();
        let (listen_tx, listen_rx) = mpsc::channel(16);
        sockets.iter().for_each(|(listen_addr, socket)| {
            tasks.spawn(Self::run_receiver(
                listen_tx.clone(),
                *listen_addr,
                socket.clone(),
                listen_addr.port() == nat_port,
            ));
        });
        let (send_tx, send_rx) = mpsc::channel(16);
        tasks.spawn(Self::run_sender(send_rx, sockets));
        Ok(Sockets {
            listen_rx,
            send_tx,
            tasks,
        })
    }

    async fn run_receiver(
        tx: mpsc::Sender<UdpDatagram>,
        listen_addr: SocketAddr,
        socket: Arc<UdpSocket>,
        is_nat_port: bool,
    ) {
        loop {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            let (bytes_res, remote_addr) = match socket.recv_from(&mut buf).await {
                Ok(res) => res,
                Err(err) => {
                    warn!("Failed to receive from socket {}: {}", listen_addr, err);
                    return;
                }
            };
            buf.truncate(bytes_res);
            let msg = UdpDatagram {
                remote_addr,
                local_addr: listen_addr,
                is_nat_port,
                bytes: buf,
            };
            if msg.is_keepalive() {
                trace!("NAT keepalive from {}", remote_addr);
                continue;
            }
            if tx.send(msg).await.is_err() {
                warn!("Channel closed for {}", listen_addr);
                return;
            }
        }
    }

    async fn run_sender(
        mut rx: mpsc::Receiver<SendUdpDatagram>,
        sockets: HashMap<SocketAddr, Arc<UdpSocket>>,
    ) {
        while let Some(datagram) = rx.recv().await {
            let socket = if let Some(socket) = sockets.get(&datagram.local_addr) {
                socket
            } else {
                warn!(
                    "No open sockets for source address {} (destination {})",
                    datagram.local_addr, datagram.remote_addr
                );
                continue;
            };
            if let Err(err) = socket.send_to(&datagram.bytes, datagram.remote_addr).await {
                warn!(
                    "Failed to send UDP message from {} to {}: {}",
                    datagram.local_addr, datagram.remote_addr, err
                );
            }
        }
    }

    async fn receive_datagram(&mut self) -> Option<UdpDatagram> {
        self.listen_rx.recv().await
    }

    fn create_sender(&self) -> UdpSender {
        UdpSender {
            tx: self.send_tx.clone(),
        }
    }

    async fn shutdown(&mut self) -> Result<(), IKEv1Error> {
        self.tasks.abort_all();
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Err(err) if !err.is_cancelled() => return Err(err.into()),
                _ => {}
            }
        }
        debug!("Shutdown completed");
        Ok(())
    }
}

struct UdpDatagram {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    is_nat_port: bool,
    bytes: Vec<u8>,
}

impl UdpDatagram {
    fn is_keepalive(&self) -> bool {
        self.is_nat_port && self.bytes == [0xff]
    }
}

#[derive(Clone)]
struct UdpSender {
    tx: mpsc::Sender<SendUdpDatagram>,
}

impl UdpSender {
    async fn send_datagram(
        &self,
        local_addr: &SocketAddr,
        remote_addr: &SocketAddr,
        data: &[u8],
    ) -> Result<(), IKEv1Error> {
        self.tx
            .send(SendUdpDatagram {
                local_addr: *local_addr,
                remote_addr: *remote_addr,
                bytes: data.to_vec(),
            })
            .await
            .map_err(|_| "UDP sender channel closed".into())
    }
}

struct SendUdpDatagram {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    bytes: Vec<u8>,
}

#[derive(Debug)]
pub enum IKEv1Error {
    Internal(&'static str),
    Format(message::FormatError),
    Negotiation(NegotiationError),
    Fragment(fragment::FragmentError),
    Session(SessionError),
    Join(tokio::task::JoinError),
    Io(io::Error),
}

impl fmt::Display for IKEv1Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Format(ref e) => write!(f, "Format error: {}", e),
            Self::Negotiation(ref e) => write!(f, "Negotiation error: {}", e),
            Self::Fragment(ref e) => write!(f, "Fragment error: {}", e),
            Self::Session(ref e) => write!(f, "IKEv1 session error: {}", e),
            Self::Join(ref e) => write!(f, "Tokio join error: {}", e),
            Self::Io(ref e) => write!(f, "IO error: {}", e),
        }
    }
}

impl error::Error for IKEv1Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::Internal(_msg) => None,
            Self::Format(ref err) => Some(err),
            Self::Negotiation(ref err) => Some(err),
            Self::Fragment(ref err) => Some(err),
            Self::Session(ref err) => Some(err),
            Self::Join(ref err) => Some(err),
            Self::Io(ref err) => Some(err),
        }
    }
}

impl From<&'static str> for IKEv1Error {
    fn from(msg: &'static str) -> IKEv1Error {
        Self::Internal(msg)
    }
}

impl From<message::FormatError> for IKEv1Error {
    fn from(err: message::FormatError) -> IKEv1Error {
        Self::Format(err)
    }
}

impl From<NegotiationError> for IKEv1Error {
    fn from(err: NegotiationError) -> IKEv1Error {
        Self::Negotiation(err)
    }
}

impl From<fragment::FragmentError> for IKEv1Error {
    fn from(err: fragment::FragmentError) -> IKEv1Error {
        Self::Fragment(err)
    }
}

impl From<SessionError> for IKEv1Error {
    fn from(err: SessionError) -> IKEv1Error {
        Self::Session(err)
    }
}

impl From<tokio::task::JoinError> for IKEv1Error {
    fn from(err: tokio::task::JoinError) -> IKEv1Error {
        Self::Join(err)
    }
}

impl From<io::Error> for IKEv1Error {
    fn from(err: io::Error) -> IKEv1Error {
        Self::Io(err)
    }
}
