use std::{
    collections::BTreeMap,
    error, fmt,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use log::debug;

use super::fragment::FragmentReassembler;
use super::kernel::{KernelError, SaStats};
use super::proposal::{IsakmpSa, SaProposal};
use super::scheduler::TimerHandle;
use super::{IdleDirection, RemoteConfig};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SessionId(u64);

impl SessionId {
    pub fn from_u64(id: u64) -> SessionId {
        SessionId(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Phase1Id {
    pub session: SessionId,
    pub index: u64,
}

impl fmt::Display for Phase1Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/ph1-{}", self.session, self.index)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Phase2Id {
    pub session: SessionId,
    pub index: u64,
}

impl fmt::Display for Phase2Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/ph2-{}", self.session, self.index)
    }
}

/// Address pair identifying a session, including ports.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SessionKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl SessionKey {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> SessionKey {
        SessionKey { local, remote }
    }

    pub fn with_ports(&self, local_port: u16, remote_port: u16) -> SessionKey {
        let mut key = *self;
        key.local.set_port(local_port);
        key.remote.set_port(remote_port);
        key
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.local, self.remote)
    }
}

/// ISAKMP cookie pair, the SPI of a phase 1.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct IsakmpIndex {
    pub initiator_cookie: u64,
    pub responder_cookie: u64,
}

impl fmt::Display for IsakmpIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}:{:016x}",
            self.initiator_cookie, self.responder_cookie
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Side {
    Initiator,
    Responder,
}

// Ordered by maturity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Phase1State {
    Negotiating,
    Established,
    Expired,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Phase2State {
    Negotiating,
    Established,
    Expired,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase2Kind {
    SecurityAssociation,
    Informational,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopReason {
    VpnDisconnect,
    ControllerCommLost,
    Flush,
    Idle,
    XauthTimeout,
    SleepWake,
    Assert,
    Peer,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::VpnDisconnect => write!(f, "Stopped by VPN disconnect"),
            StopReason::ControllerCommLost => write!(f, "Stopped by loss of controller comm"),
            StopReason::Flush => write!(f, "Stopped by flush"),
            StopReason::Idle => write!(f, "Stopped by idle"),
            StopReason::XauthTimeout => write!(f, "Stopped by XAUTH timeout"),
            StopReason::SleepWake => write!(f, "Stopped by sleep-wake"),
            StopReason::Assert => write!(f, "Stopped by assert"),
            StopReason::Peer => write!(f, "Stopped by peer"),
        }
    }
}

/// Kind of VPN carried by the session, derived from its phase 1 and phase 2 SAs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionMode {
    Unknown,
    // Back to My Mac style tunnels, no transport mode at all.
    PureTunnel,
    // L2TP over IPsec.
    Transport,
    // Started through the controller API.
    CiscoIpsec,
}

/// Local phase 2 policy selected for a pair of identities.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaInfo {
    pub name: String,
    pub bundles: Vec<SaProposal>,
}

pub struct Phase1Handle {
    pub side: Side,
    pub state: Phase1State,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub index: IsakmpIndex,
    pub started_by_api: bool,
    pub is_rekey: bool,
    pub is_dying: bool,
    pub natt_version: Option<u8>,
    pub approval: Option<IsakmpSa>,
    pub config: Arc<RemoteConfig>,
    pub retry_counter: u32,
    pub last_iv: Vec<u8>,
    pub fragments: FragmentReassembler,
    pub(super) cleanup_timer: Option<TimerHandle>,
    pub(super) rekey_timer: Option<TimerHandle>,
}

impl Phase1Handle {
    pub fn new(
        side: Side,
        local: SocketAddr,
        remote: SocketAddr,
        index: IsakmpIndex,
        config: Arc<RemoteConfig>,
    ) -> Phase1Handle {
        let retry_counter = config.retry_counter;
        Phase1Handle {
            side,
            state: Phase1State::Negotiating,
            local,
            remote,
            index,
            started_by_api: false,
            is_rekey: false,
            is_dying: false,
            natt_version: None,
            approval: None,
            config,
            retry_counter,
            last_iv: vec![],
            fragments: FragmentReassembler::new(),
            cleanup_timer: None,
            rekey_timer: None,
        }
    }

    pub fn has_pending_rekey(&self) -> bool {
        self.rekey_timer
            .as_ref()
            .is_some_and(|timer| timer.is_active())
    }
}

pub struct Phase2Handle {
    pub side: Side,
    pub state: Phase2State,
    pub kind: Phase2Kind,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub policy_id: u32,
    pub message_id: u32,
    pub is_rekey: bool,
    pub is_dying: bool,
    pub proposal: Option<SaProposal>,
    pub approval: Option<SaProposal>,
    // Identification payload bodies: type, protocol, port, address data.
    pub id: Option<Vec<u8>>,
    pub id_p: Option<Vec<u8>>,
    pub ext_nat_id: Option<Vec<u8>>,
    pub ext_nat_id_p: Option<Vec<u8>>,
    pub sainfo: Option<Arc<SaInfo>>,
    pub iv: Option<Vec<u8>>,
    pub retry_counter: u32,
    pub(super) cleanup_timer: Option<TimerHandle>,
}

impl Phase2Handle {
    pub fn new(
        side: Side,
        kind: Phase2Kind,
        src: SocketAddr,
        dst: SocketAddr,
        policy_id: u32,
        message_id: u32,
    ) -> Phase2Handle {
        Phase2Handle {
            side,
            state: Phase2State::Negotiating,
            kind,
            src,
            dst,
            policy_id,
            message_id,
            is_rekey: false,
            is_dying: false,
            proposal: None,
            approval: None,
            id: None,
            id_p: None,
            ext_nat_id: None,
            ext_nat_id_p: None,
            sainfo: None,
            iv: None,
            retry_counter: 0,
            cleanup_timer: None,
        }
    }

    pub fn is_sa(&self) -> bool {
        self.kind == Phase2Kind::SecurityAssociation
    }
}

#[derive(Default)]
pub(super) struct TrafficMonitor {
    pub(super) idle_interval: Duration,
    pub(super) monitor_interval: Duration,
    pub(super) idle_direction: Option<IdleDirection>,
    pub(super) inbound_last_poll: Vec<SaStats>,
    pub(super) outbound_last_poll: Vec<SaStats>,
    pub(super) monitor_timer: Option<TimerHandle>,
    pub(super) idle_timer: Option<TimerHandle>,
    pub(super) peer_sent_data_idle: bool,
    pub(super) self_sent_data_idle: bool,
    pub(super) peer_sent_data_dpd: bool,
    pub(super) self_sent_data_dpd: bool,
}

pub struct Session {
    pub(super) id: SessionId,
    pub(super) key: SessionKey,
    pub(super) established: bool,
    pub(super) is_client: bool,
    pub(super) is_dying: bool,
    pub(super) is_asserted: bool,
    pub(super) stopped_by_controller: bool,
    pub(super) ports_floated: bool,
    pub(super) stop_reason: Option<StopReason>,
    pub(super) mode: SessionMode,
    pub(super) natt_version: u8,
    pub(super) start_time: Option<Instant>,
    pub(super) established_time: Option<Instant>,
    pub(super) stop_time: Option<Instant>,
    pub(super) last_time_data_detected: Option<Instant>,
    pub(super) active_phase1_count: usize,
    pub(super) active_phase2_count: usize,
    pub(super) total_phase1_count: usize,
    pub(super) total_phase2_count: usize,
    pub(super) phase1s: BTreeMap<u64, Phase1Handle>,
    pub(super) phase2s: BTreeMap<u64, Phase2Handle>,
    // Phase 2 index to the phase 1 index whose keys protect its messages.
    pub(super) bindings: BTreeMap<u64, u64>,
    pub(super) traffic: TrafficMonitor,
    pub(super) xauth_timer: Option<TimerHandle>,
    next_index: u64,
}

impl Session {
    pub(super) fn new(id: SessionId, key: SessionKey) -> Session {
        Session {
            id,
            key,
            established: false,
            is_client: false,
            is_dying: false,
            is_asserted: false,
            stopped_by_controller: false,
            ports_floated: false,
            stop_reason: None,
            mode: SessionMode::Unknown,
            natt_version: 0,
            start_time: None,
            established_time: None,
            stop_time: None,
            last_time_data_detected: None,
            active_phase1_count: 0,
            active_phase2_count: 0,
            total_phase1_count: 0,
            total_phase2_count: 0,
            phase1s: BTreeMap::new(),
            phase2s: BTreeMap::new(),
            bindings: BTreeMap::new(),
            traffic: TrafficMonitor::default(),
            xauth_timer: None,
            next_index: 0,
        }
    }

    pub(super) fn allocate_index(&mut self) -> u64 {
        self.next_index += 1;
        self.next_index
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn is_dying(&self) -> bool {
        self.is_dying
    }

    pub fn is_asserted(&self) -> bool {
        self.is_asserted
    }

    pub fn ports_floated(&self) -> bool {
        self.ports_floated
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn active_phase1_count(&self) -> usize {
        self.active_phase1_count
    }

    pub fn active_phase2_count(&self) -> usize {
        self.active_phase2_count
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped_by_controller || self.stop_time.is_some()
    }

    /// Phase 1 handles, newest first.
    pub fn phase1s(&self) -> impl Iterator<Item = (u64, &Phase1Handle)> {
        self.phase1s.iter().rev().map(|(index, phase1)| (*index, phase1))
    }

    /// Phase 2 handles, newest first.
    pub fn phase2s(&self) -> impl Iterator<Item = (u64, &Phase2Handle)> {
        self.phase2s.iter().rev().map(|(index, phase2)| (*index, phase2))
    }

    pub(super) fn phase1_indexes(&self) -> Vec<u64> {
        self.phase1s.keys().rev().copied().collect()
    }

    pub(super) fn phase2_indexes(&self) -> Vec<u64> {
        self.phase2s.keys().rev().copied().collect()
    }

    pub(super) fn bound_phase2s(&self, phase1: u64) -> Vec<u64> {
        self.bindings
            .iter()
            .filter(|(_, bound)| **bound == phase1)
            .map(|(phase2, _)| *phase2)
            .collect()
    }

    pub fn find_phase1_by_index(&self, index: &IsakmpIndex) -> Option<u64> {
        self.phase1s()
            .find(|(_, phase1)| phase1.index == *index)
            .map(|(i, _)| i)
    }

    pub fn established_phase1(&self) -> Option<u64> {
        self.phase1s()
            .find(|(_, phase1)| !phase1.is_dying && phase1.state == Phase1State::Established)
            .map(|(i, _)| i)
    }

    pub fn established_or_negotiating_phase1(&self) -> Option<u64> {
        let mut result: Option<(u64, Phase1State)> = None;
        for (i, phase1) in self.phase1s() {
            if phase1.is_dying || phase1.state == Phase1State::Expired {
                continue;
            }
            match result {
                Some((_, state)) if phase1.state <= state => {}
                _ => result = Some((i, phase1.state)),
            }
        }
        result.map(|(i, _)| i)
    }

    pub fn has_other_established_phase1(&self, index: u64) -> bool {
        self.phase1s().any(|(i, phase1)| {
            i != index
                && !phase1.is_dying
                && phase1.state == Phase1State::Established
                && phase1.has_pending_rekey()
        })
    }

    pub fn has_other_negotiating_phase1(&self, index: u64) -> bool {
        self.phase1s().any(|(i, phase1)| {
            i != index && !phase1.is_dying && phase1.state == Phase1State::Negotiating
        })
    }

    fn has_other_phase2_in_state(&self, index: u64, state: Phase2State) -> bool {
        let policy_id = match self.phase2s.get(&index) {
            Some(phase2) => phase2.policy_id,
            None => return false,
        };
        self.phase2s().any(|(i, phase2)| {
            phase2.is_sa()
                && i != index
                && !phase2.is_dying
                && phase2.policy_id == policy_id
                && phase2.state == state
        })
    }

    pub fn has_other_established_phase2(&self, index: u64) -> bool {
        self.has_other_phase2_in_state(index, Phase2State::Established)
    }

    pub fn has_other_negotiating_phase2(&self, index: u64) -> bool {
        self.has_other_phase2_in_state(index, Phase2State::Negotiating)
    }

    pub fn has_negotiating_phase1(&self) -> bool {
        self.phase1s()
            .any(|(_, phase1)| !phase1.is_dying && phase1.state == Phase1State::Negotiating)
    }

    pub fn has_established_phase1(&self) -> bool {
        self.established_phase1().is_some()
    }

    pub fn has_negotiating_phase2(&self) -> bool {
        self.phase2s()
            .any(|(_, phase2)| !phase2.is_dying && phase2.state == Phase2State::Negotiating)
    }

    pub fn has_established_phase2(&self) -> bool {
        self.phase2s()
            .any(|(_, phase2)| !phase2.is_dying && phase2.state == Phase2State::Established)
    }

    /// Classifies the session from an SA phase 2; control API sessions keep their mode.
    pub(super) fn update_mode(&mut self, phase2: u64) {
        if self.mode == SessionMode::CiscoIpsec {
            return;
        }
        let sa = match self.phase2s.get(&phase2) {
            Some(phase2) if phase2.is_sa() => {
                match phase2.approval.as_ref().or(phase2.proposal.as_ref()) {
                    Some(sa) => sa,
                    None => return,
                }
            }
            _ => return,
        };
        if !sa.has_transport() {
            self.mode = SessionMode::PureTunnel;
        } else if sa.all_transport() {
            self.mode = SessionMode::Transport;
        }
        debug!("Session {} mode is {:?}", self.id, self.mode);
    }
}

#[derive(Debug)]
pub enum SessionError {
    Internal(&'static str),
    UnknownSession(SessionId),
    UnknownPhase1(Phase1Id),
    UnknownPhase2(Phase2Id),
    AlreadyBound(Phase2Id),
    Kernel(KernelError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::UnknownSession(id) => write!(f, "Unknown session {id}"),
            Self::UnknownPhase1(id) => write!(f, "Unknown phase 1 {id}"),
            Self::UnknownPhase2(id) => write!(f, "Unknown phase 2 {id}"),
            Self::AlreadyBound(id) => write!(f, "Phase 2 {id} is already bound"),
            Self::Kernel(e) => write!(f, "Kernel error: {e}"),
        }
    }
}

impl error::Error for SessionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Kernel(err) => Some(err),
            _ => None,
        }
    }
}

impl From<&'static str> for SessionError {
    fn from(msg: &'static str) -> SessionError {
        Self::Internal(msg)
    }
}

impl From<KernelError> for SessionError {
    fn from(err: KernelError) -> SessionError {
        Self::Kernel(err)
    }
}
