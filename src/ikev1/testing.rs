use std::{
    cell::RefCell,
    collections::HashMap,
    net::SocketAddr,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use super::control::{FailureCode, FailureSource, Notifier};
use super::crypto::{
    AuthMethod, CryptoError, DhGroup, EncapsulationMode, EncryptionAlgorithm, EspTransform,
    HashAlgorithm, IpsecAuth, IpsecProtocol, IpsecTransform, IvDeriver,
};
use super::kernel::{Direction, KernelError, KernelSa, SaEntry, SaStats};
use super::proposal::{IsakmpSa, Lifetimes, SaProposal, SaProtocol, SaTransform};
use super::registry::SessionRegistry;
use super::session::{
    IsakmpIndex, Phase1Handle, Phase1Id, Phase2Handle, Phase2Id, Phase2Kind, SessionId, Side,
};
use super::RemoteConfig;

pub const LOCAL: &str = "192.0.2.1:500";
pub const REMOTE: &str = "198.51.100.7:500";

type Events = Rc<RefCell<Vec<String>>>;

struct RecordingNotifier {
    events: Events,
}

impl Notifier for RecordingNotifier {
    fn send_phase1_delete(&mut self, id: Phase1Id, _phase1: &Phase1Handle) {
        self.events.borrow_mut().push(format!("delete1 {id}"));
    }

    fn send_phase2_delete(&mut self, id: Phase2Id, _phase2: &Phase2Handle) {
        self.events.borrow_mut().push(format!("delete2 {id}"));
    }

    fn initiate_phase1_rekey(&mut self, id: Phase1Id, _phase1: &Phase1Handle) {
        self.events.borrow_mut().push(format!("rekey1 {id}"));
    }

    fn ike_failed(&mut self, code: FailureCode, source: FailureSource, remote: SocketAddr) {
        self.events
            .borrow_mut()
            .push(format!("failed {code} {source:?} {remote}"));
    }

    fn phase1_established(&mut self, id: Phase1Id, _phase1: &Phase1Handle) {
        self.events.borrow_mut().push(format!("established1 {id}"));
    }

    fn phase2_established(&mut self, id: Phase2Id, _phase2: &Phase2Handle) {
        self.events.borrow_mut().push(format!("established2 {id}"));
    }
}

struct RecordingKernel {
    events: Events,
    counters: Rc<RefCell<HashMap<u32, u64>>>,
}

impl KernelSa for RecordingKernel {
    fn push_sa(&mut self, sa: &SaEntry) -> Result<(), KernelError> {
        self.events
            .borrow_mut()
            .push(format!("kernel push {} {} {}", sa.direction, sa.protocol, sa.spi));
        Ok(())
    }

    fn delete_sa(
        &mut self,
        protocol: IpsecProtocol,
        mode: Option<EncapsulationMode>,
        _src: SocketAddr,
        _dst: SocketAddr,
        spi: u32,
    ) -> Result<(), KernelError> {
        self.events
            .borrow_mut()
            .push(format!("kernel delete {protocol} {spi} {mode:?}"));
        Ok(())
    }

    fn poll_stats(
        &mut self,
        _direction: Direction,
        spis: &[u32],
    ) -> Result<Vec<SaStats>, KernelError> {
        let counters = self.counters.borrow();
        Ok(spis
            .iter()
            .filter_map(|spi| counters.get(spi).map(|bytes| SaStats { spi: *spi, bytes: *bytes }))
            .collect())
    }
}

struct ConcatIvDeriver {}

impl IvDeriver for ConcatIvDeriver {
    fn phase2_iv(
        &self,
        _hash: HashAlgorithm,
        _encryption: EncryptionAlgorithm,
        phase1_iv: &[u8],
        message_id: u32,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut iv = phase1_iv.to_vec();
        iv.extend_from_slice(&message_id.to_be_bytes());
        Ok(iv)
    }
}

pub fn tunnel_bundle() -> SaProposal {
    SaProposal {
        prop_no: 1,
        lifetimes: Lifetimes {
            seconds: 3600,
            kilobytes: 0,
        },
        pfs_group: None,
        protocols: vec![SaProtocol {
            protocol: IpsecProtocol::Esp,
            mode: EncapsulationMode::Tunnel,
            spi: 1,
            spi_p: 2,
            accepted: true,
            transforms: vec![SaTransform {
                trns_no: 1,
                transform: IpsecTransform::Esp(EspTransform::Aes),
                key_length: 128,
                auth: Some(IpsecAuth::HmacSha1),
            }],
        }],
    }
}

/// A registry wired to recording collaborators, with a manually advanced clock.
pub struct Fixture {
    pub registry: SessionRegistry,
    pub events: Events,
    pub counters: Rc<RefCell<HashMap<u32, u64>>>,
    pub config: Arc<RemoteConfig>,
    pub now: Instant,
    next_message_id: u32,
}

impl Fixture {
    pub fn new() -> Fixture {
        Fixture::with_config(RemoteConfig::default())
    }

    pub fn with_config(config: RemoteConfig) -> Fixture {
        let events = Events::default();
        let counters = Rc::new(RefCell::new(HashMap::new()));
        let registry = SessionRegistry::new(
            Box::new(RecordingKernel {
                events: events.clone(),
                counters: counters.clone(),
            }),
            Box::new(RecordingNotifier {
                events: events.clone(),
            }),
            Box::new(ConcatIvDeriver {}),
        );
        Fixture {
            registry,
            events,
            counters,
            config: Arc::new(config),
            now: Instant::now(),
            next_message_id: 0x1000,
        }
    }

    pub fn session(&mut self) -> SessionId {
        self.registry
            .lookup(LOCAL.parse().unwrap(), REMOTE.parse().unwrap(), None, true)
            .unwrap()
    }

    pub fn phase1_handle(&self, side: Side, cookie: u64) -> Phase1Handle {
        Phase1Handle::new(
            side,
            LOCAL.parse().unwrap(),
            REMOTE.parse().unwrap(),
            IsakmpIndex {
                initiator_cookie: cookie,
                responder_cookie: 0,
            },
            self.config.clone(),
        )
    }

    pub fn phase1(&mut self, session: SessionId, side: Side, cookie: u64) -> Phase1Id {
        let handle = self.phase1_handle(side, cookie);
        self.registry.link_phase1(session, handle, self.now).unwrap()
    }

    pub fn established_phase1(&mut self, session: SessionId, side: Side, cookie: u64) -> Phase1Id {
        let id = self.phase1(session, side, cookie);
        let phase1 = self.registry.phase1_mut(id).unwrap();
        phase1.approval = Some(IsakmpSa {
            prop_no: 1,
            trns_no: 1,
            encryption: EncryptionAlgorithm::Aes,
            key_length: 128,
            hash: HashAlgorithm::Sha1,
            auth_method: AuthMethod::PreSharedKey,
            dh_group: DhGroup::Modp2048,
            lifetimes: Lifetimes::default(),
        });
        phase1.last_iv = vec![0xa0, 0xa1, cookie as u8];
        self.registry.phase1_established(id, self.now).unwrap();
        id
    }

    pub fn phase2(&mut self, phase1: Phase1Id, side: Side, policy_id: u32) -> Phase2Id {
        self.next_message_id += 1;
        let mut handle = Phase2Handle::new(
            side,
            Phase2Kind::SecurityAssociation,
            LOCAL.parse().unwrap(),
            REMOTE.parse().unwrap(),
            policy_id,
            self.next_message_id,
        );
        handle.proposal = Some(tunnel_bundle());
        handle.approval = Some(tunnel_bundle());
        self.registry.link_phase2_to_phase1(phase1, handle).unwrap()
    }

    pub fn established_phase2(&mut self, phase1: Phase1Id, side: Side, policy_id: u32) -> Phase2Id {
        let id = self.phase2(phase1, side, policy_id);
        self.registry.phase2_established(id, self.now).unwrap();
        id
    }

    /// Moves the clock forward one second at a time, firing due timers at each step.
    pub fn advance(&mut self, seconds: u64) {
        self.registry.process_timers(self.now);
        for _ in 0..seconds {
            self.now += Duration::from_secs(1);
            self.registry.process_timers(self.now);
        }
    }

    pub fn take_events(&self) -> Vec<String> {
        self.events.borrow_mut().drain(..).collect()
    }
}
