use std::{
    collections::BTreeMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use super::control::{FailureCode, FailureSource, Notifier};
use super::crypto::IvDeriver;
use super::kernel::{Direction, KernelSa, SaEntry};
use super::monitor;
use super::scheduler::{Scheduler, TimerEvent};
use super::session::{
    IsakmpIndex, Phase1Handle, Phase1Id, Phase1State, Phase2Handle, Phase2Id, Phase2State,
    Session, SessionError, SessionId, SessionKey, SessionMode, Side, StopReason,
};

const PORT_ISAKMP: u16 = 500;
const PORT_ISAKMP_NATT: u16 = 4500;

const PHASE1_REPLACE_DELAY_INITIATOR: Duration = Duration::from_secs(5);
const PHASE1_REPLACE_DELAY_RESPONDER: Duration = Duration::from_secs(7);
const PHASE2_REPLACE_DELAY_INITIATOR: Duration = Duration::from_secs(3);
const PHASE2_REPLACE_DELAY_RESPONDER: Duration = Duration::from_secs(5);
const EXPIRED_DELETE_DELAY: Duration = Duration::from_secs(1);
pub const PHASE1_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
const ASSERT_PHASE1_CLEANUP_DELAY: Duration = Duration::from_secs(5);
const ASSERT_PHASE2_CLEANUP_DELAY: Duration = Duration::from_secs(3);
const REKEY_RETRANSMIT_THRESHOLD: u32 = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RekeyType {
    Phase1,
    Phase2,
}

/// Soft lifetime for a rekey; the side with the higher SPI rekeys slightly later.
pub fn rekey_lifetime(local_spi_is_higher: bool, expiry: u32) -> u32 {
    let reduction = expiry / 10;
    if reduction != 0 {
        return if local_spi_is_higher {
            reduction * 9
        } else {
            reduction * 8
        };
    }
    let lifetime = if local_spi_is_higher {
        expiry.saturating_sub(1)
    } else {
        expiry.saturating_sub(2)
    };
    if lifetime < expiry {
        lifetime
    } else {
        0
    }
}

/// Owns all IKE sessions, their phase 1 and phase 2 handles and the timers driving them.
pub struct SessionRegistry {
    pub(super) sessions: BTreeMap<SessionId, Session>,
    pub(super) scheduler: Scheduler,
    pub(super) kernel: Box<dyn KernelSa>,
    pub(super) notifier: Box<dyn Notifier>,
    iv_deriver: Box<dyn IvDeriver>,
    next_session: u64,
}

fn session_mut(
    sessions: &mut BTreeMap<SessionId, Session>,
    id: SessionId,
) -> Result<&mut Session, SessionError> {
    sessions
        .get_mut(&id)
        .ok_or(SessionError::UnknownSession(id))
}

fn phase1_mut(
    sessions: &mut BTreeMap<SessionId, Session>,
    id: Phase1Id,
) -> Result<&mut Phase1Handle, SessionError> {
    session_mut(sessions, id.session)?
        .phase1s
        .get_mut(&id.index)
        .ok_or(SessionError::UnknownPhase1(id))
}

fn phase2_mut(
    sessions: &mut BTreeMap<SessionId, Session>,
    id: Phase2Id,
) -> Result<&mut Phase2Handle, SessionError> {
    session_mut(sessions, id.session)?
        .phase2s
        .get_mut(&id.index)
        .ok_or(SessionError::UnknownPhase2(id))
}

fn stop_session(session: &mut Session, reason: StopReason, now: Instant) {
    if session.stopped_by_controller {
        info!(
            "Session {} with {} is already stopped: {}",
            session.id,
            session.key.remote,
            session
                .stop_reason
                .map(|reason| reason.to_string())
                .unwrap_or_default()
        );
        return;
    }
    session.stopped_by_controller = true;
    session.stop_time = Some(now);
    if session.stop_reason.is_none() {
        session.stop_reason = Some(reason);
    }
}

// Moves a phase 2 onto another phase 1 and refreshes its IV from the new keys.
fn rebind_phase2(session: &mut Session, iv_deriver: &dyn IvDeriver, phase1: u64, phase2: u64) {
    match session.bindings.insert(phase2, phase1) {
        Some(previous) if previous != phase1 => debug!(
            "Rebinding phase 2 {} of session {} from phase 1 {} to {}",
            phase2, session.id, previous, phase1
        ),
        _ => {}
    }
    let (phase1_handle, phase2_handle) =
        match (session.phase1s.get(&phase1), session.phase2s.get_mut(&phase2)) {
            (Some(phase1_handle), Some(phase2_handle)) => (phase1_handle, phase2_handle),
            _ => return,
        };
    if phase2_handle.iv.is_none() {
        return;
    }
    phase2_handle.iv = match (&phase1_handle.approval, phase1_handle.state) {
        (Some(approval), Phase1State::Established) => match iv_deriver.phase2_iv(
            approval.hash,
            approval.encryption,
            &phase1_handle.last_iv,
            phase2_handle.message_id,
        ) {
            Ok(iv) => Some(iv),
            Err(err) => {
                warn!(
                    "Failed to derive IV for phase 2 {} of session {}: {}",
                    phase2, session.id, err
                );
                None
            }
        },
        _ => None,
    };
}

fn retire_phase1(
    session: &mut Session,
    iv_deriver: &dyn IvDeriver,
    scheduler: &mut Scheduler,
    old: u64,
    new: u64,
    now: Instant,
) -> Result<(), SessionError> {
    let old_id = Phase1Id {
        session: session.id,
        index: old,
    };
    let phase1 = session
        .phase1s
        .get_mut(&old)
        .ok_or(SessionError::UnknownPhase1(old_id))?;
    phase1.rekey_timer = None;
    phase1.is_dying = true;
    let delay = match phase1.side {
        Side::Initiator => PHASE1_REPLACE_DELAY_INITIATOR,
        Side::Responder => PHASE1_REPLACE_DELAY_RESPONDER,
    };
    phase1.cleanup_timer = Some(scheduler.schedule(now, delay, TimerEvent::Phase1Cleanup(old_id)));
    info!(
        "ISAKMP-SA {} needs to be deleted, replaced by phase 1 {}",
        old_id, new
    );
    for phase2 in session.bound_phase2s(old) {
        rebind_phase2(session, iv_deriver, new, phase2);
    }
    Ok(())
}

fn retire_phase2(
    session: &mut Session,
    scheduler: &mut Scheduler,
    old: u64,
    new: u64,
    now: Instant,
) -> Result<(), SessionError> {
    let old_id = Phase2Id {
        session: session.id,
        index: old,
    };
    let phase2 = session
        .phase2s
        .get_mut(&old)
        .ok_or(SessionError::UnknownPhase2(old_id))?;
    phase2.is_dying = true;
    let delay = match phase2.side {
        Side::Initiator => PHASE2_REPLACE_DELAY_INITIATOR,
        Side::Responder => PHASE2_REPLACE_DELAY_RESPONDER,
    };
    phase2.cleanup_timer = Some(scheduler.schedule(now, delay, TimerEvent::Phase2Cleanup(old_id)));
    info!(
        "IPsec-SA {} needs to be deleted, replaced by phase 2 {}",
        old_id, new
    );
    Ok(())
}

impl SessionRegistry {
    pub fn new(
        kernel: Box<dyn KernelSa>,
        notifier: Box<dyn Notifier>,
        iv_deriver: Box<dyn IvDeriver>,
    ) -> SessionRegistry {
        SessionRegistry {
            sessions: BTreeMap::new(),
            scheduler: Scheduler::new(),
            kernel,
            notifier,
            iv_deriver,
            next_session: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions, newest first.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values().rev()
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn phase1(&self, id: Phase1Id) -> Option<&Phase1Handle> {
        self.sessions.get(&id.session)?.phase1s.get(&id.index)
    }

    pub fn phase1_mut(&mut self, id: Phase1Id) -> Option<&mut Phase1Handle> {
        phase1_mut(&mut self.sessions, id).ok()
    }

    pub fn phase2(&self, id: Phase2Id) -> Option<&Phase2Handle> {
        self.sessions.get(&id.session)?.phase2s.get(&id.index)
    }

    pub fn phase2_mut(&mut self, id: Phase2Id) -> Option<&mut Phase2Handle> {
        phase2_mut(&mut self.sessions, id).ok()
    }

    pub fn bound_phase1(&self, phase2: Phase2Id) -> Option<Phase1Id> {
        let index = self
            .sessions
            .get(&phase2.session)?
            .bindings
            .get(&phase2.index)?;
        Some(Phase1Id {
            session: phase2.session,
            index: *index,
        })
    }

    pub fn bound_phase2s(&self, phase1: Phase1Id) -> Vec<Phase2Id> {
        self.sessions
            .get(&phase1.session)
            .map(|session| {
                session
                    .bound_phase2s(phase1.index)
                    .into_iter()
                    .map(|index| Phase2Id {
                        session: phase1.session,
                        index,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Finds the session for an address pair, tolerating NAT-T port changes.
    ///
    /// An exact match wins; next a session keyed on the default IKE ports, then a session
    /// whose ports were floated to NAT-T. Sessions created without ports, or sessions
    /// holding a phase 1 with the requested cookies, are used only if nothing else matches.
    pub fn lookup(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        index: Option<&IsakmpIndex>,
        allow_create: bool,
    ) -> Option<SessionId> {
        let exact = SessionKey::new(local, remote);
        let default_ports = exact.with_ports(PORT_ISAKMP, PORT_ISAKMP);
        let floated_ports = exact.with_ports(PORT_ISAKMP_NATT, PORT_ISAKMP_NATT);
        let no_ports = exact.with_ports(0, 0);
        let isakmp_port = matches!(remote.port(), 0 | PORT_ISAKMP | PORT_ISAKMP_NATT);

        let mut best_match = None;
        for (id, session) in self.sessions.iter().rev() {
            if session.is_dying || session.is_stopped() {
                debug!("Skipping stopped session {} with {}", id, session.key);
                continue;
            }
            if let Some(index) = index {
                if session.find_phase1_by_index(index).is_none() {
                    continue;
                }
            }
            if session.key == exact {
                return Some(*id);
            } else if isakmp_port && session.key == default_ports {
                return Some(*id);
            } else if isakmp_port && session.ports_floated && session.key == floated_ports {
                return Some(*id);
            } else if (isakmp_port && session.key == no_ports) || index.is_some() {
                best_match = Some(*id);
            }
        }
        if best_match.is_some() {
            return best_match;
        }
        if allow_create {
            Some(self.create_session(exact))
        } else {
            None
        }
    }

    pub fn create_session(&mut self, key: SessionKey) -> SessionId {
        self.next_session += 1;
        let id = SessionId::from_u64(self.next_session);
        info!("New IKE session {} {}", id, key);
        self.sessions.insert(id, Session::new(id, key));
        id
    }

    fn free_session(&mut self, id: SessionId, now: Instant) {
        if let Some(mut session) = self.sessions.remove(&id) {
            if session.start_time.is_some() && session.stop_time.is_none() {
                session.stop_time = Some(now);
            }
            let duration = match (session.start_time, session.stop_time) {
                (Some(start), Some(stop)) => stop.saturating_duration_since(start),
                _ => Duration::ZERO,
            };
            info!(
                "Freeing IKE session {} {}, lasted {:?}",
                id, session.key, duration
            );
        }
    }

    /// Unlinks every handle of a session and frees it.
    pub fn release_session(&mut self, id: SessionId, now: Instant) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, id)?;
        session.is_dying = true;
        let phase2s = session.phase2_indexes();
        let phase1s = session.phase1_indexes();
        for index in phase2s {
            self.unlink_phase2(Phase2Id { session: id, index }, now)?;
        }
        for index in phase1s {
            if !self.sessions.contains_key(&id) {
                break;
            }
            self.unlink_phase1(Phase1Id { session: id, index }, now)?;
        }
        self.free_session(id, now);
        Ok(())
    }

    pub fn link_phase1(
        &mut self,
        session_id: SessionId,
        mut phase1: Phase1Handle,
        now: Instant,
    ) -> Result<Phase1Id, SessionError> {
        let session = session_mut(&mut self.sessions, session_id)?;
        session.start_time = Some(now);
        if phase1.started_by_api {
            session.mode = SessionMode::CiscoIpsec;
        }
        if (session.total_phase1_count == 0 && phase1.side == Side::Initiator)
            || phase1.started_by_api
        {
            session.is_client = true;
        }
        if session.established && session.total_phase1_count > 0 {
            phase1.is_rekey = true;
        }
        session.active_phase1_count += 1;
        session.total_phase1_count += 1;
        monitor::init_traffic_params(session, &phase1.config);

        let index = session.allocate_index();
        let id = Phase1Id {
            session: session_id,
            index,
        };
        debug!("Linked ISAKMP-SA {} {}-{}", id, phase1.local, phase1.remote);
        session.phase1s.insert(index, phase1);
        Ok(id)
    }

    pub fn link_phase2(
        &mut self,
        session_id: SessionId,
        mut phase2: Phase2Handle,
    ) -> Result<Phase2Id, SessionError> {
        let session = session_mut(&mut self.sessions, session_id)?;
        if session.total_phase2_count == 0 && phase2.side == Side::Initiator {
            session.is_client = true;
        }
        if phase2.is_sa() && session.established && session.total_phase2_count > 0 {
            phase2.is_rekey = true;
        }
        session.active_phase2_count += 1;
        session.total_phase2_count += 1;

        let index = session.allocate_index();
        let id = Phase2Id {
            session: session_id,
            index,
        };
        debug!("Linked IPsec-SA {} {}-{}", id, phase2.src, phase2.dst);
        session.phase2s.insert(index, phase2);
        session.update_mode(index);
        Ok(id)
    }

    /// Links a new phase 2 into the session of a phase 1 and binds them together.
    pub fn link_phase2_to_phase1(
        &mut self,
        phase1: Phase1Id,
        phase2: Phase2Handle,
    ) -> Result<Phase2Id, SessionError> {
        if self.phase1(phase1).is_none() {
            return Err(SessionError::UnknownPhase1(phase1));
        }
        let id = self.link_phase2(phase1.session, phase2)?;
        self.bind(phase1, id)?;
        Ok(id)
    }

    /// Binds an already linked phase 2; fails if it is bound to a different phase 1.
    pub fn attach_phase2(&mut self, phase1: Phase1Id, phase2: Phase2Id) -> Result<(), SessionError> {
        match self.bound_phase1(phase2) {
            Some(bound) if bound == phase1 => Ok(()),
            Some(bound) => {
                warn!(
                    "Phase 2 {} is already bound to {}, not binding to {}",
                    phase2, bound, phase1
                );
                Err(SessionError::AlreadyBound(phase2))
            }
            None => self.bind(phase1, phase2),
        }
    }

    pub fn unlink_phase1(
        &mut self,
        id: Phase1Id,
        now: Instant,
    ) -> Result<Phase1Handle, SessionError> {
        let session = session_mut(&mut self.sessions, id.session)?;
        if !session.phase1s.contains_key(&id.index) {
            return Err(SessionError::UnknownPhase1(id));
        }
        let bound = session.bound_phase2s(id.index);
        if !bound.is_empty() {
            match session.established_phase1() {
                Some(replacement) if replacement != id.index => {
                    for phase2 in bound {
                        rebind_phase2(session, &*self.iv_deriver, replacement, phase2);
                    }
                }
                _ => {
                    for phase2 in bound {
                        session.bindings.remove(&phase2);
                    }
                }
            }
        }
        let phase1 = session
            .phase1s
            .remove(&id.index)
            .ok_or(SessionError::UnknownPhase1(id))?;
        session.active_phase1_count = session.active_phase1_count.saturating_sub(1);
        debug!("Unlinked ISAKMP-SA {}", id);
        if session.active_phase1_count == 0 && session.active_phase2_count == 0 {
            session.is_dying = true;
            self.free_session(id.session, now);
        }
        Ok(phase1)
    }

    pub fn unlink_phase2(
        &mut self,
        id: Phase2Id,
        now: Instant,
    ) -> Result<Phase2Handle, SessionError> {
        let session = session_mut(&mut self.sessions, id.session)?;
        let phase2 = session
            .phase2s
            .remove(&id.index)
            .ok_or(SessionError::UnknownPhase2(id))?;
        session.bindings.remove(&id.index);
        session.active_phase2_count = session.active_phase2_count.saturating_sub(1);
        debug!("Unlinked IPsec-SA {}", id);
        if session.active_phase1_count == 0 && session.active_phase2_count == 0 {
            session.is_dying = true;
            self.free_session(id.session, now);
        }
        Ok(phase2)
    }

    pub fn bind(&mut self, phase1: Phase1Id, phase2: Phase2Id) -> Result<(), SessionError> {
        if phase1.session != phase2.session {
            return Err("Phase 1 and phase 2 belong to different sessions".into());
        }
        let session = session_mut(&mut self.sessions, phase1.session)?;
        if !session.phase1s.contains_key(&phase1.index) {
            return Err(SessionError::UnknownPhase1(phase1));
        }
        if !session.phase2s.contains_key(&phase2.index) {
            return Err(SessionError::UnknownPhase2(phase2));
        }
        if let Some(bound) = session.bindings.insert(phase2.index, phase1.index) {
            if bound != phase1.index {
                info!(
                    "Phase 2 {} was bound to phase 1 {}, now bound to {}",
                    phase2, bound, phase1
                );
            }
        }
        Ok(())
    }

    pub fn unbind(&mut self, phase2: Phase2Id) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, phase2.session)?;
        session.bindings.remove(&phase2.index);
        Ok(())
    }

    pub fn rebind(&mut self, phase1: Phase1Id, phase2: Phase2Id) -> Result<(), SessionError> {
        if phase1.session != phase2.session {
            return Err("Phase 1 and phase 2 belong to different sessions".into());
        }
        let session = session_mut(&mut self.sessions, phase1.session)?;
        if !session.phase1s.contains_key(&phase1.index) {
            return Err(SessionError::UnknownPhase1(phase1));
        }
        if !session.phase2s.contains_key(&phase2.index) {
            return Err(SessionError::UnknownPhase2(phase2));
        }
        rebind_phase2(session, &*self.iv_deriver, phase1.index, phase2.index);
        Ok(())
    }

    /// Binds an SA phase 2 to the established phase 1 of its session, if there is one.
    pub fn update_phase2_binding(
        &mut self,
        phase2: Phase2Id,
    ) -> Result<Option<Phase1Id>, SessionError> {
        let session = session_mut(&mut self.sessions, phase2.session)?;
        let handle = session
            .phase2s
            .get(&phase2.index)
            .ok_or(SessionError::UnknownPhase2(phase2))?;
        if !handle.is_sa() {
            return Ok(None);
        }
        let established = match session.established_phase1() {
            Some(index) => index,
            None => return Ok(None),
        };
        let phase1 = Phase1Id {
            session: phase2.session,
            index: established,
        };
        match session.bindings.get(&phase2.index).copied() {
            Some(bound) if bound == established => {}
            Some(_) => rebind_phase2(session, &*self.iv_deriver, established, phase2.index),
            None => self.bind(phase1, phase2)?,
        }
        Ok(Some(phase1))
    }

    pub fn get_established_phase1(&self, session: SessionId) -> Option<Phase1Id> {
        let index = self.sessions.get(&session)?.established_phase1()?;
        Some(Phase1Id { session, index })
    }

    pub fn get_established_or_negotiating_phase1(&self, session: SessionId) -> Option<Phase1Id> {
        let index = self
            .sessions
            .get(&session)?
            .established_or_negotiating_phase1()?;
        Some(Phase1Id { session, index })
    }

    pub fn has_other_established_phase1(&self, phase1: Phase1Id) -> bool {
        self.sessions
            .get(&phase1.session)
            .is_some_and(|session| session.has_other_established_phase1(phase1.index))
    }

    pub fn has_other_negotiating_phase1(&self, phase1: Phase1Id) -> bool {
        self.sessions
            .get(&phase1.session)
            .is_some_and(|session| session.has_other_negotiating_phase1(phase1.index))
    }

    pub fn has_other_established_phase2(&self, phase2: Phase2Id) -> bool {
        self.sessions
            .get(&phase2.session)
            .is_some_and(|session| session.has_other_established_phase2(phase2.index))
    }

    pub fn has_other_negotiating_phase2(&self, phase2: Phase2Id) -> bool {
        self.sessions
            .get(&phase2.session)
            .is_some_and(|session| session.has_other_negotiating_phase2(phase2.index))
    }

    pub fn is_client_phase1_rekey(&self, phase1: Phase1Id) -> bool {
        match (self.sessions.get(&phase1.session), self.phase1(phase1)) {
            (Some(session), Some(handle)) => {
                session.is_client && handle.is_rekey && session.mode == SessionMode::CiscoIpsec
            }
            _ => false,
        }
    }

    pub fn is_client_phase2_rekey(&self, phase2: Phase2Id) -> bool {
        match (self.sessions.get(&phase2.session), self.phase2(phase2)) {
            (Some(session), Some(handle)) => {
                session.is_client && handle.is_rekey && session.mode == SessionMode::CiscoIpsec
            }
            _ => false,
        }
    }

    /// Retires `old` in favour of `new`: its phase 2s move to `new` and it is deleted after a grace delay.
    pub fn replace_other_phase1(
        &mut self,
        new: Phase1Id,
        old: Phase1Id,
        now: Instant,
    ) -> Result<(), SessionError> {
        if new.session != old.session {
            return Err("Phase 1 handles belong to different sessions".into());
        }
        if new == old {
            return Err("Phase 1 cannot replace itself".into());
        }
        let session = session_mut(&mut self.sessions, new.session)?;
        let new_side = session
            .phase1s
            .get(&new.index)
            .ok_or(SessionError::UnknownPhase1(new))?
            .side;
        if session.is_client && new_side == Side::Responder {
            debug!(
                "Leaving ISAKMP-SA {} in place, the client side will replace it",
                old
            );
            return Ok(());
        }
        retire_phase1(
            session,
            &*self.iv_deriver,
            &mut self.scheduler,
            old.index,
            new.index,
            now,
        )
    }

    pub fn cleanup_other_established_phase1s(
        &mut self,
        new: Phase1Id,
        now: Instant,
    ) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, new.session)?;
        let new_side = session
            .phase1s
            .get(&new.index)
            .ok_or(SessionError::UnknownPhase1(new))?
            .side;
        if session.is_client && new_side == Side::Responder {
            debug!(
                "Leaving other ISAKMP-SAs of {} in place, the client side will replace them",
                new.session
            );
            return Ok(());
        }
        let others = session
            .phase1s()
            .filter(|(index, phase1)| *index != new.index && !phase1.is_dying)
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        for old in others {
            retire_phase1(
                session,
                &*self.iv_deriver,
                &mut self.scheduler,
                old,
                new.index,
                now,
            )?;
        }
        Ok(())
    }

    pub fn cleanup_other_established_phase2s(
        &mut self,
        new: Phase2Id,
        now: Instant,
    ) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, new.session)?;
        let handle = session
            .phase2s
            .get(&new.index)
            .ok_or(SessionError::UnknownPhase2(new))?;
        if !handle.is_sa() {
            return Ok(());
        }
        if session.is_client && handle.side == Side::Responder {
            debug!(
                "Leaving other IPsec-SAs of {} in place, the client side will replace them",
                new.session
            );
            return Ok(());
        }
        let policy_id = handle.policy_id;
        let others = session
            .phase2s()
            .filter(|(index, phase2)| {
                *index != new.index
                    && phase2.is_sa()
                    && !phase2.is_dying
                    && phase2.policy_id == policy_id
            })
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        for old in others {
            retire_phase2(session, &mut self.scheduler, old, new.index, now)?;
        }
        Ok(())
    }

    fn send_phase1_delete(&mut self, id: Phase1Id) {
        if let Some(phase1) = self
            .sessions
            .get(&id.session)
            .and_then(|session| session.phase1s.get(&id.index))
        {
            if phase1.state == Phase1State::Established {
                self.notifier.send_phase1_delete(id, phase1);
            }
        }
    }

    fn send_phase2_delete(&mut self, id: Phase2Id) {
        if let Some(phase2) = self
            .sessions
            .get(&id.session)
            .and_then(|session| session.phase2s.get(&id.index))
        {
            if phase2.state == Phase2State::Established {
                self.notifier.send_phase2_delete(id, phase2);
            }
        }
    }

    /// Expires an ISAKMP-SA that is still negotiating when the negotiation timeout passes.
    pub fn start_negotiation_timer(
        &mut self,
        id: Phase1Id,
        now: Instant,
    ) -> Result<(), SessionError> {
        let phase1 = phase1_mut(&mut self.sessions, id)?;
        if phase1.state != Phase1State::Negotiating {
            return Ok(());
        }
        phase1.cleanup_timer = Some(self.scheduler.schedule(
            now,
            PHASE1_NEGOTIATION_TIMEOUT,
            TimerEvent::Phase1Cleanup(id),
        ));
        Ok(())
    }

    pub fn expire_phase1(&mut self, id: Phase1Id, now: Instant) -> Result<(), SessionError> {
        let phase1 = phase1_mut(&mut self.sessions, id)?;
        phase1.state = Phase1State::Expired;
        phase1.rekey_timer = None;
        phase1.cleanup_timer = Some(self.scheduler.schedule(
            now,
            EXPIRED_DELETE_DELAY,
            TimerEvent::Phase1Delete(id),
        ));
        info!("ISAKMP-SA {} expired", id);
        Ok(())
    }

    pub fn expire_phase2(&mut self, id: Phase2Id, now: Instant) -> Result<(), SessionError> {
        let phase2 = phase2_mut(&mut self.sessions, id)?;
        phase2.state = Phase2State::Expired;
        phase2.cleanup_timer = Some(self.scheduler.schedule(
            now,
            EXPIRED_DELETE_DELAY,
            TimerEvent::Phase2Delete(id),
        ));
        info!("IPsec-SA {} expired", id);
        Ok(())
    }

    pub fn cleanup_phase1(&mut self, id: Phase1Id, now: Instant) -> Result<(), SessionError> {
        let phase1 = phase1_mut(&mut self.sessions, id)?;
        phase1.cleanup_timer = None;
        if phase1.state == Phase1State::Expired {
            phase1.cleanup_timer = Some(self.scheduler.schedule(
                now,
                EXPIRED_DELETE_DELAY,
                TimerEvent::Phase1Delete(id),
            ));
            return Ok(());
        }
        self.send_phase1_delete(id);
        self.expire_phase1(id, now)
    }

    pub fn cleanup_phase2(&mut self, id: Phase2Id, now: Instant) -> Result<(), SessionError> {
        let phase2 = phase2_mut(&mut self.sessions, id)?;
        if !phase2.is_sa() {
            return Ok(());
        }
        phase2.cleanup_timer = None;
        if phase2.state == Phase2State::Expired {
            // Kernel SAs are already gone; only the handle is left to unlink.
            phase2.cleanup_timer = Some(self.scheduler.schedule(
                now,
                EXPIRED_DELETE_DELAY,
                TimerEvent::Phase2Delete(id),
            ));
            return Ok(());
        }
        if phase2.state == Phase2State::Established {
            self.send_phase2_delete(id);
            self.delete_kernel_sas(id, false);
        }
        self.unlink_phase2(id, now).map(|_| ())
    }

    fn delete_kernel_sas(&mut self, id: Phase2Id, with_mode: bool) {
        let phase2 = match self
            .sessions
            .get(&id.session)
            .and_then(|session| session.phase2s.get(&id.index))
        {
            Some(phase2) => phase2,
            None => return,
        };
        let approval = match &phase2.approval {
            Some(approval) => approval,
            None => return,
        };
        for protocol in approval.protocols.iter().filter(|protocol| protocol.accepted) {
            let mode = if with_mode { Some(protocol.mode) } else { None };
            if let Err(err) = self.kernel.delete_sa(
                protocol.protocol,
                mode,
                phase2.src,
                phase2.dst,
                protocol.spi_p,
            ) {
                warn!("Failed to delete {} SA of {}: {}", protocol.protocol, id, err);
            }
        }
    }

    /// Installs both directions of every accepted protocol of an approved phase 2.
    pub fn install_phase2_sas(&mut self, id: Phase2Id) -> Result<(), SessionError> {
        let phase2 = self.phase2(id).ok_or(SessionError::UnknownPhase2(id))?;
        let approval = phase2
            .approval
            .as_ref()
            .ok_or("Phase 2 has no approved proposal")?;
        let mut entries = vec![];
        for protocol in approval.protocols.iter().filter(|protocol| protocol.accepted) {
            let transform = protocol
                .transforms
                .first()
                .ok_or("Approved protocol has no transform")?;
            entries.push(SaEntry {
                direction: Direction::Inbound,
                src: phase2.dst,
                dst: phase2.src,
                protocol: protocol.protocol,
                mode: protocol.mode,
                spi: protocol.spi,
                transform: transform.clone(),
                lifetimes: approval.lifetimes,
            });
            entries.push(SaEntry {
                direction: Direction::Outbound,
                src: phase2.src,
                dst: phase2.dst,
                protocol: protocol.protocol,
                mode: protocol.mode,
                spi: protocol.spi_p,
                transform: transform.clone(),
                lifetimes: approval.lifetimes,
            });
        }
        for entry in entries.iter() {
            self.kernel.push_sa(entry)?;
        }
        Ok(())
    }

    pub fn phase1_established(&mut self, id: Phase1Id, now: Instant) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, id.session)?;
        if !session.phase1s.contains_key(&id.index) {
            return Err(SessionError::UnknownPhase1(id));
        }
        monitor::start_xauth_timer(session, &mut self.scheduler, now);
        let phase1 = session
            .phase1s
            .get_mut(&id.index)
            .ok_or(SessionError::UnknownPhase1(id))?;
        if phase1.state == Phase1State::Negotiating {
            phase1.cleanup_timer = None;
        }
        phase1.state = Phase1State::Established;
        self.notifier.phase1_established(id, phase1);
        Ok(())
    }

    /// Marks an SA phase 2 established and starts traffic monitoring for a newly established session.
    pub fn phase2_established(&mut self, id: Phase2Id, now: Instant) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, id.session)?;
        let phase2 = session
            .phase2s
            .get_mut(&id.index)
            .ok_or(SessionError::UnknownPhase2(id))?;
        if !phase2.is_sa() {
            return Ok(());
        }
        phase2.state = Phase2State::Established;

        session.xauth_timer = None;
        let start_monitor = if !session.established {
            session.established = true;
            session.established_time = Some(now);
            true
        } else {
            session.is_asserted
        };
        if start_monitor {
            monitor::start_traffic_monitor(session, &mut self.scheduler, now);
        }
        session.is_asserted = false;
        session.stop_reason = None;
        session.update_mode(id.index);

        if let Some(phase2) = session.phase2s.get(&id.index) {
            self.notifier.phase2_established(id, phase2);
        }
        Ok(())
    }

    pub fn stopped_by_controller(
        &mut self,
        id: SessionId,
        reason: StopReason,
        now: Instant,
    ) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, id)?;
        stop_session(session, reason, now);
        Ok(())
    }

    /// Marks every session with `remote` as stopped; ports are compared only if `with_port` is set.
    pub fn sessions_stopped_by_controller(
        &mut self,
        remote: SocketAddr,
        with_port: bool,
        reason: StopReason,
        now: Instant,
    ) -> usize {
        let mut count = 0;
        for session in self.sessions.values_mut().rev() {
            let matches = if with_port {
                session.key.remote == remote
            } else {
                session.key.remote.ip() == remote.ip()
            };
            if matches {
                stop_session(session, reason, now);
                count += 1;
            }
        }
        count
    }

    /// Tears a session down: sends deletes for established SAs and expires every handle.
    pub fn cleanup(
        &mut self,
        id: SessionId,
        reason: StopReason,
        now: Instant,
    ) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, id)?;
        session.is_dying = true;
        stop_session(session, reason, now);
        session.traffic.idle_timer = None;
        let phase2s = session.phase2_indexes();
        let phase1s = session.phase1_indexes();
        let is_cisco = session.mode == SessionMode::CiscoIpsec;
        let remote = session.key.remote;
        info!("Cleaning up IKE session {} with {}: {}", id, remote, reason);

        for index in phase2s {
            let phase2 = Phase2Id { session: id, index };
            self.send_phase2_delete(phase2);
            self.expire_phase2(phase2, now)?;
        }
        for index in phase1s {
            let phase1 = Phase1Id { session: id, index };
            self.send_phase1_delete(phase1);
            self.expire_phase1(phase1, now)?;
        }
        if is_cisco && !matches!(reason, StopReason::VpnDisconnect | StopReason::ControllerCommLost)
        {
            let code = if reason == StopReason::Idle {
                FailureCode::IdleTimeout
            } else {
                FailureCode::InternalError
            };
            self.notifier.ike_failed(code, FailureSource::Local, remote);
        }
        Ok(())
    }

    pub fn flush(&mut self, now: Instant) {
        let ids = self.sessions.keys().rev().copied().collect::<Vec<_>>();
        for id in ids {
            if let Err(err) = self.cleanup(id, StopReason::Flush, now) {
                warn!("Failed to flush session {}: {}", id, err);
            }
        }
    }

    /// Drops every phase 1 of a session after a failed negotiation, reporting each one.
    pub fn purge_phase1s_by_session(
        &mut self,
        id: SessionId,
        now: Instant,
    ) -> Result<(), SessionError> {
        let phase1s = session_mut(&mut self.sessions, id)?.phase1_indexes();
        for index in phase1s {
            let phase1 = Phase1Id { session: id, index };
            let remote = match self.phase1(phase1) {
                Some(handle) => handle.remote,
                None => continue,
            };
            self.notifier
                .ike_failed(FailureCode::NoProposalChosen, FailureSource::Remote, remote);
            self.unlink_phase1(phase1, now)?;
            if !self.sessions.contains_key(&id) {
                break;
            }
        }
        Ok(())
    }

    pub fn purge_phase2s_by_phase1(
        &mut self,
        phase1: Phase1Id,
        now: Instant,
    ) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, phase1.session)?;
        let phase2s = session
            .phase2s()
            .filter(|(_, phase2)| !phase2.is_dying)
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        for index in phase2s {
            let phase2 = Phase2Id {
                session: phase1.session,
                index,
            };
            if let Ok(handle) = phase2_mut(&mut self.sessions, phase2) {
                handle.cleanup_timer = None;
                handle.is_dying = true;
                info!("Purging IPsec-SA {} with ISAKMP-SA {}", phase2, phase1);
            }
            self.cleanup_phase2(phase2, now)?;
            if !self.sessions.contains_key(&phase1.session) {
                break;
            }
        }
        Ok(())
    }

    pub fn cleanup_phase1s_by_phase2(
        &mut self,
        phase2: Phase2Id,
        now: Instant,
    ) -> Result<(), SessionError> {
        let phase1s = session_mut(&mut self.sessions, phase2.session)?.phase1_indexes();
        for index in phase1s {
            let phase1 = Phase1Id {
                session: phase2.session,
                index,
            };
            self.send_phase1_delete(phase1);
            self.expire_phase1(phase1, now)?;
        }
        Ok(())
    }

    /// Adopts the NAT-T ports of a phase 1 for the session and all its phase 2s.
    pub fn float_ports(&mut self, phase1: Phase1Id) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, phase1.session)?;
        let handle = session
            .phase1s
            .get(&phase1.index)
            .ok_or(SessionError::UnknownPhase1(phase1))?;
        let (local_port, remote_port) = (handle.local.port(), handle.remote.port());
        session.key = session.key.with_ports(local_port, remote_port);
        session.ports_floated = true;
        for phase2 in session.phase2s.values_mut() {
            phase2.src.set_port(local_port);
            phase2.dst.set_port(remote_port);
        }
        debug!("Session {} floated to {}", session.id, session.key);
        Ok(())
    }

    pub fn update_phase2_ports(&mut self, phase2: Phase2Id) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, phase2.session)?;
        let key = session.key;
        let handle = session
            .phase2s
            .get_mut(&phase2.index)
            .ok_or(SessionError::UnknownPhase2(phase2))?;
        handle.src.set_port(key.local.port());
        handle.dst.set_port(key.remote.port());
        Ok(())
    }

    pub fn update_natt_version(&mut self, phase1: Phase1Id) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, phase1.session)?;
        let version = session
            .phase1s
            .get(&phase1.index)
            .ok_or(SessionError::UnknownPhase1(phase1))?
            .natt_version;
        session.natt_version = version.unwrap_or(0);
        Ok(())
    }

    pub fn natt_version(&self, session: SessionId) -> Option<u8> {
        self.sessions.get(&session).map(|session| session.natt_version)
    }

    pub fn drop_rekey(&self, session: SessionId, rekey_type: RekeyType, now: Instant) -> bool {
        self.sessions
            .get(&session)
            .is_some_and(|session| session.should_drop_rekey(rekey_type, now))
    }

    pub fn schedule_phase1_rekey(
        &mut self,
        id: Phase1Id,
        delay: Duration,
        now: Instant,
    ) -> Result<(), SessionError> {
        let phase1 = phase1_mut(&mut self.sessions, id)?;
        phase1.rekey_timer = Some(self.scheduler.schedule(now, delay, TimerEvent::Phase1Rekey(id)));
        Ok(())
    }

    fn phase1_rekey_due(&mut self, id: Phase1Id, now: Instant) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, id.session)?;
        let drop = session.should_drop_rekey(RekeyType::Phase1, now);
        let phase1 = session
            .phase1s
            .get_mut(&id.index)
            .ok_or(SessionError::UnknownPhase1(id))?;
        phase1.rekey_timer = None;
        if phase1.is_dying || phase1.state != Phase1State::Established {
            return Ok(());
        }
        if drop {
            info!("Dropping rekey of ISAKMP-SA {}, session is idle", id);
            return Ok(());
        }
        self.notifier.initiate_phase1_rekey(id, phase1);
        Ok(())
    }

    /// Forces an early phase 1 rekey when a client's phase 2 rekey keeps retransmitting.
    pub fn phase2_retransmits(&mut self, id: Phase2Id, now: Instant) -> Result<(), SessionError> {
        let phase1 = match self.bound_phase1(id) {
            Some(phase1) => phase1,
            None => return Ok(()),
        };
        let session = session_mut(&mut self.sessions, id.session)?;
        let (is_client, is_cisco) = (session.is_client, session.mode == SessionMode::CiscoIpsec);
        let (phase1_handle, phase2_handle) = match (
            session.phase1s.get_mut(&phase1.index),
            session.phase2s.get_mut(&id.index),
        ) {
            (Some(phase1_handle), Some(phase2_handle)) => (phase1_handle, phase2_handle),
            _ => return Err(SessionError::UnknownPhase2(id)),
        };
        if phase2_handle.is_dying
            || !phase2_handle.is_rekey
            || phase2_handle.side != Side::Initiator
            || !phase1_handle.has_pending_rekey()
            || is_cisco
            || !is_client
        {
            return Ok(());
        }
        let retries = phase1_handle
            .config
            .retry_counter
            .saturating_sub(phase2_handle.retry_counter);
        if retries == REKEY_RETRANSMIT_THRESHOLD {
            info!(
                "IPsec-SA {} rekey retransmitted {} times, rekeying ISAKMP-SA {}",
                id, retries, phase1
            );
            phase1_handle.rekey_timer = Some(self.scheduler.schedule(
                now,
                Duration::ZERO,
                TimerEvent::Phase1Rekey(phase1),
            ));
            phase2_handle.retry_counter = 0;
        }
        Ok(())
    }

    /// Stops retransmitting a stalled client phase 1 rekey.
    pub fn phase1_retransmits(&mut self, id: Phase1Id) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, id.session)?;
        let other_negotiating = session.has_other_negotiating_phase1(id.index);
        let is_client = session.is_client;
        let phase1 = session
            .phase1s
            .get_mut(&id.index)
            .ok_or(SessionError::UnknownPhase1(id))?;
        if phase1.is_dying
            || !phase1.is_rekey
            || phase1.has_pending_rekey()
            || phase1.state != Phase1State::Negotiating
            || phase1.side != Side::Initiator
            || !is_client
            || other_negotiating
        {
            return Ok(());
        }
        let retries = phase1.config.retry_counter.saturating_sub(phase1.retry_counter);
        if retries == REKEY_RETRANSMIT_THRESHOLD {
            info!(
                "ISAKMP-SA {} rekey retransmitted {} times, giving up",
                id, retries
            );
            phase1.retry_counter = 0;
        }
        Ok(())
    }

    /// Tears down the SAs of a session without notifying the peer.
    pub fn assert_session(&mut self, id: SessionId, now: Instant) -> Result<(), SessionError> {
        let session = session_mut(&mut self.sessions, id)?;
        if session.is_dying {
            return Err("Session is already dying".into());
        }
        let phase2s = session
            .phase2s()
            .filter(|(_, phase2)| !phase2.is_dying && phase2.state != Phase2State::Expired)
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        let phase1s = session
            .phase1s()
            .filter(|(_, phase1)| !phase1.is_dying && phase1.state != Phase1State::Expired)
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        info!("Asserting IKE session {} with {}", id, session.key.remote);

        for index in phase2s {
            let phase2 = Phase2Id { session: id, index };
            let established = match phase2_mut(&mut self.sessions, phase2) {
                Ok(handle) => {
                    handle.cleanup_timer = None;
                    handle.is_dying = true;
                    handle.state == Phase2State::Established
                }
                Err(_) => continue,
            };
            if established {
                self.delete_kernel_sas(phase2, true);
            }
            let handle = phase2_mut(&mut self.sessions, phase2)?;
            handle.state = Phase2State::Expired;
            handle.cleanup_timer = Some(self.scheduler.schedule(
                now,
                ASSERT_PHASE2_CLEANUP_DELAY,
                TimerEvent::Phase2Cleanup(phase2),
            ));
        }
        let session = session_mut(&mut self.sessions, id)?;
        for index in phase1s {
            for phase2 in session.bound_phase2s(index) {
                session.bindings.remove(&phase2);
            }
            if let Some(handle) = session.phase1s.get_mut(&index) {
                handle.rekey_timer = None;
                handle.is_dying = true;
                handle.state = Phase1State::Expired;
                handle.cleanup_timer = Some(self.scheduler.schedule(
                    now,
                    ASSERT_PHASE1_CLEANUP_DELAY,
                    TimerEvent::Phase1Cleanup(Phase1Id { session: id, index }),
                ));
            }
        }
        session.is_asserted = true;
        Ok(())
    }

    pub fn assert(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
    ) -> Result<(), SessionError> {
        match self.lookup(local, remote, None, false) {
            Some(id) => self.assert_session(id, now),
            None => Err("No session to assert".into()),
        }
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    pub fn dispatch(&mut self, event: TimerEvent, now: Instant) {
        let result = match event {
            TimerEvent::Phase1Cleanup(id) => self.cleanup_phase1(id, now),
            TimerEvent::Phase1Delete(id) => self.unlink_phase1(id, now).map(|_| ()),
            TimerEvent::Phase1Rekey(id) => self.phase1_rekey_due(id, now),
            TimerEvent::Phase2Cleanup(id) => self.cleanup_phase2(id, now),
            TimerEvent::Phase2Delete(id) => self.unlink_phase2(id, now).map(|_| ()),
            TimerEvent::TrafficMonitor(id) => self.traffic_cop(id, now),
            TimerEvent::IdleTimeout(id) => self.idle_timeout(id, now),
            TimerEvent::XauthTimeout(id) => self.xauth_timeout(id, now),
        };
        if let Err(err) = result {
            debug!("Timer event {:?} ignored: {}", event, err);
        }
    }

    /// Runs every timer due at `now`, returning how many fired.
    pub fn process_timers(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(event) = self.scheduler.pop_expired(now) {
            self.dispatch(event, now);
            fired += 1;
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{Fixture, LOCAL, REMOTE};
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn rekey_lifetime_margins() {
        assert_eq!(rekey_lifetime(true, 3600), 3240);
        assert_eq!(rekey_lifetime(false, 3600), 2880);
        assert_eq!(rekey_lifetime(true, 5), 4);
        assert_eq!(rekey_lifetime(false, 5), 3);
        assert_eq!(rekey_lifetime(false, 1), 0);
        assert_eq!(rekey_lifetime(true, 0), 0);
    }

    #[test]
    fn lookup_exact_and_create() {
        let mut fixture = Fixture::new();
        let registry = &mut fixture.registry;
        assert_eq!(registry.lookup(addr(LOCAL), addr(REMOTE), None, false), None);
        let id = registry
            .lookup(addr(LOCAL), addr(REMOTE), None, true)
            .unwrap();
        assert_eq!(registry.lookup(addr(LOCAL), addr(REMOTE), None, false), Some(id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_tolerates_nat_traversal_ports() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let registry = &mut fixture.registry;
        // Peer moved to 4500, session is still keyed on 500.
        assert_eq!(
            registry.lookup(
                addr("192.0.2.1:4500"),
                addr("198.51.100.7:4500"),
                None,
                false
            ),
            Some(session)
        );
        // Unrelated port is not an IKE port.
        assert_eq!(
            registry.lookup(
                addr("192.0.2.1:4500"),
                addr("198.51.100.7:61000"),
                None,
                false
            ),
            None
        );
    }

    #[test]
    fn lookup_floated_session() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let mut phase1 = fixture.phase1_handle(Side::Initiator, 1);
        phase1.local.set_port(4500);
        phase1.remote.set_port(4500);
        let phase1 = fixture
            .registry
            .link_phase1(session, phase1, fixture.now)
            .unwrap();
        fixture.registry.float_ports(phase1).unwrap();
        assert!(fixture.registry.session(session).unwrap().ports_floated());
        assert_eq!(
            fixture.registry.lookup(addr(LOCAL), addr(REMOTE), None, false),
            Some(session)
        );
    }

    #[test]
    fn lookup_wildcard_prefers_oldest() {
        let mut fixture = Fixture::new();
        let registry = &mut fixture.registry;
        let older = registry
            .lookup(addr("192.0.2.1:0"), addr("198.51.100.7:0"), None, true)
            .unwrap();
        let newer = registry
            .lookup(addr("192.0.2.1:0"), addr("198.51.100.7:0"), None, false)
            .unwrap();
        assert_eq!(older, newer);
        let second = registry.create_session(SessionKey::new(
            addr("192.0.2.1:0"),
            addr("198.51.100.7:0"),
        ));
        assert_ne!(second, older);
        assert_eq!(
            registry.lookup(addr(LOCAL), addr(REMOTE), None, false),
            Some(older)
        );
    }

    #[test]
    fn negotiation_timeout_unlinks_phase1() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let stalled = fixture.phase1(session, Side::Responder, 0x51);
        let now = fixture.now;
        fixture
            .registry
            .start_negotiation_timer(stalled, now)
            .unwrap();
        fixture.advance(PHASE1_NEGOTIATION_TIMEOUT.as_secs() - 1);
        assert!(fixture.registry.phase1(stalled).is_some());
        fixture.advance(2);
        assert!(fixture.registry.phase1(stalled).is_none());
        assert!(fixture.registry.is_empty());

        let session = fixture.session();
        let completed = fixture.phase1(session, Side::Responder, 0x52);
        let now = fixture.now;
        fixture
            .registry
            .start_negotiation_timer(completed, now)
            .unwrap();
        fixture.registry.phase1_established(completed, now).unwrap();
        fixture.advance(PHASE1_NEGOTIATION_TIMEOUT.as_secs() + 2);
        assert_eq!(
            fixture.registry.phase1(completed).unwrap().state,
            Phase1State::Established
        );
    }

    #[test]
    fn lookup_wildcard_skips_dying() {
        let mut fixture = Fixture::new();
        let registry = &mut fixture.registry;
        let wildcard = registry.create_session(SessionKey::new(
            addr("192.0.2.1:0"),
            addr("198.51.100.7:0"),
        ));
        assert_eq!(
            registry.lookup(addr(LOCAL), addr(REMOTE), None, false),
            Some(wildcard)
        );
        registry.sessions.get_mut(&wildcard).unwrap().is_dying = true;
        assert_eq!(registry.lookup(addr(LOCAL), addr(REMOTE), None, false), None);
        let created = registry
            .lookup(addr(LOCAL), addr(REMOTE), None, true)
            .unwrap();
        assert_ne!(created, wildcard);
        assert_eq!(registry.session(created).unwrap().key().remote, addr(REMOTE));
    }

    #[test]
    fn lookup_by_cookies_and_skips_stopped() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let phase1 = fixture.phase1(session, Side::Responder, 0x42);
        let cookies = fixture.registry.phase1(phase1).unwrap().index;
        // Any remote port is accepted when the cookies match.
        assert_eq!(
            fixture.registry.lookup(
                addr("192.0.2.1:4500"),
                addr("198.51.100.7:61000"),
                Some(&cookies),
                false
            ),
            Some(session)
        );
        let other = IsakmpIndex {
            initiator_cookie: 7,
            responder_cookie: 0,
        };
        assert_eq!(
            fixture
                .registry
                .lookup(addr(LOCAL), addr(REMOTE), Some(&other), false),
            None
        );

        fixture
            .registry
            .stopped_by_controller(session, StopReason::VpnDisconnect, fixture.now)
            .unwrap();
        let created = fixture
            .registry
            .lookup(addr(LOCAL), addr(REMOTE), None, true)
            .unwrap();
        assert_ne!(created, session);
    }

    #[test]
    fn link_marks_client_and_rekey() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let first = fixture.established_phase1(session, Side::Initiator, 1);
        let phase2 = fixture.established_phase2(first, Side::Initiator, 1);
        let second = fixture.phase1(session, Side::Initiator, 2);
        let registry = &fixture.registry;
        assert!(registry.session(session).unwrap().is_client());
        assert!(registry.session(session).unwrap().is_established());
        assert!(!registry.phase1(first).unwrap().is_rekey);
        assert!(registry.phase1(second).unwrap().is_rekey);
        assert_eq!(registry.bound_phase1(phase2), Some(first));
        assert_eq!(
            registry.session(session).unwrap().mode(),
            SessionMode::PureTunnel
        );
    }

    #[test]
    fn attach_rejects_other_phase1() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let first = fixture.established_phase1(session, Side::Initiator, 1);
        let second = fixture.established_phase1(session, Side::Initiator, 2);
        let phase2 = fixture.phase2(first, Side::Initiator, 1);
        assert!(fixture.registry.attach_phase2(first, phase2).is_ok());
        assert!(matches!(
            fixture.registry.attach_phase2(second, phase2),
            Err(SessionError::AlreadyBound(_))
        ));
        assert_eq!(fixture.registry.bound_phase1(phase2), Some(first));
    }

    #[test]
    fn session_freed_with_last_handle() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let phase1 = fixture.established_phase1(session, Side::Initiator, 1);
        let phase2 = fixture.established_phase2(phase1, Side::Initiator, 1);
        let now = fixture.now;

        fixture.registry.unlink_phase1(phase1, now).unwrap();
        assert!(fixture.registry.session(session).is_some());
        assert_eq!(fixture.registry.bound_phase1(phase2), None);
        fixture.registry.unlink_phase2(phase2, now).unwrap();
        assert!(fixture.registry.session(session).is_none());
        assert!(fixture.registry.is_empty());
    }

    #[test]
    fn unlink_moves_phase2_to_established_phase1() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let old = fixture.established_phase1(session, Side::Initiator, 1);
        let phase2 = fixture.established_phase2(old, Side::Initiator, 1);
        let new = fixture.established_phase1(session, Side::Initiator, 2);
        fixture.registry.unlink_phase1(old, fixture.now).unwrap();
        assert_eq!(fixture.registry.bound_phase1(phase2), Some(new));
    }

    #[test]
    fn rebind_refreshes_iv() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let first = fixture.established_phase1(session, Side::Initiator, 1);
        let second = fixture.phase1(session, Side::Initiator, 2);
        let phase2 = fixture.phase2(first, Side::Initiator, 1);
        fixture.registry.phase2_mut(phase2).unwrap().iv = Some(vec![0; 8]);

        // Not established yet: the IV cannot be derived.
        fixture.registry.rebind(second, phase2).unwrap();
        assert_eq!(fixture.registry.bound_phase1(phase2), Some(second));
        assert_eq!(fixture.registry.bound_phase2s(first), vec![]);
        assert_eq!(fixture.registry.phase2(phase2).unwrap().iv, None);

        fixture.registry.phase2_mut(phase2).unwrap().iv = Some(vec![0; 8]);
        fixture.registry.rebind(first, phase2).unwrap();
        let message_id = fixture.registry.phase2(phase2).unwrap().message_id;
        let mut expected = fixture.registry.phase1(first).unwrap().last_iv.clone();
        expected.extend_from_slice(&message_id.to_be_bytes());
        assert_eq!(fixture.registry.phase2(phase2).unwrap().iv, Some(expected));
    }

    #[test]
    fn update_binding_binds_unbound_phase2() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let first = fixture.established_phase1(session, Side::Initiator, 1);
        let phase2 = fixture.phase2(first, Side::Initiator, 1);
        fixture.registry.unbind(phase2).unwrap();
        fixture.registry.phase2_mut(phase2).unwrap().iv = Some(vec![7; 8]);

        assert_eq!(
            fixture.registry.update_phase2_binding(phase2).unwrap(),
            Some(first)
        );
        assert_eq!(fixture.registry.bound_phase1(phase2), Some(first));
        assert_eq!(
            fixture.registry.phase2(phase2).unwrap().iv,
            Some(vec![7; 8])
        );

        // Bound elsewhere: moved to the established phase 1 with a fresh IV.
        let second = fixture.phase1(session, Side::Initiator, 2);
        fixture.registry.rebind(second, phase2).unwrap();
        fixture.registry.phase2_mut(phase2).unwrap().iv = Some(vec![7; 8]);
        assert_eq!(
            fixture.registry.update_phase2_binding(phase2).unwrap(),
            Some(first)
        );
        assert_eq!(fixture.registry.bound_phase1(phase2), Some(first));
        let message_id = fixture.registry.phase2(phase2).unwrap().message_id;
        let mut expected = fixture.registry.phase1(first).unwrap().last_iv.clone();
        expected.extend_from_slice(&message_id.to_be_bytes());
        assert_eq!(fixture.registry.phase2(phase2).unwrap().iv, Some(expected));
    }

    #[test]
    fn replace_phase1_after_initiator_delay() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let old = fixture.established_phase1(session, Side::Initiator, 1);
        let phase2 = fixture.established_phase2(old, Side::Initiator, 1);
        let new = fixture.established_phase1(session, Side::Initiator, 2);
        fixture.take_events();

        fixture
            .registry
            .replace_other_phase1(new, old, fixture.now)
            .unwrap();
        assert!(fixture.registry.phase1(old).unwrap().is_dying);
        assert_eq!(fixture.registry.bound_phase1(phase2), Some(new));
        assert_eq!(fixture.registry.bound_phase2s(old), vec![]);

        fixture.advance(4);
        assert!(fixture.take_events().is_empty());
        fixture.advance(1);
        assert_eq!(fixture.take_events(), vec![format!("delete1 {old}")]);
        assert_eq!(
            fixture.registry.phase1(old).unwrap().state,
            Phase1State::Expired
        );
        fixture.advance(1);
        assert!(fixture.registry.phase1(old).is_none());
        assert_eq!(fixture.registry.bound_phase1(phase2), Some(new));
        assert!(fixture.registry.phase1(new).is_some());
    }

    #[test]
    fn replace_phase1_after_responder_delay() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let old = fixture.established_phase1(session, Side::Responder, 1);
        let new = fixture.established_phase1(session, Side::Responder, 2);
        fixture.take_events();
        assert!(!fixture.registry.session(session).unwrap().is_client());

        fixture
            .registry
            .cleanup_other_established_phase1s(new, fixture.now)
            .unwrap();
        fixture.advance(6);
        assert!(fixture.take_events().is_empty());
        fixture.advance(1);
        assert_eq!(fixture.take_events(), vec![format!("delete1 {old}")]);
        assert!(!fixture.registry.phase1(new).unwrap().is_dying);
    }

    #[test]
    fn client_leaves_replacement_to_itself() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let old = fixture.established_phase1(session, Side::Initiator, 1);
        let new = fixture.established_phase1(session, Side::Responder, 2);
        fixture
            .registry
            .replace_other_phase1(new, old, fixture.now)
            .unwrap();
        assert!(!fixture.registry.phase1(old).unwrap().is_dying);
        assert!(fixture
            .registry
            .replace_other_phase1(new, new, fixture.now)
            .is_err());
    }

    #[test]
    fn replace_phase2_with_same_policy() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let phase1 = fixture.established_phase1(session, Side::Initiator, 1);
        let old = fixture.established_phase2(phase1, Side::Initiator, 1);
        let unrelated = fixture.established_phase2(phase1, Side::Initiator, 2);
        let new = fixture.established_phase2(phase1, Side::Initiator, 1);
        fixture.take_events();
        fixture
            .registry
            .cleanup_other_established_phase2s(new, fixture.now)
            .unwrap();
        assert!(fixture.registry.phase2(old).unwrap().is_dying);
        assert!(!fixture.registry.phase2(unrelated).unwrap().is_dying);
        fixture.advance(3);
        assert_eq!(fixture.take_events()[0], format!("delete2 {old}"));
        assert!(fixture.registry.phase2(old).is_none());
    }

    #[test]
    fn cleanup_session() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let mut handle = fixture.phase1_handle(Side::Initiator, 1);
        handle.started_by_api = true;
        let phase1 = fixture
            .registry
            .link_phase1(session, handle, fixture.now)
            .unwrap();
        fixture
            .registry
            .phase1_established(phase1, fixture.now)
            .unwrap();
        let phase2 = fixture.established_phase2(phase1, Side::Initiator, 1);
        fixture.take_events();

        fixture
            .registry
            .cleanup(session, StopReason::Idle, fixture.now)
            .unwrap();
        assert_eq!(
            fixture.take_events(),
            vec![
                format!("delete2 {phase2}"),
                format!("delete1 {phase1}"),
                format!("failed idle timeout Local {REMOTE}"),
            ]
        );
        assert_eq!(
            fixture.registry.session(session).unwrap().stop_reason(),
            Some(StopReason::Idle)
        );
        fixture.advance(1);
        assert!(fixture.registry.is_empty());
    }

    #[test]
    fn controller_stop_by_address() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let now = fixture.now;
        assert_eq!(
            fixture.registry.sessions_stopped_by_controller(
                addr("198.51.100.7:4500"),
                true,
                StopReason::VpnDisconnect,
                now
            ),
            0
        );
        assert_eq!(
            fixture.registry.sessions_stopped_by_controller(
                addr("198.51.100.7:4500"),
                false,
                StopReason::VpnDisconnect,
                now
            ),
            1
        );
        fixture
            .registry
            .stopped_by_controller(session, StopReason::Flush, now)
            .unwrap();
        assert_eq!(
            fixture.registry.session(session).unwrap().stop_reason(),
            Some(StopReason::VpnDisconnect)
        );
    }

    #[test]
    fn purge_phase1s_reports_failure() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        fixture.phase1(session, Side::Initiator, 1);
        fixture
            .registry
            .purge_phase1s_by_session(session, fixture.now)
            .unwrap();
        assert_eq!(
            fixture.take_events(),
            vec![format!("failed no proposal chosen Remote {REMOTE}")]
        );
        assert!(fixture.registry.is_empty());
    }

    #[test]
    fn assert_removes_kernel_state() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let phase1 = fixture.established_phase1(session, Side::Initiator, 1);
        let phase2 = fixture.established_phase2(phase1, Side::Initiator, 1);
        fixture.take_events();

        fixture
            .registry
            .assert(addr(LOCAL), addr(REMOTE), fixture.now)
            .unwrap();
        let events = fixture.take_events();
        assert_eq!(events, vec!["kernel delete ESP 2 Some(Tunnel)".to_string()]);
        assert!(fixture.registry.session(session).unwrap().is_asserted());
        assert_eq!(fixture.registry.bound_phase1(phase2), None);
        assert_eq!(
            fixture.registry.phase2(phase2).unwrap().state,
            Phase2State::Expired
        );
        fixture.advance(10);
        // No deletes are sent to the peer for asserted SAs.
        assert!(fixture.take_events().is_empty());
        assert!(fixture.registry.is_empty());
    }

    #[test]
    fn phase2_retransmits_force_phase1_rekey() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let phase1 = fixture.established_phase1(session, Side::Initiator, 1);
        fixture.established_phase2(phase1, Side::Initiator, 1);
        let now = fixture.now;
        fixture
            .registry
            .schedule_phase1_rekey(phase1, Duration::from_secs(3000), now)
            .unwrap();
        let rekey = fixture.phase2(phase1, Side::Initiator, 1);
        assert!(fixture.registry.phase2(rekey).unwrap().is_rekey);
        fixture.take_events();

        let retry_counter = fixture.registry.phase1(phase1).unwrap().config.retry_counter;
        fixture.registry.phase2_mut(rekey).unwrap().retry_counter = retry_counter - 2;
        fixture.registry.phase2_retransmits(rekey, now).unwrap();
        fixture.advance(0);
        assert!(fixture.take_events().is_empty());

        fixture.registry.phase2_mut(rekey).unwrap().retry_counter = retry_counter - 3;
        fixture.registry.phase2_retransmits(rekey, now).unwrap();
        assert_eq!(fixture.registry.phase2(rekey).unwrap().retry_counter, 0);
        fixture.advance(0);
        assert_eq!(fixture.take_events(), vec![format!("rekey1 {phase1}")]);
    }

    #[test]
    fn installs_both_directions() {
        let mut fixture = Fixture::new();
        let session = fixture.session();
        let phase1 = fixture.established_phase1(session, Side::Initiator, 1);
        let phase2 = fixture.phase2(phase1, Side::Initiator, 1);
        fixture.take_events();
        fixture.registry.install_phase2_sas(phase2).unwrap();
        assert_eq!(
            fixture.take_events(),
            vec![
                "kernel push inbound ESP 1".to_string(),
                "kernel push outbound ESP 2".to_string()
            ]
        );
    }
}
