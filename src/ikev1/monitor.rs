use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::crypto::IpsecProtocol;
use super::kernel::{Direction, SaStats};
use super::registry::{RekeyType, SessionRegistry};
use super::scheduler::{Scheduler, TimerEvent};
use super::session::{Session, SessionError, SessionId, SessionMode, StopReason};
use super::{DpdAlgorithm, IdleDirection, RemoteConfig};

pub const XAUTH_TIMEOUT: Duration = Duration::from_secs(300);

/// Traffic polling period for a monitored interval: a twentieth of it, at least 3 seconds.
pub fn sample_period(interval: Duration) -> Duration {
    let interval = interval.as_secs();
    let mut period = interval / 20;
    if period < 3 {
        period = 3;
        if interval < period * 2 {
            period = 1;
        }
    }
    Duration::from_secs(period)
}

pub(super) fn init_traffic_params(session: &mut Session, config: &RemoteConfig) {
    let idle = Duration::from_secs(config.idle_timeout.into());
    let dpd = Duration::from_secs(config.dpd_interval.into());
    if idle.is_zero() && dpd.is_zero() {
        return;
    }
    let traffic = &mut session.traffic;
    if traffic.idle_interval.is_zero() {
        traffic.idle_interval = idle;
        if !idle.is_zero() {
            traffic.idle_direction = Some(config.idle_direction);
        }
    }
    if !traffic.monitor_interval.is_zero() {
        return;
    }
    let detects_by_traffic = matches!(
        config.dpd_algorithm,
        DpdAlgorithm::InboundDetect | DpdAlgorithm::BlackholeDetect
    );
    let (min, max) = if !dpd.is_zero() && detects_by_traffic {
        (dpd.min(idle), dpd.max(idle))
    } else if !idle.is_zero() {
        (idle, idle)
    } else {
        return;
    };
    let interval = if min.is_zero() { max } else { min };
    traffic.monitor_interval = sample_period(interval);
    debug!(
        "Session {} polls traffic every {:?}, idle after {:?}",
        session.id, traffic.monitor_interval, traffic.idle_interval
    );
}

pub(super) fn start_traffic_monitor(session: &mut Session, scheduler: &mut Scheduler, now: Instant) {
    let traffic = &mut session.traffic;
    if !traffic.monitor_interval.is_zero() {
        traffic.monitor_timer = Some(scheduler.schedule(
            now,
            traffic.monitor_interval,
            TimerEvent::TrafficMonitor(session.id),
        ));
    }
    if !traffic.idle_interval.is_zero() {
        traffic.idle_timer = Some(scheduler.schedule(
            now,
            traffic.idle_interval,
            TimerEvent::IdleTimeout(session.id),
        ));
    }
}

pub(super) fn start_xauth_timer(session: &mut Session, scheduler: &mut Scheduler, now: Instant) {
    if session.is_client && session.mode == SessionMode::CiscoIpsec && session.xauth_timer.is_none()
    {
        session.xauth_timer =
            Some(scheduler.schedule(now, XAUTH_TIMEOUT, TimerEvent::XauthTimeout(session.id)));
    }
}

/// SPIs of the established ESP SAs, as known by the kernel in `direction`.
pub(super) fn sas_for_stats(session: &Session, direction: Direction) -> Vec<u32> {
    session
        .phase2s()
        .filter_map(|(_, phase2)| phase2.approval.as_ref())
        .flat_map(|approval| approval.protocols.iter())
        .filter(|protocol| protocol.accepted && protocol.protocol == IpsecProtocol::Esp)
        .map(|protocol| match direction {
            Direction::Inbound => protocol.spi,
            Direction::Outbound => protocol.spi_p,
        })
        .collect()
}

fn monitor_idle(session: &mut Session, scheduler: &mut Scheduler, now: Instant) {
    let traffic = &mut session.traffic;
    let direction = match traffic.idle_direction {
        Some(direction) => direction,
        None => return,
    };
    let peer_active = traffic.peer_sent_data_idle
        && matches!(direction, IdleDirection::Inbound | IdleDirection::Any);
    let self_active = traffic.self_sent_data_idle
        && matches!(direction, IdleDirection::Outbound | IdleDirection::Any);
    if !peer_active && !self_active {
        return;
    }
    if !traffic.idle_interval.is_zero() {
        traffic.idle_timer = Some(scheduler.schedule(
            now,
            traffic.idle_interval,
            TimerEvent::IdleTimeout(session.id),
        ));
    }
    traffic.peer_sent_data_idle = false;
    traffic.self_sent_data_idle = false;
}

fn record_traffic(
    session: &mut Session,
    scheduler: &mut Scheduler,
    direction: Direction,
    stats: &[SaStats],
    now: Instant,
) {
    if !session.established || session.is_stopped() {
        info!(
            "Dropping {} traffic stats of session {}, it is not running",
            direction, session.id
        );
        return;
    }
    let traffic = &mut session.traffic;
    let last_poll = match direction {
        Direction::Inbound => &mut traffic.inbound_last_poll,
        Direction::Outbound => &mut traffic.outbound_last_poll,
    };
    let active = stats.iter().any(|stat| {
        match last_poll.iter().find(|previous| previous.spi == stat.spi) {
            Some(previous) => previous.bytes != stat.bytes,
            None => stat.bytes != 0,
        }
    });
    *last_poll = stats.to_vec();
    if active {
        match direction {
            Direction::Inbound => {
                traffic.peer_sent_data_dpd = true;
                traffic.peer_sent_data_idle = true;
            }
            Direction::Outbound => {
                traffic.self_sent_data_dpd = true;
                traffic.self_sent_data_idle = true;
            }
        }
        session.last_time_data_detected = Some(now);
    }
    monitor_idle(session, scheduler, now);
}

impl Session {
    /// A rekey is pointless for a tunnel without recent traffic, or for a phase 1 with no phase 2 to protect.
    pub fn should_drop_rekey(&self, rekey_type: RekeyType, now: Instant) -> bool {
        if self.mode == SessionMode::PureTunnel {
            let traffic = &self.traffic;
            if let Some(last_data) = self.last_time_data_detected {
                if !traffic.monitor_interval.is_zero() && !traffic.idle_interval.is_zero() {
                    let quiet = now.saturating_duration_since(last_data);
                    if quiet > traffic.monitor_interval * 2 {
                        info!(
                            "Session {} had no traffic for {:?}, dropping rekey",
                            self.id, quiet
                        );
                        return true;
                    }
                }
            }
            false
        } else {
            rekey_type == RekeyType::Phase1
                && !self.has_negotiating_phase2()
                && !self.has_established_phase2()
        }
    }
}

impl SessionRegistry {
    pub fn sas_for_stats(&self, id: SessionId, direction: Direction) -> Vec<u32> {
        self.sessions
            .get(&id)
            .map(|session| sas_for_stats(session, direction))
            .unwrap_or_default()
    }

    /// Feeds a kernel traffic report into idle and dead peer detection.
    pub fn update_traffic_idle_status(
        &mut self,
        id: SessionId,
        direction: Direction,
        stats: &[SaStats],
        now: Instant,
    ) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        record_traffic(session, &mut self.scheduler, direction, stats, now);
        Ok(())
    }

    pub(super) fn traffic_cop(&mut self, id: SessionId, now: Instant) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        session.traffic.monitor_timer = None;
        if !session.established || session.is_stopped() {
            warn!("Traffic monitor of session {} fired while it is not running", id);
            return Ok(());
        }
        for direction in [Direction::Inbound, Direction::Outbound] {
            let spis = sas_for_stats(session, direction);
            if spis.is_empty() {
                continue;
            }
            match self.kernel.poll_stats(direction, &spis) {
                Ok(stats) => record_traffic(session, &mut self.scheduler, direction, &stats, now),
                Err(err) => warn!("Failed to poll {} stats of session {}: {}", direction, id, err),
            }
        }
        let interval = session.traffic.monitor_interval;
        if !interval.is_zero() {
            session.traffic.monitor_timer = Some(self.scheduler.schedule(
                now,
                interval,
                TimerEvent::TrafficMonitor(id),
            ));
        }
        Ok(())
    }

    pub(super) fn idle_timeout(&mut self, id: SessionId, now: Instant) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        session.traffic.idle_timer = None;
        info!(
            "IKE session {} with {} idle for {:?}",
            id, session.key.remote, session.traffic.idle_interval
        );
        self.cleanup(id, StopReason::Idle, now)
    }

    pub(super) fn xauth_timeout(&mut self, id: SessionId, now: Instant) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::UnknownSession(id))?;
        session.xauth_timer = None;
        if session.has_established_phase2() {
            session.xauth_timer =
                Some(self.scheduler.schedule(now, XAUTH_TIMEOUT, TimerEvent::XauthTimeout(id)));
            return Ok(());
        }
        info!(
            "IKE session {} with {} timed out waiting for XAUTH",
            id, session.key.remote
        );
        self.cleanup(id, StopReason::XauthTimeout, now)
    }

    /// Re-evaluates sessions after a system wake: tears down stale ones and restarts lapsed timers.
    pub fn sweep_sleepwake(&mut self, now: Instant) {
        let ids = self.sessions.keys().rev().copied().collect::<Vec<_>>();
        for id in ids {
            let session = match self.sessions.get_mut(&id) {
                Some(session) if !session.is_dying => session,
                _ => continue,
            };
            session.xauth_timer = None;
            if session.is_asserted {
                session.traffic.monitor_timer = None;
                session.traffic.idle_timer = None;
                continue;
            }
            if session.is_stopped()
                || (!session.has_established_phase1() && !session.has_established_phase2())
            {
                if let Err(err) = self.cleanup(id, StopReason::SleepWake, now) {
                    warn!("Failed to clean up session {} after wake: {}", id, err);
                }
                continue;
            }
            let traffic = &mut session.traffic;
            let monitor_lapsed = traffic
                .monitor_timer
                .as_ref()
                .is_some_and(|timer| timer.deadline() <= now);
            if monitor_lapsed && !traffic.monitor_interval.is_zero() {
                traffic.monitor_timer = Some(self.scheduler.schedule(
                    now,
                    traffic.monitor_interval,
                    TimerEvent::TrafficMonitor(id),
                ));
            }
            let idle_lapsed = traffic
                .idle_timer
                .as_ref()
                .is_some_and(|timer| timer.deadline() <= now);
            if idle_lapsed && !traffic.idle_interval.is_zero() {
                traffic.idle_timer = Some(self.scheduler.schedule(
                    now,
                    traffic.idle_interval,
                    TimerEvent::IdleTimeout(id),
                ));
            }
        }
    }
}
