use std::{fmt, net::SocketAddr};

use log::{info, warn};

use super::session::{Phase1Handle, Phase1Id, Phase2Handle, Phase2Id};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FailureCode {
    IdleTimeout,
    InternalError,
    NoProposalChosen,
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCode::IdleTimeout => write!(f, "idle timeout"),
            FailureCode::InternalError => write!(f, "internal error"),
            FailureCode::NoProposalChosen => write!(f, "no proposal chosen"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FailureSource {
    Local,
    Remote,
}

/// Outbound side effects of session lifecycle changes: peer notifications,
/// rekey requests and status pushes to the VPN controller.
pub trait Notifier {
    fn send_phase1_delete(&mut self, id: Phase1Id, phase1: &Phase1Handle);

    fn send_phase2_delete(&mut self, id: Phase2Id, phase2: &Phase2Handle);

    fn initiate_phase1_rekey(&mut self, id: Phase1Id, phase1: &Phase1Handle);

    fn ike_failed(&mut self, code: FailureCode, source: FailureSource, remote: SocketAddr);

    fn phase1_established(&mut self, id: Phase1Id, phase1: &Phase1Handle);

    fn phase2_established(&mut self, id: Phase2Id, phase2: &Phase2Handle);
}

pub struct LoggingNotifier {}

impl Notifier for LoggingNotifier {
    fn send_phase1_delete(&mut self, id: Phase1Id, phase1: &Phase1Handle) {
        info!(
            "Sending delete for ISAKMP-SA {} {}-{}",
            id, phase1.local, phase1.remote
        );
    }

    fn send_phase2_delete(&mut self, id: Phase2Id, phase2: &Phase2Handle) {
        info!(
            "Sending delete for IPsec-SA {} {}-{}",
            id, phase2.src, phase2.dst
        );
    }

    fn initiate_phase1_rekey(&mut self, id: Phase1Id, phase1: &Phase1Handle) {
        info!("Rekeying ISAKMP-SA {} with {}", id, phase1.remote);
    }

    fn ike_failed(&mut self, code: FailureCode, source: FailureSource, remote: SocketAddr) {
        warn!("IKE failed with {}: {} ({:?})", remote, code, source);
    }

    fn phase1_established(&mut self, id: Phase1Id, phase1: &Phase1Handle) {
        info!("ISAKMP-SA {} established with {}", id, phase1.remote);
    }

    fn phase2_established(&mut self, id: Phase2Id, phase2: &Phase2Handle) {
        info!("IPsec-SA {} established with {}", id, phase2.dst);
    }
}
