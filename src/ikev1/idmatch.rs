use log::debug;

use super::registry::SessionRegistry;
use super::session::{Phase2Handle, Phase2Id, Phase2State, SessionError};

const ID_IPV4_ADDR: u8 = 1;
const ID_IPV4_ADDR_SUBNET: u8 = 4;

// Identification payload body: type, protocol, port, then the address data.
const ID_HEADER_LENGTH: usize = 4;

fn id_port(id: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes(id.get(2..4)?.try_into().ok()?))
}

fn id_word(id: &[u8], offset: usize) -> Option<u32> {
    let start = ID_HEADER_LENGTH + offset;
    Some(u32::from_be_bytes(id.get(start..start + 4)?.try_into().ok()?))
}

/// True for an IPv4 address of 0.0.0.0 or the 0.0.0.0/0 subnet, ignoring protocol and port.
pub fn is_id_ipany(id: &[u8]) -> bool {
    match id.first() {
        Some(&ID_IPV4_ADDR) => id_word(id, 0) == Some(0),
        Some(&ID_IPV4_ADDR_SUBNET) => id_word(id, 0) == Some(0) && id_word(id, 4) == Some(0),
        _ => false,
    }
}

/// True for an IPv4 address identity with a wildcard port.
pub fn is_id_portany(id: &[u8]) -> bool {
    id.first() == Some(&ID_IPV4_ADDR) && id_port(id) == Some(0)
}

pub fn set_id_portany(id: &mut [u8]) {
    if id.first() == Some(&ID_IPV4_ADDR) {
        if let Some(port) = id.get_mut(2..4) {
            port.copy_from_slice(&[0, 0]);
        }
    }
}

fn ids_equal(a: &Option<Vec<u8>>, b: &Option<Vec<u8>>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a == b)
}

fn pair_equal(
    id: &Option<Vec<u8>>,
    id_p: &Option<Vec<u8>>,
    other: &Option<Vec<u8>>,
    other_p: &Option<Vec<u8>>,
) -> bool {
    ids_equal(id, other) && ids_equal(id_p, other_p)
}

/// Checks whether a new phase 2 carries the same traffic selectors as an older one.
///
/// Peers behind NAT may present either their own view of the addresses or the NAT-mapped
/// one during a rekey, so the identities are compared against both, and against a
/// wildcard-port variant when the older phase 2 learned wildcard-port NAT identities.
pub fn phase2_ids_match(new: &Phase2Handle, old: &Phase2Handle) -> bool {
    if pair_equal(&new.id, &new.id_p, &old.id, &old.id_p)
        || pair_equal(
            &new.ext_nat_id,
            &new.ext_nat_id_p,
            &old.ext_nat_id,
            &old.ext_nat_id_p,
        )
        || pair_equal(&new.id, &new.id_p, &old.ext_nat_id, &old.ext_nat_id_p)
        || pair_equal(&new.id, &new.id_p, &old.ext_nat_id, &old.id_p)
        || pair_equal(&new.id, &new.id_p, &old.id, &old.ext_nat_id_p)
    {
        return true;
    }

    let old_portany = old.ext_nat_id.as_deref().is_some_and(is_id_portany)
        || old.ext_nat_id_p.as_deref().is_some_and(is_id_portany);
    if !old_portany {
        return false;
    }
    let portany = |id: &Option<Vec<u8>>| {
        id.clone().map(|mut id| {
            set_id_portany(&mut id);
            id
        })
    };
    let portany_id = portany(&new.id);
    let portany_id_p = portany(&new.id_p);
    pair_equal(&portany_id, &portany_id_p, &old.ext_nat_id, &old.ext_nat_id_p)
        || pair_equal(&portany_id, &new.id_p, &old.ext_nat_id, &old.id_p)
        || pair_equal(&new.id, &portany_id_p, &old.id, &old.ext_nat_id_p)
}

impl SessionRegistry {
    // Newest other live phase 2 of the session that can lend its state to `id`.
    fn phase2_candidates<F>(&self, id: Phase2Id, usable: F) -> Result<Option<u64>, SessionError>
    where
        F: Fn(&Phase2Handle) -> bool,
    {
        let session = self
            .sessions
            .get(&id.session)
            .ok_or(SessionError::UnknownSession(id.session))?;
        let phase2 = session
            .phase2s
            .get(&id.index)
            .ok_or(SessionError::UnknownPhase2(id))?;
        if !session.is_client() || phase2.id.is_none() || phase2.id_p.is_none() {
            return Ok(None);
        }
        let ipany = phase2.id.as_deref().is_some_and(is_id_ipany)
            && phase2.id_p.as_deref().is_some_and(is_id_ipany);
        debug!("Phase 2 {} has wildcard identities: {}", id, ipany);

        let found = session.phase2s().find(|(index, candidate)| {
            *index != id.index
                && !candidate.is_dying
                && matches!(
                    candidate.state,
                    Phase2State::Established | Phase2State::Expired
                )
                && usable(*candidate)
                && (ipany || phase2_ids_match(phase2, *candidate))
        });
        Ok(found.map(|(index, _)| index))
    }

    /// Reuses the local policy of an earlier phase 2 with matching identities for a peer-initiated rekey.
    pub fn get_sainfo_r(&mut self, id: Phase2Id) -> Result<bool, SessionError> {
        let source = match self.phase2_candidates(id, |candidate| candidate.sainfo.is_some())? {
            Some(index) => index,
            None => return Ok(false),
        };
        let session = self
            .sessions
            .get_mut(&id.session)
            .ok_or(SessionError::UnknownSession(id.session))?;
        let (sainfo, policy_id, ext_nat_id, ext_nat_id_p) = match session.phase2s.get(&source) {
            Some(candidate) => (
                candidate.sainfo.clone(),
                candidate.policy_id,
                candidate.ext_nat_id.clone(),
                candidate.ext_nat_id_p.clone(),
            ),
            None => return Ok(false),
        };
        let phase2 = session
            .phase2s
            .get_mut(&id.index)
            .ok_or(SessionError::UnknownPhase2(id))?;
        debug!("Phase 2 {} adopts the policy of phase 2 {}", id, source);
        phase2.sainfo = sainfo;
        if phase2.policy_id == 0 {
            phase2.policy_id = policy_id;
        }
        if ext_nat_id.is_some() {
            phase2.ext_nat_id = ext_nat_id;
        }
        if ext_nat_id_p.is_some() {
            phase2.ext_nat_id_p = ext_nat_id_p;
        }
        Ok(true)
    }

    /// Proposes the approved SA of an earlier phase 2 with matching identities.
    pub fn get_proposal_r(&mut self, id: Phase2Id) -> Result<bool, SessionError> {
        let source = match self.phase2_candidates(id, |candidate| candidate.approval.is_some())? {
            Some(index) => index,
            None => return Ok(false),
        };
        let session = self
            .sessions
            .get_mut(&id.session)
            .ok_or(SessionError::UnknownSession(id.session))?;
        let (approval, policy_id) = match session.phase2s.get(&source) {
            Some(candidate) => (candidate.approval.clone(), candidate.policy_id),
            None => return Ok(false),
        };
        let phase2 = session
            .phase2s
            .get_mut(&id.index)
            .ok_or(SessionError::UnknownPhase2(id))?;
        debug!("Phase 2 {} proposes the SA of phase 2 {}", id, source);
        phase2.proposal = approval;
        if phase2.policy_id == 0 {
            phase2.policy_id = policy_id;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::session::{Phase2Kind, SaInfo, Side};
    use super::super::testing::{tunnel_bundle, Fixture, LOCAL, REMOTE};
    use super::*;

    fn ipv4_id(addr: [u8; 4], port: u16) -> Vec<u8> {
        let mut id = vec![ID_IPV4_ADDR, 17];
        id.extend_from_slice(&port.to_be_bytes());
        id.extend_from_slice(&addr);
        id
    }

    fn subnet_id(addr: [u8; 4], mask: [u8; 4]) -> Vec<u8> {
        let mut id = vec![ID_IPV4_ADDR_SUBNET, 0, 0, 0];
        id.extend_from_slice(&addr);
        id.extend_from_slice(&mask);
        id
    }

    fn handle(id: Vec<u8>, id_p: Vec<u8>) -> Phase2Handle {
        let mut phase2 = Phase2Handle::new(
            Side::Responder,
            Phase2Kind::SecurityAssociation,
            LOCAL.parse().unwrap(),
            REMOTE.parse().unwrap(),
            0,
            7,
        );
        phase2.id = Some(id);
        phase2.id_p = Some(id_p);
        phase2
    }

    #[test]
    fn wildcard_identities() {
        assert!(is_id_ipany(&ipv4_id([0, 0, 0, 0], 1701)));
        assert!(!is_id_ipany(&ipv4_id([10, 0, 0, 1], 0)));
        assert!(is_id_ipany(&subnet_id([0, 0, 0, 0], [0, 0, 0, 0])));
        assert!(!is_id_ipany(&subnet_id([0, 0, 0, 0], [255, 0, 0, 0])));
        assert!(!is_id_ipany(&[ID_IPV4_ADDR, 0]));

        let mut id = ipv4_id([10, 0, 0, 1], 1701);
        assert!(!is_id_portany(&id));
        set_id_portany(&mut id);
        assert!(is_id_portany(&id));
        assert_eq!(id, ipv4_id([10, 0, 0, 1], 0));

        let mut subnet = subnet_id([10, 0, 0, 0], [255, 0, 0, 0]);
        set_id_portany(&mut subnet);
        assert!(!is_id_portany(&subnet));
    }

    #[test]
    fn matches_nat_mapped_identities() {
        let client = ipv4_id([192, 168, 1, 10], 1701);
        let server = ipv4_id([198, 51, 100, 7], 1701);
        let mapped = ipv4_id([203, 0, 113, 5], 1701);

        let old = handle(client.clone(), server.clone());
        assert!(phase2_ids_match(&handle(client.clone(), server.clone()), &old));
        assert!(!phase2_ids_match(&handle(mapped.clone(), server.clone()), &old));

        let mut old = handle(client.clone(), server.clone());
        old.ext_nat_id = Some(mapped.clone());
        assert!(phase2_ids_match(&handle(mapped.clone(), server.clone()), &old));

        let mut new = handle(client.clone(), server.clone());
        new.ext_nat_id = Some(mapped.clone());
        new.ext_nat_id_p = Some(server.clone());
        let mut old = handle(ipv4_id([10, 0, 0, 1], 1701), server.clone());
        old.ext_nat_id = Some(mapped);
        old.ext_nat_id_p = Some(server);
        assert!(phase2_ids_match(&new, &old));
    }

    #[test]
    fn matches_wildcard_port_identities() {
        let client = ipv4_id([192, 168, 1, 10], 4500);
        let server = ipv4_id([198, 51, 100, 7], 1701);
        let mut old = handle(ipv4_id([10, 0, 0, 1], 1701), server.clone());
        old.ext_nat_id = Some(ipv4_id([192, 168, 1, 10], 0));
        assert!(phase2_ids_match(&handle(client.clone(), server.clone()), &old));

        old.ext_nat_id = Some(ipv4_id([192, 168, 1, 11], 0));
        assert!(!phase2_ids_match(&handle(client, server), &old));
    }

    fn established_with_ids(fixture: &mut Fixture) -> (Phase2Id, Phase2Id) {
        let session = fixture.session();
        let phase1 = fixture.established_phase1(session, Side::Initiator, 1);
        let old = fixture.established_phase2(phase1, Side::Initiator, 9);
        let phase2 = fixture.registry.phase2_mut(old).unwrap();
        phase2.id = Some(ipv4_id([10, 0, 0, 1], 1701));
        phase2.id_p = Some(ipv4_id([198, 51, 100, 7], 1701));
        phase2.ext_nat_id = Some(ipv4_id([203, 0, 113, 5], 1701));
        phase2.sainfo = Some(Arc::new(SaInfo {
            name: "l2tp".to_string(),
            bundles: vec![tunnel_bundle()],
        }));

        let new = fixture.phase2(phase1, Side::Responder, 0);
        let phase2 = fixture.registry.phase2_mut(new).unwrap();
        phase2.proposal = None;
        phase2.approval = None;
        phase2.id = Some(ipv4_id([10, 0, 0, 1], 1701));
        phase2.id_p = Some(ipv4_id([198, 51, 100, 7], 1701));
        (old, new)
    }

    #[test]
    fn responder_rekey_adopts_policy() {
        let mut fixture = Fixture::new();
        let (old, new) = established_with_ids(&mut fixture);
        assert!(fixture.registry.get_sainfo_r(new).unwrap());
        let registry = &fixture.registry;
        let phase2 = registry.phase2(new).unwrap();
        assert_eq!(phase2.sainfo, registry.phase2(old).unwrap().sainfo);
        assert_eq!(phase2.policy_id, 9);
        assert_eq!(phase2.ext_nat_id, Some(ipv4_id([203, 0, 113, 5], 1701)));

        assert!(fixture.registry.get_proposal_r(new).unwrap());
        assert_eq!(
            fixture.registry.phase2(new).unwrap().proposal,
            Some(tunnel_bundle())
        );
    }

    #[test]
    fn no_reuse_for_unknown_identities() {
        let mut fixture = Fixture::new();
        let (old, new) = established_with_ids(&mut fixture);
        fixture.registry.phase2_mut(new).unwrap().id = Some(ipv4_id([10, 0, 0, 2], 1701));
        assert!(!fixture.registry.get_sainfo_r(new).unwrap());

        // Wildcard identities match any established phase 2.
        fixture.registry.phase2_mut(new).unwrap().id = Some(ipv4_id([0, 0, 0, 0], 0));
        fixture.registry.phase2_mut(new).unwrap().id_p = Some(subnet_id([0; 4], [0; 4]));
        assert!(fixture.registry.get_sainfo_r(new).unwrap());

        fixture.registry.phase2_mut(old).unwrap().is_dying = true;
        fixture.registry.phase2_mut(new).unwrap().sainfo = None;
        assert!(!fixture.registry.get_sainfo_r(new).unwrap());
    }
}
