use std::{collections::BTreeMap, error, fmt};

use log::{debug, info, trace, warn};

use super::crypto::{
    AuthMethod, CryptoError, DhGroup, DhParams, EncapsulationMode, EncryptionAlgorithm,
    EspTransform, HashAlgorithm, IpsecAuth, IpsecProtocol, IpsecTransform,
};
use super::message::{
    self, FormatError, Proposal, SecurityAssociation, Transform, IPSEC_DOI,
    PROPOSAL_HEADER_LENGTH, SITUATION_IDENTITY_ONLY, TRANSFORM_HEADER_LENGTH,
};
use super::RemoteConfig;

pub const DEFAULT_LIFETIME: u32 = 28800;
pub const LIFEBYTE_UNLIMITED: u32 = 0x7fff_ffff;

const PROTOCOL_ISAKMP: u8 = 1;
const TRANSFORM_KEY_IKE: u8 = 1;
const NEXT_PAYLOAD_PROPOSAL: u8 = 2;
const NEXT_PAYLOAD_TRANSFORM: u8 = 3;
const NEXT_PAYLOAD_NONE: u8 = 0;

const LIFE_TYPE_SECONDS: u16 = 1;
const LIFE_TYPE_KILOBYTES: u16 = 2;

#[derive(Clone, Copy, PartialEq, Eq)]
struct OakleyAttribute(u16);

impl OakleyAttribute {
    const ENCRYPTION: OakleyAttribute = OakleyAttribute(1);
    const HASH: OakleyAttribute = OakleyAttribute(2);
    const AUTH_METHOD: OakleyAttribute = OakleyAttribute(3);
    const GROUP_DESCRIPTION: OakleyAttribute = OakleyAttribute(4);
    const GROUP_TYPE: OakleyAttribute = OakleyAttribute(5);
    const GROUP_PRIME: OakleyAttribute = OakleyAttribute(6);
    const GROUP_GENERATOR_ONE: OakleyAttribute = OakleyAttribute(7);
    const GROUP_GENERATOR_TWO: OakleyAttribute = OakleyAttribute(8);
    const GROUP_CURVE_A: OakleyAttribute = OakleyAttribute(9);
    const GROUP_CURVE_B: OakleyAttribute = OakleyAttribute(10);
    const LIFE_TYPE: OakleyAttribute = OakleyAttribute(11);
    const LIFE_DURATION: OakleyAttribute = OakleyAttribute(12);
    const PRF: OakleyAttribute = OakleyAttribute(13);
    const KEY_LENGTH: OakleyAttribute = OakleyAttribute(14);
    const FIELD_SIZE: OakleyAttribute = OakleyAttribute(15);
    const GROUP_ORDER: OakleyAttribute = OakleyAttribute(16);
    const GSS_ID: OakleyAttribute = OakleyAttribute(16384);

    const GROUP_TYPE_MODP: u16 = 1;

    // RFC 2409, Appendix A: these classes are always basic (TV) encoded.
    fn must_be_basic(&self) -> bool {
        matches!(
            *self,
            Self::ENCRYPTION
                | Self::HASH
                | Self::AUTH_METHOD
                | Self::GROUP_DESCRIPTION
                | Self::GROUP_TYPE
                | Self::LIFE_TYPE
                | Self::PRF
                | Self::KEY_LENGTH
                | Self::FIELD_SIZE
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct IpsecAttribute(u16);

impl IpsecAttribute {
    const LIFE_TYPE: IpsecAttribute = IpsecAttribute(1);
    const LIFE_DURATION: IpsecAttribute = IpsecAttribute(2);
    const GROUP_DESCRIPTION: IpsecAttribute = IpsecAttribute(3);
    const ENCAPSULATION_MODE: IpsecAttribute = IpsecAttribute(4);
    const AUTH: IpsecAttribute = IpsecAttribute(5);
    const KEY_LENGTH: IpsecAttribute = IpsecAttribute(6);
    const KEY_ROUNDS: IpsecAttribute = IpsecAttribute(7);
    const COMPRESS_DICTIONARY_SIZE: IpsecAttribute = IpsecAttribute(8);
    const COMPRESS_PRIVATE_ALGORITHM: IpsecAttribute = IpsecAttribute(9);
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NegotiationPhase {
    Phase1,
    Phase2,
}

/// How the peer's lifetimes are reconciled with local policy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CheckLevel {
    Obey,
    Strict,
    Claim,
    Exact,
}

impl CheckLevel {
    pub fn reconcile(self, peer: Lifetimes, local: Lifetimes) -> Option<Lifetimes> {
        match self {
            CheckLevel::Obey => Some(peer),
            CheckLevel::Strict => {
                if peer.seconds > local.seconds || peer.kilobytes > local.kilobytes {
                    None
                } else {
                    Some(peer)
                }
            }
            CheckLevel::Claim => Some(Lifetimes {
                seconds: peer.seconds.min(local.seconds),
                kilobytes: peer.kilobytes.min(local.kilobytes),
            }),
            CheckLevel::Exact => {
                if peer == local {
                    Some(local)
                } else {
                    None
                }
            }
        }
    }
}

impl fmt::Display for CheckLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckLevel::Obey => write!(f, "obey"),
            CheckLevel::Strict => write!(f, "strict"),
            CheckLevel::Claim => write!(f, "claim"),
            CheckLevel::Exact => write!(f, "exact"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Lifetimes {
    pub seconds: u32,
    pub kilobytes: u32,
}

impl Default for Lifetimes {
    fn default() -> Lifetimes {
        Lifetimes {
            seconds: DEFAULT_LIFETIME,
            kilobytes: 0,
        }
    }
}

/// Phase 1 transform parameters, both as configured locally and as approved.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct IsakmpSa {
    pub prop_no: u8,
    pub trns_no: u8,
    pub encryption: EncryptionAlgorithm,
    pub key_length: u16,
    pub hash: HashAlgorithm,
    pub auth_method: AuthMethod,
    pub dh_group: DhGroup,
    pub lifetimes: Lifetimes,
}

impl fmt::Display for IsakmpSa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encryption)?;
        if self.key_length != 0 {
            write!(f, "-{}", self.key_length)?;
        }
        write!(
            f,
            " {} {} {} lifetime {}s",
            self.hash, self.dh_group, self.auth_method, self.lifetimes.seconds
        )
    }
}

pub struct Phase1Approval {
    pub sa: IsakmpSa,
    pub dh_params: DhParams,
    pub sa_payload: Vec<u8>,
}

#[derive(Default, Debug)]
struct PeerIsakmpSa {
    trns_no: u8,
    encryption: Option<EncryptionAlgorithm>,
    key_length: u16,
    hash: Option<HashAlgorithm>,
    auth_method: Option<AuthMethod>,
    dh_group: Option<DhGroup>,
    prime: Option<Vec<u8>>,
    generator: Option<u32>,
    lifetimes: Lifetimes,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SaTransform {
    pub trns_no: u8,
    pub transform: IpsecTransform,
    pub key_length: u16,
    pub auth: Option<IpsecAuth>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SaProtocol {
    pub protocol: IpsecProtocol,
    pub mode: EncapsulationMode,
    // Inbound SPI, allocated locally.
    pub spi: u32,
    // Outbound SPI, chosen by the peer.
    pub spi_p: u32,
    pub accepted: bool,
    pub transforms: Vec<SaTransform>,
}

/// A phase 2 bundle: protocols that must be negotiated together.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SaProposal {
    pub prop_no: u8,
    pub lifetimes: Lifetimes,
    pub pfs_group: Option<DhGroup>,
    pub protocols: Vec<SaProtocol>,
}

impl SaProposal {
    pub fn has_transport(&self) -> bool {
        self.protocols.iter().any(|p| p.mode.is_transport())
    }

    pub fn all_transport(&self) -> bool {
        !self.protocols.is_empty() && self.protocols.iter().all(|p| p.mode.is_transport())
    }
}

pub struct Phase2Approval {
    pub approval: SaProposal,
    pub sa_payload: Vec<u8>,
}

struct PeerIpsecTransform {
    trns_no: u8,
    transform: IpsecTransform,
    mode: Option<EncapsulationMode>,
    auth: Option<IpsecAuth>,
    key_length: u16,
    pfs_group: Option<DhGroup>,
    lifetimes: Lifetimes,
}

pub struct ProposalPair<'a> {
    pub proposal: Proposal<'a>,
    pub transforms: Vec<Transform<'a>>,
}

/// Proposals sharing a proposal number form one bundle, kept in encounter order.
pub struct ProposalGroup<'a> {
    pub number: u8,
    pub pairs: Vec<ProposalPair<'a>>,
}

type ChosenPair<'a> = (Proposal<'a>, Transform<'a>);

pub fn get_proposal_pairs(
    sa_payload: &[u8],
    phase: NegotiationPhase,
) -> Result<(SecurityAssociation, Vec<ProposalGroup>), NegotiationError> {
    let sa = SecurityAssociation::from_payload(sa_payload)?;
    // Proposal number is a u8, so the group table is bounded at 256 entries.
    let mut groups: BTreeMap<u8, Option<ProposalGroup>> = BTreeMap::new();
    for proposal in sa.iter_proposals() {
        let proposal = proposal?;
        trace!(
            "Proposal #{} protocol {} SPI size {} transforms {}",
            proposal.proposal_num(),
            proposal.protocol_id(),
            proposal.spi_size(),
            proposal.num_transforms()
        );
        if !check_protocol(phase, proposal.protocol_id()) {
            continue;
        }
        if !check_spi_size(proposal.protocol_id(), proposal.spi_size()) {
            continue;
        }
        let mut transforms = vec![];
        for transform in proposal.iter_transforms() {
            let transform = transform?;
            match check_transform(proposal.protocol_id(), &transform) {
                Ok(()) => transforms.push(transform),
                Err(err) => debug!(
                    "Skipping transform #{} of proposal #{}: {}",
                    transform.transform_num(),
                    proposal.proposal_num(),
                    err
                ),
            }
        }
        if transforms.len() != proposal.num_transforms() as usize {
            debug!(
                "Proposal #{} declares {} transforms, {} accepted",
                proposal.proposal_num(),
                proposal.num_transforms(),
                transforms.len()
            );
        }
        let group = groups.entry(proposal.proposal_num()).or_insert_with(|| {
            Some(ProposalGroup {
                number: proposal.proposal_num(),
                pairs: vec![],
            })
        });
        if transforms.is_empty() {
            debug!(
                "Proposal #{} protocol {} has no acceptable transforms, dropping bundle",
                proposal.proposal_num(),
                proposal.protocol_id()
            );
            *group = None;
        } else if let Some(group) = group {
            group.pairs.push(ProposalPair {
                proposal,
                transforms,
            });
        }
    }
    let groups = groups
        .into_values()
        .flatten()
        .filter(|group| !group.pairs.is_empty())
        .collect::<Vec<_>>();
    if groups.is_empty() {
        debug!("No proposal found in SA payload");
        return Err(NegotiationError::NoProposalChosen);
    }
    Ok((sa, groups))
}

fn check_protocol(phase: NegotiationPhase, protocol_id: u8) -> bool {
    let valid = match phase {
        NegotiationPhase::Phase1 => protocol_id == PROTOCOL_ISAKMP,
        NegotiationPhase::Phase2 => IpsecProtocol::from_u8(protocol_id).is_some(),
    };
    if !valid {
        debug!("Illegal protocol id {} in {:?}", protocol_id, phase);
    }
    valid
}

fn check_spi_size(protocol_id: u8, spi_size: u8) -> bool {
    if protocol_id == PROTOCOL_ISAKMP {
        if spi_size != 0 {
            warn!("SPI size isn't zero, but IKE proposal");
        }
        return true;
    }
    match IpsecProtocol::from_u8(protocol_id) {
        Some(IpsecProtocol::Ah) | Some(IpsecProtocol::Esp) if spi_size == 4 => true,
        Some(IpsecProtocol::Ipcomp) if spi_size == 2 || spi_size == 4 => true,
        _ => {
            debug!(
                "Invalid SPI size {} for protocol {}",
                spi_size, protocol_id
            );
            false
        }
    }
}

fn check_transform(protocol_id: u8, transform: &Transform) -> Result<(), NegotiationError> {
    if protocol_id == PROTOCOL_ISAKMP {
        if transform.transform_id() != TRANSFORM_KEY_IKE {
            debug!(
                "Invalid transform-id {} in ISAKMP proposal",
                transform.transform_id()
            );
            return Err("Invalid ISAKMP transform-id".into());
        }
        return check_isakmp_attributes(transform);
    }
    let protocol = IpsecProtocol::from_u8(protocol_id).ok_or("Invalid protocol id")?;
    let ipsec_transform = IpsecTransform::from_u8(protocol, transform.transform_id())?;
    check_ipsec_attributes(protocol, ipsec_transform, transform)
}

fn check_isakmp_attributes(transform: &Transform) -> Result<(), NegotiationError> {
    for attribute in transform.iter_attributes() {
        let attribute = attribute?;
        let attribute_type = OakleyAttribute(attribute.attribute_type);
        if attribute_type.must_be_basic() && !attribute.is_basic() {
            debug!("Oakley attribute {} must be TV", attribute.attribute_type);
            return Err("Oakley attribute must be TV".into());
        }
        if let message::AttributeValue::Variable(data) = attribute.value {
            if data.is_empty() {
                debug!(
                    "Invalid length 0 for TLV attribute {}",
                    attribute.attribute_type
                );
                return Err("Invalid TLV attribute length".into());
            }
        }
        let value = attribute.basic_value().unwrap_or(0);
        match attribute_type {
            OakleyAttribute::ENCRYPTION => {
                if EncryptionAlgorithm::from_u16(value).is_none() {
                    debug!("Invalid encryption algorithm {}", value);
                    return Err("Invalid encryption algorithm".into());
                }
            }
            OakleyAttribute::HASH => {
                if HashAlgorithm::from_u16(value).is_none() {
                    debug!("Invalid hash algorithm {}", value);
                    return Err("Invalid hash algorithm".into());
                }
            }
            OakleyAttribute::AUTH_METHOD => match AuthMethod::from_u16(value) {
                Some(method) if method.is_supported() => {}
                Some(method) => {
                    debug!("Auth method {} isn't supported", method);
                    return Err("Unsupported auth method".into());
                }
                None => {
                    debug!("Invalid auth method {}", value);
                    return Err("Invalid auth method".into());
                }
            },
            OakleyAttribute::GROUP_DESCRIPTION => {
                if DhGroup::from_u16(value).is_none() {
                    debug!("Invalid DH group {}", value);
                    return Err("Invalid DH group".into());
                }
            }
            OakleyAttribute::GROUP_TYPE => {
                if value != OakleyAttribute::GROUP_TYPE_MODP {
                    debug!("Unsupported DH group type {}", value);
                    return Err("Unsupported DH group type".into());
                }
            }
            OakleyAttribute::GROUP_PRIME | OakleyAttribute::GROUP_GENERATOR_ONE => {}
            OakleyAttribute::GROUP_GENERATOR_TWO
            | OakleyAttribute::GROUP_CURVE_A
            | OakleyAttribute::GROUP_CURVE_B
            | OakleyAttribute::FIELD_SIZE => {
                debug!(
                    "Attribute type {} isn't supported",
                    attribute.attribute_type
                );
                return Err("Unsupported Oakley attribute".into());
            }
            OakleyAttribute::LIFE_TYPE => {
                if value != LIFE_TYPE_SECONDS && value != LIFE_TYPE_KILOBYTES {
                    debug!("Invalid life type {}", value);
                    return Err("Invalid life type".into());
                }
            }
            OakleyAttribute::LIFE_DURATION
            | OakleyAttribute::PRF
            | OakleyAttribute::KEY_LENGTH
            | OakleyAttribute::GROUP_ORDER
            | OakleyAttribute::GSS_ID => {}
            _ => {
                debug!("Invalid attribute type {}", attribute.attribute_type);
                return Err("Invalid Oakley attribute type".into());
            }
        }
    }
    Ok(())
}

fn check_ipsec_attributes(
    protocol: IpsecProtocol,
    ipsec_transform: IpsecTransform,
    transform: &Transform,
) -> Result<(), NegotiationError> {
    let mut auth_seen = false;
    for attribute in transform.iter_attributes() {
        let attribute = attribute?;
        let attribute_type = IpsecAttribute(attribute.attribute_type);
        match attribute_type {
            IpsecAttribute::ENCAPSULATION_MODE => {
                let value = attribute.basic_value().ok_or("ENC_MODE must be TV")?;
                if EncapsulationMode::from_u16(value).is_none() {
                    debug!("Invalid encapsulation mode {}", value);
                    return Err("Invalid encapsulation mode".into());
                }
            }
            IpsecAttribute::AUTH => {
                if protocol == IpsecProtocol::Ipcomp {
                    debug!("Auth attribute is not allowed for IPCOMP");
                    return Err("Auth attribute is not allowed for IPCOMP".into());
                }
                let value = attribute.basic_value().ok_or("AUTH must be TV")?;
                let auth = IpsecAuth::from_u16(value)?;
                if protocol == IpsecProtocol::Ah
                    && ipsec_transform.matching_ah_auth() != Some(auth)
                {
                    debug!(
                        "Auth algorithm {} conflicts with transform {}",
                        value,
                        ipsec_transform.to_u8()
                    );
                    return Err("Auth algorithm conflicts with AH transform".into());
                }
                auth_seen = true;
            }
            IpsecAttribute::LIFE_TYPE => {
                let value = attribute.basic_value().ok_or("LD_TYPE must be TV")?;
                if value != LIFE_TYPE_SECONDS && value != LIFE_TYPE_KILOBYTES {
                    debug!("Invalid life type {}", value);
                    return Err("Invalid life type".into());
                }
            }
            IpsecAttribute::LIFE_DURATION => {
                if let message::AttributeValue::Variable(data) = attribute.value {
                    if data.is_empty() {
                        return Err("Invalid length of life duration".into());
                    }
                }
            }
            IpsecAttribute::GROUP_DESCRIPTION => {
                let value = attribute.basic_value().ok_or("GRP_DESC must be TV")?;
                if DhGroup::from_u16(value).is_none() {
                    debug!("Invalid group description {}", value);
                    return Err("Invalid group description".into());
                }
            }
            IpsecAttribute::KEY_LENGTH => {
                attribute.basic_value().ok_or("KEY_LENGTH must be TV")?;
            }
            IpsecAttribute::KEY_ROUNDS
            | IpsecAttribute::COMPRESS_DICTIONARY_SIZE
            | IpsecAttribute::COMPRESS_PRIVATE_ALGORITHM => {
                debug!(
                    "Attribute type {} isn't supported",
                    attribute.attribute_type
                );
                return Err("Unsupported IPsec attribute".into());
            }
            _ => {
                debug!("Invalid attribute type {}", attribute.attribute_type);
                return Err("Invalid IPsec attribute type".into());
            }
        }
    }
    if protocol == IpsecProtocol::Ah && !auth_seen {
        debug!("Attribute AUTH must be present for AH");
        return Err("AH transform without auth".into());
    }
    if ipsec_transform == IpsecTransform::Esp(EspTransform::Null) && !auth_seen {
        debug!("Attribute AUTH must be present for ESP NULL encryption");
        return Err("ESP NULL transform without auth".into());
    }
    Ok(())
}

// Life duration must immediately follow a life type attribute.
fn apply_life_duration(
    lifetimes: &mut Lifetimes,
    life_type: Option<u16>,
    previous_was_life_type: bool,
    attribute: &message::Attribute,
) -> Result<(), NegotiationError> {
    if !previous_was_life_type {
        warn!("Life duration must follow life type, ignoring");
        return Ok(());
    }
    let value = match attribute.as_u32() {
        Some(value) => value,
        None => {
            debug!("Unsupported length of life duration");
            0
        }
    };
    if value == 0 {
        return Err("Invalid life duration".into());
    }
    match life_type {
        Some(LIFE_TYPE_SECONDS) => lifetimes.seconds = value,
        Some(LIFE_TYPE_KILOBYTES) => lifetimes.kilobytes = value,
        _ => return Err("Invalid life type".into()),
    }
    Ok(())
}

fn parse_isakmp_transform(transform: &Transform) -> Result<PeerIsakmpSa, NegotiationError> {
    let mut sa = PeerIsakmpSa {
        trns_no: transform.transform_num(),
        ..Default::default()
    };
    let mut life_type = None;
    let mut previous_was_life_type = false;
    for attribute in transform.iter_attributes() {
        let attribute = attribute?;
        let attribute_type = OakleyAttribute(attribute.attribute_type);
        let value = attribute.basic_value().unwrap_or(0);
        match attribute_type {
            OakleyAttribute::ENCRYPTION => sa.encryption = EncryptionAlgorithm::from_u16(value),
            OakleyAttribute::HASH => sa.hash = HashAlgorithm::from_u16(value),
            OakleyAttribute::AUTH_METHOD => sa.auth_method = AuthMethod::from_u16(value),
            OakleyAttribute::GROUP_DESCRIPTION => sa.dh_group = DhGroup::from_u16(value),
            OakleyAttribute::GROUP_TYPE => {
                if value != OakleyAttribute::GROUP_TYPE_MODP {
                    debug!("Unsupported DH group type {}", value);
                    return Err("Unsupported DH group type".into());
                }
            }
            OakleyAttribute::GROUP_PRIME => match attribute.value {
                message::AttributeValue::Variable(prime) => sa.prime = Some(prime.to_vec()),
                message::AttributeValue::Basic(_) => {
                    return Err("DH prime must be variable length".into())
                }
            },
            OakleyAttribute::GROUP_GENERATOR_ONE => match attribute.value {
                message::AttributeValue::Basic(generator) => sa.generator = Some(generator as u32),
                message::AttributeValue::Variable(data) if data.len() <= 4 => {
                    sa.generator = Some(
                        data.iter()
                            .fold(0u32, |acc, b| (acc << 8) | *b as u32),
                    );
                }
                message::AttributeValue::Variable(_) => {
                    return Err("DH generator is too long".into())
                }
            },
            OakleyAttribute::LIFE_TYPE => life_type = Some(value),
            OakleyAttribute::LIFE_DURATION => apply_life_duration(
                &mut sa.lifetimes,
                life_type,
                previous_was_life_type,
                &attribute,
            )?,
            OakleyAttribute::KEY_LENGTH => {
                if value % 8 != 0 {
                    debug!("Invalid key length {} bits", value);
                    return Err("Key length is not a multiple of 8".into());
                }
                sa.key_length = value;
            }
            _ => {}
        }
        previous_was_life_type = attribute_type == OakleyAttribute::LIFE_TYPE;
    }
    if sa.key_length != 0 {
        if let Some(encryption) = sa.encryption {
            if encryption.has_fixed_key_length() {
                debug!("Key length must not be specified for {}", encryption);
                return Err("Key length for fixed-size cipher".into());
            }
        }
    }
    Ok(sa)
}

fn parse_ipsec_transform(
    protocol: IpsecProtocol,
    transform: &Transform,
) -> Result<PeerIpsecTransform, NegotiationError> {
    let mut result = PeerIpsecTransform {
        trns_no: transform.transform_num(),
        transform: IpsecTransform::from_u8(protocol, transform.transform_id())?,
        mode: None,
        auth: None,
        key_length: 0,
        pfs_group: None,
        lifetimes: Lifetimes::default(),
    };
    let mut life_type = None;
    let mut previous_was_life_type = false;
    for attribute in transform.iter_attributes() {
        let attribute = attribute?;
        let attribute_type = IpsecAttribute(attribute.attribute_type);
        let value = attribute.basic_value().unwrap_or(0);
        match attribute_type {
            IpsecAttribute::LIFE_TYPE => life_type = Some(value),
            IpsecAttribute::LIFE_DURATION => apply_life_duration(
                &mut result.lifetimes,
                life_type,
                previous_was_life_type,
                &attribute,
            )?,
            IpsecAttribute::GROUP_DESCRIPTION => result.pfs_group = DhGroup::from_u16(value),
            IpsecAttribute::ENCAPSULATION_MODE => {
                result.mode = EncapsulationMode::from_u16(value)
            }
            IpsecAttribute::AUTH => result.auth = Some(IpsecAuth::from_u16(value)?),
            IpsecAttribute::KEY_LENGTH => result.key_length = value,
            _ => {}
        }
        previous_was_life_type = attribute_type == IpsecAttribute::LIFE_TYPE;
    }
    Ok(result)
}

fn approve_phase1_transform(
    transform: &Transform,
    proposals: &[IsakmpSa],
    check_level: CheckLevel,
) -> Result<Option<IsakmpSa>, NegotiationError> {
    let peer = parse_isakmp_transform(transform)?;
    let peer_auth = match peer.auth_method {
        Some(auth_method) => auth_method,
        None => return Ok(None),
    };
    for local in proposals {
        let local_auth = local.auth_method.initiator_equivalent();
        trace!(
            "Compared local:peer encryption {}:{:?} key length {}:{} hash {}:{:?} auth {}:{} DH {}:{:?} lifetime {}:{} lifebyte {}:{}",
            local.encryption,
            peer.encryption,
            local.key_length,
            peer.key_length,
            local.hash,
            peer.hash,
            local.auth_method,
            peer_auth,
            local.dh_group,
            peer.dh_group,
            local.lifetimes.seconds,
            peer.lifetimes.seconds,
            local.lifetimes.kilobytes,
            peer.lifetimes.kilobytes,
        );
        if peer.encryption != Some(local.encryption)
            || !(peer_auth == local_auth || peer_auth.initiator_equivalent() == local_auth)
            || peer.hash != Some(local.hash)
            || peer.dh_group != Some(local.dh_group)
            || peer.key_length != local.key_length
        {
            continue;
        }
        let lifetimes = match check_level.reconcile(peer.lifetimes, local.lifetimes) {
            Some(lifetimes) => lifetimes,
            None => continue,
        };
        let mut approved = local.clone();
        approved.lifetimes = lifetimes;
        // Vendor interop: Cisco rekeys arrive with the responder form of the
        // hybrid/XAUTH method, the approved SA keeps the peer's value.
        if peer_auth != local_auth && peer_auth.initiator_equivalent() == local_auth {
            approved.auth_method = peer_auth;
        }
        return Ok(Some(approved));
    }
    Ok(None)
}

fn log_phase1_mismatches(
    proposal: &Proposal,
    transform: &Transform,
    proposals: &[IsakmpSa],
    check_level: CheckLevel,
) {
    let peer = match parse_isakmp_transform(transform) {
        Ok(peer) => peer,
        Err(_) => return,
    };
    for local in proposals {
        let prefix = format!(
            "local(prop#{}:trns#{}):peer(prop#{}:trns#{})",
            local.prop_no,
            local.trns_no,
            proposal.proposal_num(),
            transform.transform_num()
        );
        if peer.encryption != Some(local.encryption) {
            info!(
                "Rejected encryption: {} = {}:{:?}",
                prefix, local.encryption, peer.encryption
            );
        }
        if peer.auth_method != Some(local.auth_method) {
            info!(
                "Rejected auth method: {} = {}:{:?}",
                prefix, local.auth_method, peer.auth_method
            );
        }
        if peer.hash != Some(local.hash) {
            info!(
                "Rejected hash: {} = {}:{:?}",
                prefix, local.hash, peer.hash
            );
        }
        if peer.dh_group != Some(local.dh_group) {
            info!(
                "Rejected DH group: {} = {}:{:?}",
                prefix, local.dh_group, peer.dh_group
            );
        }
        if peer.key_length != local.key_length {
            info!(
                "Rejected key length: {} = {}:{}",
                prefix, local.key_length, peer.key_length
            );
        }
        if check_level.reconcile(peer.lifetimes, local.lifetimes).is_none() {
            info!(
                "Rejected lifetime ({}): {} = {}s/{}KB:{}s/{}KB",
                check_level,
                prefix,
                local.lifetimes.seconds,
                local.lifetimes.kilobytes,
                peer.lifetimes.seconds,
                peer.lifetimes.kilobytes
            );
        }
    }
}

/// Selects the first peer transform acceptable under local phase 1 policy,
/// and builds the SA payload to reply with.
pub fn check_phase1_proposal(
    sa_payload: &[u8],
    config: &RemoteConfig,
) -> Result<Phase1Approval, NegotiationError> {
    let (sa, groups) = get_proposal_pairs(sa_payload, NegotiationPhase::Phase1)?;
    let mut approved = None;
    'groups: for group in &groups {
        for pair in &group.pairs {
            for transform in &pair.transforms {
                match approve_phase1_transform(transform, &config.proposals, config.check_level)
                {
                    Ok(Some(sa)) => {
                        approved = Some((sa, pair.proposal, *transform));
                        break 'groups;
                    }
                    Ok(None) => {}
                    Err(err) => debug!(
                        "Failed to parse transform #{}: {}",
                        transform.transform_num(),
                        err
                    ),
                }
            }
        }
    }
    let (approved, proposal, transform) = match approved {
        Some(approved) => approved,
        None => {
            if config.verbose_proposals {
                groups.iter().for_each(|group| {
                    group.pairs.iter().for_each(|pair| {
                        pair.transforms.iter().for_each(|transform| {
                            log_phase1_mismatches(
                                &pair.proposal,
                                transform,
                                &config.proposals,
                                config.check_level,
                            )
                        })
                    })
                });
            }
            info!("No suitable phase 1 proposal found");
            return Err(NegotiationError::NoProposalChosen);
        }
    };

    let peer = parse_isakmp_transform(&transform)?;
    let dh_params = match (peer.prime, peer.generator) {
        (Some(prime), Some(generator)) => {
            let params = DhParams::Custom { prime, generator };
            params.validate()?;
            params
        }
        (prime, generator) => {
            if prime.is_some() || generator.is_some() {
                warn!(
                    "Incomplete custom DH parameters, using defaults for {}",
                    approved.dh_group
                );
            }
            approved.dh_group.default_params()
        }
    };
    debug!("Approved phase 1 proposal {}", approved);
    let sa_payload = build_sa_payload(sa.header(), &[(proposal, transform)])?;
    Ok(Phase1Approval {
        sa: approved,
        dh_params,
        sa_payload,
    })
}

fn read_spi(proposal: &Proposal) -> u32 {
    let spi = proposal.spi();
    match spi.len() {
        2 => message::read_u16(spi) as u32,
        4 => message::read_u32(spi),
        _ => 0,
    }
}

fn approve_phase2_group<'a>(
    group: &ProposalGroup<'a>,
    bundles: &[SaProposal],
    check_level: CheckLevel,
) -> Option<(SaProposal, Vec<ChosenPair<'a>>)> {
    'bundles: for bundle in bundles {
        if bundle.protocols.len() != group.pairs.len()
            || bundle
                .protocols
                .iter()
                .zip(group.pairs.iter())
                .any(|(local, pair)| local.protocol.to_u8() != pair.proposal.protocol_id())
        {
            continue;
        }
        let mut protocols = Vec::with_capacity(bundle.protocols.len());
        let mut chosen = Vec::with_capacity(bundle.protocols.len());
        let mut lifetimes: Option<Lifetimes> = None;
        let mut pfs_group = bundle.pfs_group;
        for (local, pair) in bundle.protocols.iter().zip(group.pairs.iter()) {
            let mut found = None;
            for transform in &pair.transforms {
                let peer = match parse_ipsec_transform(local.protocol, transform) {
                    Ok(peer) => peer,
                    Err(err) => {
                        debug!(
                            "Failed to parse transform #{}: {}",
                            transform.transform_num(),
                            err
                        );
                        continue;
                    }
                };
                let mode = match peer.mode {
                    Some(mode) if mode.base_mode() == local.mode.base_mode() => mode,
                    _ => continue,
                };
                let local_transform = local.transforms.iter().find(|local_transform| {
                    local_transform.transform == peer.transform
                        && local_transform.auth == peer.auth
                        && local_transform.key_length == peer.key_length
                });
                if local_transform.is_none() {
                    continue;
                }
                let reconciled = match check_level.reconcile(peer.lifetimes, bundle.lifetimes) {
                    Some(reconciled) => reconciled,
                    None => continue,
                };
                let pfs = match check_level {
                    CheckLevel::Obey => peer.pfs_group,
                    CheckLevel::Claim => bundle.pfs_group,
                    CheckLevel::Strict | CheckLevel::Exact => {
                        if peer.pfs_group != bundle.pfs_group {
                            debug!(
                                "PFS group mismatched: {:?}:{:?}",
                                bundle.pfs_group, peer.pfs_group
                            );
                            continue;
                        }
                        bundle.pfs_group
                    }
                };
                found = Some((peer, mode, reconciled, pfs, *transform));
                break;
            }
            let (peer, mode, reconciled, pfs, transform) = match found {
                Some(found) => found,
                None => continue 'bundles,
            };
            lifetimes = Some(match lifetimes {
                Some(current) => Lifetimes {
                    seconds: current.seconds.min(reconciled.seconds),
                    kilobytes: current.kilobytes.min(reconciled.kilobytes),
                },
                None => reconciled,
            });
            pfs_group = pfs;
            protocols.push(SaProtocol {
                protocol: local.protocol,
                mode,
                spi: local.spi,
                spi_p: read_spi(&pair.proposal),
                accepted: true,
                transforms: vec![SaTransform {
                    trns_no: peer.trns_no,
                    transform: peer.transform,
                    key_length: peer.key_length,
                    auth: peer.auth,
                }],
            });
            chosen.push((pair.proposal, transform));
        }
        let approval = SaProposal {
            prop_no: group.number,
            lifetimes: lifetimes.unwrap_or(bundle.lifetimes),
            pfs_group,
            protocols,
        };
        return Some((approval, chosen));
    }
    None
}

/// Responder side: approves the first peer bundle fully matched by a local bundle.
pub fn select_phase2_proposal(
    sa_payload: &[u8],
    bundles: &[SaProposal],
    check_level: CheckLevel,
) -> Result<Phase2Approval, NegotiationError> {
    let (sa, groups) = get_proposal_pairs(sa_payload, NegotiationPhase::Phase2)?;
    for group in &groups {
        if let Some((approval, chosen)) = approve_phase2_group(group, bundles, check_level) {
            debug!("Approved phase 2 proposal #{}", approval.prop_no);
            let sa_payload = build_sa_payload(sa.header(), &chosen)?;
            return Ok(Phase2Approval {
                approval,
                sa_payload,
            });
        }
    }
    info!("No suitable phase 2 proposal found");
    Err(NegotiationError::NoProposalChosen)
}

/// Initiator side: verifies the peer's reply against the SA that was sent.
pub fn check_phase2_proposal(
    sent_sa: &[u8],
    reply_sa: &[u8],
    bundles: &[SaProposal],
    check_level: CheckLevel,
) -> Result<Phase2Approval, NegotiationError> {
    let (_, sent_groups) = get_proposal_pairs(sent_sa, NegotiationPhase::Phase2)?;
    let (reply, reply_groups) = get_proposal_pairs(reply_sa, NegotiationPhase::Phase2)?;
    if reply_groups.len() != 1 {
        debug!("{} proposals replied, expected one", reply_groups.len());
        return Err("Peer replied with multiple proposals".into());
    }
    let replied = &reply_groups[0];
    if replied.pairs.iter().any(|pair| pair.transforms.len() != 1) {
        debug!("Multiple transforms replied in proposal #{}", replied.number);
        return Err("Peer replied with multiple transforms".into());
    }
    let sent = match sent_groups
        .iter()
        .find(|group| group.number == replied.number)
    {
        Some(sent) => sent,
        None => {
            debug!("Replied proposal #{} was never sent", replied.number);
            return Err("Replied proposal was never sent".into());
        }
    };
    compare_replied_group(replied, sent)?;
    let (approval, chosen) = approve_phase2_group(replied, bundles, check_level)
        .ok_or(NegotiationError::NoProposalChosen)?;
    let sa_payload = build_sa_payload(reply.header(), &chosen)?;
    Ok(Phase2Approval {
        approval,
        sa_payload,
    })
}

// Detects tampering of the replied proposal. Protocol and SPI size changes are fatal.
fn compare_replied_group(
    replied: &ProposalGroup,
    sent: &ProposalGroup,
) -> Result<(), NegotiationError> {
    for (reply, sent) in replied.pairs.iter().zip(sent.pairs.iter()) {
        if reply.proposal.proposal_num() != sent.proposal.proposal_num() {
            warn!(
                "Proposal #{} mismatched, expected #{}",
                reply.proposal.proposal_num(),
                sent.proposal.proposal_num()
            );
        }
        if reply.proposal.protocol_id() != sent.proposal.protocol_id() {
            warn!(
                "Proposal #{}: protocol id mismatched {}:{}",
                reply.proposal.proposal_num(),
                reply.proposal.protocol_id(),
                sent.proposal.protocol_id()
            );
            return Err("Replied protocol id mismatched".into());
        }
        if reply.proposal.spi_size() != sent.proposal.spi_size() {
            warn!(
                "Proposal #{}: SPI size mismatched {}:{}",
                reply.proposal.proposal_num(),
                reply.proposal.spi_size(),
                sent.proposal.spi_size()
            );
            return Err("Replied SPI size mismatched".into());
        }
        if reply.proposal.num_transforms() != 1 {
            warn!(
                "Proposal #{}: number of transforms {} should be 1",
                reply.proposal.proposal_num(),
                reply.proposal.num_transforms()
            );
        }
        for transform in &reply.transforms {
            let sent_transform = match sent
                .transforms
                .iter()
                .find(|sent| sent.transform_num() == transform.transform_num())
            {
                Some(sent_transform) => sent_transform,
                None => {
                    warn!(
                        "No suitable transform #{} found in sent proposal",
                        transform.transform_num()
                    );
                    return Err("Replied transform was never sent".into());
                }
            };
            if transform.transform_id() != sent_transform.transform_id() {
                warn!(
                    "Transform #{}: transform id mismatched {}:{}",
                    transform.transform_num(),
                    transform.transform_id(),
                    sent_transform.transform_id()
                );
            }
            if transform.reserved() != 0 {
                warn!(
                    "Transform #{}: reserved field is {}",
                    transform.transform_num(),
                    transform.reserved()
                );
            }
            if transform.attributes_data() != sent_transform.attributes_data() {
                warn!(
                    "Transform #{}: attributes mismatched",
                    transform.transform_num()
                );
            }
        }
    }
    if replied.pairs.len() != sent.pairs.len() {
        warn!(
            "Number of protocols mismatched {}:{}",
            replied.pairs.len(),
            sent.pairs.len()
        );
        return Err("Replied number of protocols mismatched".into());
    }
    Ok(())
}

// One transform per proposal, SPIs zeroed until the local SPIs are filled in.
fn build_sa_payload(header: &[u8], chosen: &[ChosenPair]) -> Result<Vec<u8>, NegotiationError> {
    let mut sa = header.to_vec();
    for (i, (proposal, transform)) in chosen.iter().enumerate() {
        let next_payload = if i + 1 < chosen.len() {
            NEXT_PAYLOAD_PROPOSAL
        } else {
            NEXT_PAYLOAD_NONE
        };
        let length = u16::try_from(proposal.header_length() + transform.raw().len())
            .map_err(|_| "Proposal is too long")?;
        sa.push(next_payload);
        sa.push(0);
        sa.extend_from_slice(&length.to_be_bytes());
        sa.push(proposal.proposal_num());
        sa.push(proposal.protocol_id());
        sa.push(proposal.spi_size());
        sa.push(1);
        sa.resize(sa.len() + proposal.spi_size() as usize, 0);
        let transform_start = sa.len();
        sa.extend_from_slice(transform.raw());
        sa[transform_start] = NEXT_PAYLOAD_NONE;
    }
    Ok(sa)
}

/// Writes the locally allocated SPIs into an approved SA payload.
pub fn update_spi(sa_payload: &mut [u8], approval: &SaProposal) -> Result<(), NegotiationError> {
    let mut offset = 8;
    for protocol in &approval.protocols {
        if sa_payload.len() < offset + PROPOSAL_HEADER_LENGTH {
            return Err("SA payload is shorter than approved protocols".into());
        }
        let length = message::read_u16(&sa_payload[offset + 2..offset + 4]) as usize;
        let spi_size = sa_payload[offset + 6] as usize;
        let spi_start = offset + PROPOSAL_HEADER_LENGTH;
        if sa_payload[offset + 5] != protocol.protocol.to_u8()
            || sa_payload.len() < spi_start + spi_size
            || length < PROPOSAL_HEADER_LENGTH + spi_size
        {
            return Err("SA payload doesn't match approved protocols".into());
        }
        match spi_size {
            2 => {
                let cpi = u16::try_from(protocol.spi).map_err(|_| "CPI doesn't fit 2 bytes")?;
                sa_payload[spi_start..spi_start + 2].copy_from_slice(&cpi.to_be_bytes());
            }
            4 => sa_payload[spi_start..spi_start + 4].copy_from_slice(&protocol.spi.to_be_bytes()),
            _ => return Err("Unsupported SPI size".into()),
        }
        offset += length;
    }
    Ok(())
}

fn write_transform(sa: &mut Vec<u8>, last: bool, trns_no: u8, trns_id: u8, attributes: &[u8]) {
    let length = TRANSFORM_HEADER_LENGTH + attributes.len();
    sa.push(if last {
        NEXT_PAYLOAD_NONE
    } else {
        NEXT_PAYLOAD_TRANSFORM
    });
    sa.push(0);
    sa.extend_from_slice(&(length as u16).to_be_bytes());
    sa.extend_from_slice(&[trns_no, trns_id, 0, 0]);
    sa.extend_from_slice(attributes);
}

fn write_proposal(
    sa: &mut Vec<u8>,
    last: bool,
    prop_no: u8,
    protocol_id: u8,
    spi: &[u8],
    transforms: &[u8],
    num_transforms: u8,
) -> Result<(), NegotiationError> {
    let length = u16::try_from(PROPOSAL_HEADER_LENGTH + spi.len() + transforms.len())
        .map_err(|_| "Proposal is too long")?;
    sa.push(if last {
        NEXT_PAYLOAD_NONE
    } else {
        NEXT_PAYLOAD_PROPOSAL
    });
    sa.push(0);
    sa.extend_from_slice(&length.to_be_bytes());
    sa.extend_from_slice(&[prop_no, protocol_id, spi.len() as u8, num_transforms]);
    sa.extend_from_slice(spi);
    sa.extend_from_slice(transforms);
    Ok(())
}

fn write_sa_header(sa: &mut Vec<u8>) {
    sa.extend_from_slice(&IPSEC_DOI.to_be_bytes());
    sa.extend_from_slice(&SITUATION_IDENTITY_ONLY.to_be_bytes());
}

fn write_lifetime_attributes(attributes: &mut Vec<u8>, life_type: u16, life_duration: u16, lifetimes: &Lifetimes) {
    message::write_basic_attribute(attributes, life_type, LIFE_TYPE_SECONDS);
    message::write_duration_attribute(attributes, life_duration, lifetimes.seconds);
    if lifetimes.kilobytes != 0 && lifetimes.kilobytes != LIFEBYTE_UNLIMITED {
        message::write_basic_attribute(attributes, life_type, LIFE_TYPE_KILOBYTES);
        message::write_duration_attribute(attributes, life_duration, lifetimes.kilobytes);
    }
}

/// Serializes local phase 1 policy into an SA payload body: one ISAKMP proposal, one transform per entry.
pub fn set_phase1_proposal(proposals: &[IsakmpSa]) -> Result<Vec<u8>, NegotiationError> {
    if proposals.is_empty() {
        return Err("No phase 1 proposals configured".into());
    }
    let num_transforms = u8::try_from(proposals.len()).map_err(|_| "Too many transforms")?;
    let mut transforms = vec![];
    for (i, sa) in proposals.iter().enumerate() {
        let mut attributes = vec![];
        message::write_basic_attribute(
            &mut attributes,
            OakleyAttribute::ENCRYPTION.0,
            sa.encryption.to_u16(),
        );
        if sa.key_length != 0 {
            message::write_basic_attribute(
                &mut attributes,
                OakleyAttribute::KEY_LENGTH.0,
                sa.key_length,
            );
        }
        message::write_basic_attribute(&mut attributes, OakleyAttribute::HASH.0, sa.hash.to_u16());
        message::write_basic_attribute(
            &mut attributes,
            OakleyAttribute::AUTH_METHOD.0,
            sa.auth_method.to_u16(),
        );
        message::write_basic_attribute(
            &mut attributes,
            OakleyAttribute::GROUP_DESCRIPTION.0,
            sa.dh_group.to_u16(),
        );
        write_lifetime_attributes(
            &mut attributes,
            OakleyAttribute::LIFE_TYPE.0,
            OakleyAttribute::LIFE_DURATION.0,
            &sa.lifetimes,
        );
        write_transform(
            &mut transforms,
            i + 1 == proposals.len(),
            sa.trns_no,
            TRANSFORM_KEY_IKE,
            &attributes,
        );
    }
    let mut sa = vec![];
    write_sa_header(&mut sa);
    write_proposal(
        &mut sa,
        true,
        1,
        PROTOCOL_ISAKMP,
        &[],
        &transforms,
        num_transforms,
    )?;
    Ok(sa)
}

/// Serializes local phase 2 bundles. `udp_encapsulation` is set after NAT detection,
/// `Some(true)` selecting the RFC 3947 mode codes and `Some(false)` the draft codes.
pub fn set_phase2_proposal(
    bundles: &[SaProposal],
    udp_encapsulation: Option<bool>,
) -> Result<Vec<u8>, NegotiationError> {
    let mut proposals: Vec<(u8, u8, Vec<u8>, Vec<u8>, u8)> = vec![];
    for bundle in bundles {
        for protocol in &bundle.protocols {
            if protocol.protocol == IpsecProtocol::Ipcomp {
                continue;
            }
            let mode = match udp_encapsulation {
                Some(rfc) => protocol.mode.with_udp_encapsulation(rfc),
                None => protocol.mode,
            };
            let transforms_list = protocol
                .transforms
                .iter()
                .filter(|transform| {
                    let skip = transform.transform == IpsecTransform::Esp(EspTransform::Null)
                        && transform.auth.is_none();
                    if skip {
                        debug!("Skipping ESP NULL transform without authentication");
                    }
                    !skip
                })
                .collect::<Vec<_>>();
            if transforms_list.is_empty() {
                continue;
            }
            let mut transforms = vec![];
            for (i, transform) in transforms_list.iter().enumerate() {
                let mut attributes = vec![];
                write_lifetime_attributes(
                    &mut attributes,
                    IpsecAttribute::LIFE_TYPE.0,
                    IpsecAttribute::LIFE_DURATION.0,
                    &bundle.lifetimes,
                );
                message::write_basic_attribute(
                    &mut attributes,
                    IpsecAttribute::ENCAPSULATION_MODE.0,
                    mode.to_u16(),
                );
                if transform.key_length != 0 {
                    message::write_basic_attribute(
                        &mut attributes,
                        IpsecAttribute::KEY_LENGTH.0,
                        transform.key_length,
                    );
                }
                if let Some(auth) = transform.auth {
                    message::write_basic_attribute(
                        &mut attributes,
                        IpsecAttribute::AUTH.0,
                        auth.to_u16(),
                    );
                }
                if let Some(group) = bundle.pfs_group {
                    message::write_basic_attribute(
                        &mut attributes,
                        IpsecAttribute::GROUP_DESCRIPTION.0,
                        group.to_u16(),
                    );
                }
                write_transform(
                    &mut transforms,
                    i + 1 == transforms_list.len(),
                    transform.trns_no,
                    transform.transform.to_u8(),
                    &attributes,
                );
            }
            let num_transforms =
                u8::try_from(transforms_list.len()).map_err(|_| "Too many transforms")?;
            proposals.push((
                bundle.prop_no,
                protocol.protocol.to_u8(),
                protocol.spi.to_be_bytes().to_vec(),
                transforms,
                num_transforms,
            ));
        }
    }
    if proposals.is_empty() {
        return Err("No phase 2 proposals to send".into());
    }
    let mut sa = vec![];
    write_sa_header(&mut sa);
    let count = proposals.len();
    for (i, (prop_no, protocol_id, spi, transforms, num_transforms)) in
        proposals.into_iter().enumerate()
    {
        write_proposal(
            &mut sa,
            i + 1 == count,
            prop_no,
            protocol_id,
            &spi,
            &transforms,
            num_transforms,
        )?;
    }
    Ok(sa)
}

#[derive(Debug)]
pub enum NegotiationError {
    Internal(&'static str),
    Format(FormatError),
    Crypto(CryptoError),
    NoProposalChosen,
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Format(ref e) => write!(f, "Format error: {}", e),
            Self::Crypto(ref e) => write!(f, "Crypto error: {}", e),
            Self::NoProposalChosen => f.write_str("No proposal chosen"),
        }
    }
}

impl error::Error for NegotiationError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::Internal(_msg) => None,
            Self::Format(ref err) => Some(err),
            Self::Crypto(ref err) => Some(err),
            Self::NoProposalChosen => None,
        }
    }
}

impl From<&'static str> for NegotiationError {
    fn from(msg: &'static str) -> NegotiationError {
        Self::Internal(msg)
    }
}

impl From<FormatError> for NegotiationError {
    fn from(err: FormatError) -> NegotiationError {
        Self::Format(err)
    }
}

impl From<CryptoError> for NegotiationError {
    fn from(err: CryptoError) -> NegotiationError {
        Self::Crypto(err)
    }
}

#[cfg(test)]
mod tests {
    use super::super::crypto::AhTransform;
    use super::*;

    fn isakmp_sa(trns_no: u8, lifetime: u32) -> IsakmpSa {
        IsakmpSa {
            prop_no: 1,
            trns_no,
            encryption: EncryptionAlgorithm::Aes,
            key_length: 256,
            hash: HashAlgorithm::Sha256,
            auth_method: AuthMethod::PreSharedKey,
            dh_group: DhGroup::Modp2048,
            lifetimes: Lifetimes {
                seconds: lifetime,
                kilobytes: 0,
            },
        }
    }

    fn remote_config(proposals: Vec<IsakmpSa>, check_level: CheckLevel) -> RemoteConfig {
        RemoteConfig {
            proposals,
            check_level,
            ..RemoteConfig::default()
        }
    }

    fn approved_lifetime(peer: u32, local: u32, check_level: CheckLevel) -> Option<u32> {
        let offer = set_phase1_proposal(&[isakmp_sa(1, peer)]).unwrap();
        let config = remote_config(vec![isakmp_sa(1, local)], check_level);
        check_phase1_proposal(&offer, &config)
            .ok()
            .map(|approval| approval.sa.lifetimes.seconds)
    }

    #[test]
    fn exact_rejects_one_second_difference() {
        assert_eq!(approved_lifetime(3600, 3600, CheckLevel::Exact), Some(3600));
        assert_eq!(approved_lifetime(3601, 3600, CheckLevel::Exact), None);
        assert_eq!(approved_lifetime(3599, 3600, CheckLevel::Exact), None);
    }

    #[test]
    fn claim_takes_minimum() {
        assert_eq!(approved_lifetime(7200, 3600, CheckLevel::Claim), Some(3600));
        assert_eq!(approved_lifetime(1800, 3600, CheckLevel::Claim), Some(1800));
    }

    #[test]
    fn strict_rejects_longer_peer_lifetime() {
        assert_eq!(approved_lifetime(7200, 3600, CheckLevel::Strict), None);
        assert_eq!(approved_lifetime(1800, 3600, CheckLevel::Strict), Some(1800));
    }

    #[test]
    fn obey_takes_peer_lifetime() {
        assert_eq!(approved_lifetime(7200, 3600, CheckLevel::Obey), Some(7200));
        assert_eq!(
            approved_lifetime(100_000, 3600, CheckLevel::Obey),
            Some(100_000)
        );
    }

    #[test]
    fn selects_first_matching_transform() {
        let mut des = isakmp_sa(1, 3600);
        des.encryption = EncryptionAlgorithm::TripleDes;
        des.key_length = 0;
        let aes = isakmp_sa(2, 3600);
        let offer = set_phase1_proposal(&[des, aes.clone()]).unwrap();
        let config = remote_config(vec![aes], CheckLevel::Strict);
        let approval = check_phase1_proposal(&offer, &config).unwrap();
        assert_eq!(approval.sa.encryption, EncryptionAlgorithm::Aes);
        assert_eq!(approval.dh_params, DhParams::WellKnown(DhGroup::Modp2048));

        let (_, groups) =
            get_proposal_pairs(&approval.sa_payload, NegotiationPhase::Phase1).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].pairs.len(), 1);
        let pair = &groups[0].pairs[0];
        assert_eq!(pair.proposal.num_transforms(), 1);
        assert_eq!(pair.transforms.len(), 1);
        assert_eq!(pair.transforms[0].transform_num(), 2);
    }

    #[test]
    fn no_match_is_no_proposal_chosen() {
        let mut offered = isakmp_sa(1, 3600);
        offered.hash = HashAlgorithm::Sha1;
        let offer = set_phase1_proposal(&[offered]).unwrap();
        let mut config = remote_config(vec![isakmp_sa(1, 3600)], CheckLevel::Obey);
        config.verbose_proposals = true;
        assert!(matches!(
            check_phase1_proposal(&offer, &config),
            Err(NegotiationError::NoProposalChosen)
        ));
    }

    #[test]
    fn key_length_and_lifetime_mismatches_are_rejected() {
        let mut short_key = isakmp_sa(1, 3600);
        short_key.key_length = 128;
        let long_life = isakmp_sa(2, 7200);
        let offer = set_phase1_proposal(&[short_key, long_life]).unwrap();
        let mut config = remote_config(vec![isakmp_sa(1, 3600)], CheckLevel::Strict);
        config.verbose_proposals = true;
        assert!(matches!(
            check_phase1_proposal(&offer, &config),
            Err(NegotiationError::NoProposalChosen)
        ));
        config.check_level = CheckLevel::Claim;
        let approval = check_phase1_proposal(&offer, &config).unwrap();
        assert_eq!(approval.sa.key_length, 256);
        assert_eq!(approval.sa.lifetimes.seconds, 3600);
    }

    #[test]
    fn responder_auth_method_keeps_peer_value() {
        let mut offered = isakmp_sa(1, 3600);
        offered.auth_method = AuthMethod::XauthPskResponder;
        let offer = set_phase1_proposal(&[offered]).unwrap();
        let mut local = isakmp_sa(1, 3600);
        local.auth_method = AuthMethod::XauthPskInitiator;
        let config = remote_config(vec![local], CheckLevel::Strict);
        let approval = check_phase1_proposal(&offer, &config).unwrap();
        assert_eq!(approval.sa.auth_method, AuthMethod::XauthPskResponder);
    }

    #[test]
    fn rejects_zero_life_duration() {
        let mut offer = set_phase1_proposal(&[isakmp_sa(1, 3600)]).unwrap();
        // LD_TYPE and LD are the last two basic attributes of the only transform.
        let len = offer.len();
        offer[len - 2..].copy_from_slice(&[0, 0]);
        let config = remote_config(vec![isakmp_sa(1, 3600)], CheckLevel::Obey);
        assert!(check_phase1_proposal(&offer, &config).is_err());
    }

    #[test]
    fn rejects_key_length_for_fixed_size_cipher() {
        let mut des = isakmp_sa(1, 3600);
        des.encryption = EncryptionAlgorithm::TripleDes;
        des.key_length = 192;
        let offer = set_phase1_proposal(&[des.clone()]).unwrap();
        let config = remote_config(vec![des], CheckLevel::Obey);
        assert!(check_phase1_proposal(&offer, &config).is_err());
    }

    #[test]
    fn rejects_bad_doi() {
        let mut offer = set_phase1_proposal(&[isakmp_sa(1, 3600)]).unwrap();
        offer[3] = 2;
        assert!(matches!(
            get_proposal_pairs(&offer, NegotiationPhase::Phase1),
            Err(NegotiationError::Format(_))
        ));
    }

    #[test]
    fn phase1_offer_is_not_valid_in_phase2() {
        let offer = set_phase1_proposal(&[isakmp_sa(1, 3600)]).unwrap();
        assert!(matches!(
            get_proposal_pairs(&offer, NegotiationPhase::Phase2),
            Err(NegotiationError::NoProposalChosen)
        ));
    }

    fn esp_protocol(spi: u32) -> SaProtocol {
        SaProtocol {
            protocol: IpsecProtocol::Esp,
            mode: EncapsulationMode::Tunnel,
            spi,
            spi_p: 0,
            accepted: false,
            transforms: vec![SaTransform {
                trns_no: 1,
                transform: IpsecTransform::Esp(EspTransform::Aes),
                key_length: 256,
                auth: Some(IpsecAuth::HmacSha256),
            }],
        }
    }

    fn ah_protocol(spi: u32) -> SaProtocol {
        SaProtocol {
            protocol: IpsecProtocol::Ah,
            mode: EncapsulationMode::Tunnel,
            spi,
            spi_p: 0,
            accepted: false,
            transforms: vec![SaTransform {
                trns_no: 1,
                transform: IpsecTransform::Ah(AhTransform::Sha256),
                key_length: 0,
                auth: Some(IpsecAuth::HmacSha256),
            }],
        }
    }

    fn bundle(prop_no: u8, protocols: Vec<SaProtocol>) -> SaProposal {
        SaProposal {
            prop_no,
            lifetimes: Lifetimes {
                seconds: 3600,
                kilobytes: 0,
            },
            pfs_group: None,
            protocols,
        }
    }

    #[test]
    fn bundle_must_match_atomically() {
        let offer = set_phase2_proposal(
            &[
                bundle(1, vec![esp_protocol(0x1000)]),
                bundle(2, vec![esp_protocol(0x2000), ah_protocol(0x2001)]),
            ],
            None,
        )
        .unwrap();
        let local = [bundle(1, vec![esp_protocol(0x3000), ah_protocol(0x3001)])];
        let selected = select_phase2_proposal(&offer, &local, CheckLevel::Strict).unwrap();
        assert_eq!(selected.approval.prop_no, 2);
        assert_eq!(selected.approval.protocols.len(), 2);
        assert_eq!(selected.approval.protocols[0].spi_p, 0x2000);
        assert_eq!(selected.approval.protocols[1].spi_p, 0x2001);
        assert_eq!(selected.approval.protocols[0].spi, 0x3000);
        assert!(selected.approval.protocols.iter().all(|p| p.accepted));

        let esp_only = [bundle(1, vec![esp_protocol(0x3000)])];
        let offer = set_phase2_proposal(
            &[bundle(1, vec![esp_protocol(0x2000), ah_protocol(0x2001)])],
            None,
        )
        .unwrap();
        assert!(matches!(
            select_phase2_proposal(&offer, &esp_only, CheckLevel::Strict),
            Err(NegotiationError::NoProposalChosen)
        ));
    }

    #[test]
    fn mode_ignores_udp_encapsulation() {
        let offer = set_phase2_proposal(&[bundle(1, vec![esp_protocol(0x1000)])], Some(true))
            .unwrap();
        let local = [bundle(1, vec![esp_protocol(0x3000)])];
        let selected = select_phase2_proposal(&offer, &local, CheckLevel::Strict).unwrap();
        assert_eq!(
            selected.approval.protocols[0].mode,
            EncapsulationMode::UdpTunnelRfc
        );
    }

    #[test]
    fn update_spi_writes_local_spis() {
        let offer = set_phase2_proposal(&[bundle(1, vec![esp_protocol(0x1000)])], None).unwrap();
        let local = [bundle(1, vec![esp_protocol(0xabcd)])];
        let mut selected = select_phase2_proposal(&offer, &local, CheckLevel::Strict).unwrap();
        // SA header (8) + proposal header (8), SPI follows.
        assert_eq!(&selected.sa_payload[16..20], &[0, 0, 0, 0]);
        update_spi(&mut selected.sa_payload, &selected.approval).unwrap();
        assert_eq!(&selected.sa_payload[16..20], &0xabcdu32.to_be_bytes());
    }

    fn initiator_exchange() -> (Vec<u8>, Vec<u8>, [SaProposal; 1]) {
        let mut second = esp_protocol(0x1000).transforms[0].clone();
        second.trns_no = 2;
        second.transform = IpsecTransform::Esp(EspTransform::TripleDes);
        second.key_length = 0;
        let mut esp = esp_protocol(0x1000);
        esp.transforms.push(second);
        let sent_bundles = [bundle(1, vec![esp])];
        let sent = set_phase2_proposal(&sent_bundles, None).unwrap();
        let responder = [bundle(1, vec![esp_protocol(0x5000)])];
        let mut reply = select_phase2_proposal(&sent, &responder, CheckLevel::Strict).unwrap();
        update_spi(&mut reply.sa_payload, &reply.approval).unwrap();
        (sent, reply.sa_payload, sent_bundles)
    }

    #[test]
    fn verifies_untampered_reply() {
        let (sent, reply, local) = initiator_exchange();
        let checked = check_phase2_proposal(&sent, &reply, &local, CheckLevel::Strict).unwrap();
        assert_eq!(checked.approval.protocols[0].spi_p, 0x5000);
        assert_eq!(checked.approval.protocols[0].spi, 0x1000);
        assert_eq!(
            checked.approval.protocols[0].transforms[0].transform,
            IpsecTransform::Esp(EspTransform::Aes)
        );
    }

    #[test]
    fn protocol_id_tampering_is_fatal() {
        let (sent, mut reply, local) = initiator_exchange();
        // SA header (8), then proposal header: protocol id at offset 5.
        reply[13] = IpsecProtocol::Ah.to_u8();
        assert!(check_phase2_proposal(&sent, &reply, &local, CheckLevel::Strict).is_err());
    }

    #[test]
    fn attribute_tampering_only_warns() {
        let (sent, mut reply, local) = initiator_exchange();
        // Transform at 20, LD_TYPE attribute at 28, LD value at 34.
        reply[34..36].copy_from_slice(&1800u16.to_be_bytes());
        let checked = check_phase2_proposal(&sent, &reply, &local, CheckLevel::Strict).unwrap();
        assert_eq!(checked.approval.lifetimes.seconds, 1800);
    }

    #[test]
    fn multiple_transforms_in_reply_are_rejected() {
        let (sent, _, local) = initiator_exchange();
        assert!(check_phase2_proposal(&sent, &sent, &local, CheckLevel::Strict).is_err());
    }

    #[test]
    fn esp_null_without_auth_is_not_sent() {
        let mut esp = esp_protocol(0x1000);
        esp.transforms[0].transform = IpsecTransform::Esp(EspTransform::Null);
        esp.transforms[0].auth = None;
        assert!(set_phase2_proposal(&[bundle(1, vec![esp])], None).is_err());
    }
}
