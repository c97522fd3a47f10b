use std::{error, fmt};

use aws_lc_rs::digest;
use log::debug;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EncryptionAlgorithm {
    Des,
    Idea,
    Blowfish,
    Rc5,
    TripleDes,
    Cast,
    Aes,
    Camellia,
}

impl EncryptionAlgorithm {
    pub fn from_u16(value: u16) -> Option<EncryptionAlgorithm> {
        match value {
            1 => Some(Self::Des),
            2 => Some(Self::Idea),
            3 => Some(Self::Blowfish),
            4 => Some(Self::Rc5),
            5 => Some(Self::TripleDes),
            6 => Some(Self::Cast),
            7 => Some(Self::Aes),
            8 => Some(Self::Camellia),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Des => 1,
            Self::Idea => 2,
            Self::Blowfish => 3,
            Self::Rc5 => 4,
            Self::TripleDes => 5,
            Self::Cast => 6,
            Self::Aes => 7,
            Self::Camellia => 8,
        }
    }

    pub fn block_size(self) -> usize {
        match self {
            Self::Des | Self::Idea | Self::Blowfish | Self::Rc5 | Self::TripleDes | Self::Cast => 8,
            Self::Aes | Self::Camellia => 16,
        }
    }

    // Fixed-size ciphers must not carry a key length attribute.
    pub fn has_fixed_key_length(self) -> bool {
        matches!(self, Self::Des | Self::TripleDes)
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Des => write!(f, "DES"),
            Self::Idea => write!(f, "IDEA"),
            Self::Blowfish => write!(f, "Blowfish"),
            Self::Rc5 => write!(f, "RC5"),
            Self::TripleDes => write!(f, "3DES"),
            Self::Cast => write!(f, "CAST"),
            Self::Aes => write!(f, "AES"),
            Self::Camellia => write!(f, "Camellia"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Tiger,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn from_u16(value: u16) -> Option<HashAlgorithm> {
        match value {
            1 => Some(Self::Md5),
            2 => Some(Self::Sha1),
            3 => Some(Self::Tiger),
            4 => Some(Self::Sha256),
            5 => Some(Self::Sha384),
            6 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Md5 => 1,
            Self::Sha1 => 2,
            Self::Tiger => 3,
            Self::Sha256 => 4,
            Self::Sha384 => 5,
            Self::Sha512 => 6,
        }
    }

    fn digest_algorithm(self) -> Option<&'static digest::Algorithm> {
        match self {
            Self::Sha1 => Some(&digest::SHA1_FOR_LEGACY_USE_ONLY),
            Self::Sha256 => Some(&digest::SHA256),
            Self::Sha384 => Some(&digest::SHA384),
            Self::Sha512 => Some(&digest::SHA512),
            Self::Md5 | Self::Tiger => None,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => write!(f, "MD5"),
            Self::Sha1 => write!(f, "SHA1"),
            Self::Tiger => write!(f, "Tiger"),
            Self::Sha256 => write!(f, "SHA2-256"),
            Self::Sha384 => write!(f, "SHA2-384"),
            Self::Sha512 => write!(f, "SHA2-512"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AuthMethod {
    PreSharedKey,
    DssSignature,
    RsaSignature,
    RsaEncryption,
    RsaRevisedEncryption,
    HybridRsaInitiator,
    HybridRsaResponder,
    HybridDssInitiator,
    HybridDssResponder,
    // Shares its value with GSSAPI Kerberos.
    XauthPskInitiator,
    XauthPskResponder,
    XauthDssInitiator,
    XauthDssResponder,
    XauthRsaSignatureInitiator,
    XauthRsaSignatureResponder,
    XauthRsaEncryptionInitiator,
    XauthRsaEncryptionResponder,
    XauthRsaRevisedInitiator,
    XauthRsaRevisedResponder,
}

impl AuthMethod {
    pub fn from_u16(value: u16) -> Option<AuthMethod> {
        match value {
            1 => Some(Self::PreSharedKey),
            2 => Some(Self::DssSignature),
            3 => Some(Self::RsaSignature),
            4 => Some(Self::RsaEncryption),
            5 => Some(Self::RsaRevisedEncryption),
            64221 => Some(Self::HybridRsaInitiator),
            64222 => Some(Self::HybridRsaResponder),
            64223 => Some(Self::HybridDssInitiator),
            64224 => Some(Self::HybridDssResponder),
            65001 => Some(Self::XauthPskInitiator),
            65002 => Some(Self::XauthPskResponder),
            65003 => Some(Self::XauthDssInitiator),
            65004 => Some(Self::XauthDssResponder),
            65005 => Some(Self::XauthRsaSignatureInitiator),
            65006 => Some(Self::XauthRsaSignatureResponder),
            65007 => Some(Self::XauthRsaEncryptionInitiator),
            65008 => Some(Self::XauthRsaEncryptionResponder),
            65009 => Some(Self::XauthRsaRevisedInitiator),
            65010 => Some(Self::XauthRsaRevisedResponder),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::PreSharedKey => 1,
            Self::DssSignature => 2,
            Self::RsaSignature => 3,
            Self::RsaEncryption => 4,
            Self::RsaRevisedEncryption => 5,
            Self::HybridRsaInitiator => 64221,
            Self::HybridRsaResponder => 64222,
            Self::HybridDssInitiator => 64223,
            Self::HybridDssResponder => 64224,
            Self::XauthPskInitiator => 65001,
            Self::XauthPskResponder => 65002,
            Self::XauthDssInitiator => 65003,
            Self::XauthDssResponder => 65004,
            Self::XauthRsaSignatureInitiator => 65005,
            Self::XauthRsaSignatureResponder => 65006,
            Self::XauthRsaEncryptionInitiator => 65007,
            Self::XauthRsaEncryptionResponder => 65008,
            Self::XauthRsaRevisedInitiator => 65009,
            Self::XauthRsaRevisedResponder => 65010,
        }
    }

    // Methods that can be accepted from a peer's proposal.
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            Self::PreSharedKey
                | Self::RsaSignature
                | Self::HybridRsaInitiator
                | Self::XauthRsaSignatureInitiator
                | Self::XauthPskInitiator
                | Self::XauthPskResponder
        )
    }

    /// Maps a responder-side hybrid or XAUTH method to its initiator counterpart,
    /// so that both ends of a pair compare as equal.
    pub fn initiator_equivalent(self) -> AuthMethod {
        match self {
            Self::HybridRsaResponder => Self::HybridRsaInitiator,
            Self::HybridDssResponder => Self::HybridDssInitiator,
            Self::XauthPskResponder => Self::XauthPskInitiator,
            Self::XauthRsaSignatureResponder => Self::XauthRsaSignatureInitiator,
            Self::XauthDssResponder => Self::XauthDssInitiator,
            Self::XauthRsaEncryptionResponder => Self::XauthRsaEncryptionInitiator,
            Self::XauthRsaRevisedResponder => Self::XauthRsaRevisedInitiator,
            other => other,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreSharedKey => write!(f, "pre-shared key"),
            Self::DssSignature => write!(f, "DSS signature"),
            Self::RsaSignature => write!(f, "RSA signature"),
            Self::RsaEncryption => write!(f, "RSA encryption"),
            Self::RsaRevisedEncryption => write!(f, "RSA revised encryption"),
            Self::HybridRsaInitiator => write!(f, "Hybrid RSA (initiator)"),
            Self::HybridRsaResponder => write!(f, "Hybrid RSA (responder)"),
            Self::HybridDssInitiator => write!(f, "Hybrid DSS (initiator)"),
            Self::HybridDssResponder => write!(f, "Hybrid DSS (responder)"),
            Self::XauthPskInitiator => write!(f, "XAUTH pre-shared key (initiator)"),
            Self::XauthPskResponder => write!(f, "XAUTH pre-shared key (responder)"),
            Self::XauthDssInitiator => write!(f, "XAUTH DSS (initiator)"),
            Self::XauthDssResponder => write!(f, "XAUTH DSS (responder)"),
            Self::XauthRsaSignatureInitiator => write!(f, "XAUTH RSA signature (initiator)"),
            Self::XauthRsaSignatureResponder => write!(f, "XAUTH RSA signature (responder)"),
            Self::XauthRsaEncryptionInitiator => write!(f, "XAUTH RSA encryption (initiator)"),
            Self::XauthRsaEncryptionResponder => write!(f, "XAUTH RSA encryption (responder)"),
            Self::XauthRsaRevisedInitiator => write!(f, "XAUTH RSA revised (initiator)"),
            Self::XauthRsaRevisedResponder => write!(f, "XAUTH RSA revised (responder)"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DhGroup {
    Modp768,
    Modp1024,
    Modp1536,
    Modp2048,
    Modp3072,
    Modp4096,
    Modp6144,
    Modp8192,
}

impl DhGroup {
    pub fn from_u16(value: u16) -> Option<DhGroup> {
        match value {
            1 => Some(Self::Modp768),
            2 => Some(Self::Modp1024),
            5 => Some(Self::Modp1536),
            14 => Some(Self::Modp2048),
            15 => Some(Self::Modp3072),
            16 => Some(Self::Modp4096),
            17 => Some(Self::Modp6144),
            18 => Some(Self::Modp8192),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Modp768 => 1,
            Self::Modp1024 => 2,
            Self::Modp1536 => 5,
            Self::Modp2048 => 14,
            Self::Modp3072 => 15,
            Self::Modp4096 => 16,
            Self::Modp6144 => 17,
            Self::Modp8192 => 18,
        }
    }

    pub fn prime_bits(self) -> usize {
        match self {
            Self::Modp768 => 768,
            Self::Modp1024 => 1024,
            Self::Modp1536 => 1536,
            Self::Modp2048 => 2048,
            Self::Modp3072 => 3072,
            Self::Modp4096 => 4096,
            Self::Modp6144 => 6144,
            Self::Modp8192 => 8192,
        }
    }

    // All well-known MODP groups use generator 2 (RFC 2409, RFC 3526).
    pub fn default_params(self) -> DhParams {
        DhParams::WellKnown(self)
    }
}

impl fmt::Display for DhGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MODP-{}", self.prime_bits())
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DhParams {
    WellKnown(DhGroup),
    Custom { prime: Vec<u8>, generator: u32 },
}

impl DhParams {
    pub fn validate(&self) -> Result<(), CryptoError> {
        match self {
            DhParams::WellKnown(_) => Ok(()),
            DhParams::Custom { prime, generator } => {
                if prime.iter().all(|b| *b == 0) {
                    debug!("Custom DH group has an empty prime");
                    Err("Custom DH group has an empty prime".into())
                } else if *generator < 2 {
                    debug!("Custom DH group generator {} is invalid", generator);
                    Err("Custom DH group generator is invalid".into())
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IpsecProtocol {
    Ah,
    Esp,
    Ipcomp,
}

impl IpsecProtocol {
    pub fn from_u8(value: u8) -> Option<IpsecProtocol> {
        match value {
            2 => Some(Self::Ah),
            3 => Some(Self::Esp),
            4 => Some(Self::Ipcomp),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Ah => 2,
            Self::Esp => 3,
            Self::Ipcomp => 4,
        }
    }
}

impl fmt::Display for IpsecProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ah => write!(f, "AH"),
            Self::Esp => write!(f, "ESP"),
            Self::Ipcomp => write!(f, "IPCOMP"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AhTransform {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EspTransform {
    Des,
    TripleDes,
    Rc5,
    Cast,
    Blowfish,
    Null,
    Aes,
    Twofish,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IpcompTransform {
    Oui,
    Deflate,
    Lzs,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IpsecTransform {
    Ah(AhTransform),
    Esp(EspTransform),
    Ipcomp(IpcompTransform),
}

impl IpsecTransform {
    pub fn from_u8(protocol: IpsecProtocol, value: u8) -> Result<IpsecTransform, CryptoError> {
        let transform = match (protocol, value) {
            (IpsecProtocol::Ah, 2) => Self::Ah(AhTransform::Md5),
            (IpsecProtocol::Ah, 3) => Self::Ah(AhTransform::Sha1),
            (IpsecProtocol::Ah, 5) => Self::Ah(AhTransform::Sha256),
            (IpsecProtocol::Ah, 6) => Self::Ah(AhTransform::Sha384),
            (IpsecProtocol::Ah, 7) => Self::Ah(AhTransform::Sha512),
            (IpsecProtocol::Ah, 4) => {
                debug!("Unsupported transform-id {} in AH", value);
                return Err("Unsupported AH transform".into());
            }
            (IpsecProtocol::Esp, 2) => Self::Esp(EspTransform::Des),
            (IpsecProtocol::Esp, 3) => Self::Esp(EspTransform::TripleDes),
            (IpsecProtocol::Esp, 4) => Self::Esp(EspTransform::Rc5),
            (IpsecProtocol::Esp, 6) => Self::Esp(EspTransform::Cast),
            (IpsecProtocol::Esp, 7) => Self::Esp(EspTransform::Blowfish),
            (IpsecProtocol::Esp, 11) => Self::Esp(EspTransform::Null),
            (IpsecProtocol::Esp, 12) => Self::Esp(EspTransform::Aes),
            (IpsecProtocol::Esp, 253) => Self::Esp(EspTransform::Twofish),
            (IpsecProtocol::Esp, 1 | 5 | 8 | 9 | 10) => {
                debug!("Unsupported transform-id {} in ESP", value);
                return Err("Unsupported ESP transform".into());
            }
            (IpsecProtocol::Ipcomp, 1) => Self::Ipcomp(IpcompTransform::Oui),
            (IpsecProtocol::Ipcomp, 2) => Self::Ipcomp(IpcompTransform::Deflate),
            (IpsecProtocol::Ipcomp, 3) => Self::Ipcomp(IpcompTransform::Lzs),
            _ => {
                debug!("Invalid transform-id {} in {}", value, protocol);
                return Err("Invalid transform-id".into());
            }
        };
        Ok(transform)
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Ah(AhTransform::Md5) => 2,
            Self::Ah(AhTransform::Sha1) => 3,
            Self::Ah(AhTransform::Sha256) => 5,
            Self::Ah(AhTransform::Sha384) => 6,
            Self::Ah(AhTransform::Sha512) => 7,
            Self::Esp(EspTransform::Des) => 2,
            Self::Esp(EspTransform::TripleDes) => 3,
            Self::Esp(EspTransform::Rc5) => 4,
            Self::Esp(EspTransform::Cast) => 6,
            Self::Esp(EspTransform::Blowfish) => 7,
            Self::Esp(EspTransform::Null) => 11,
            Self::Esp(EspTransform::Aes) => 12,
            Self::Esp(EspTransform::Twofish) => 253,
            Self::Ipcomp(IpcompTransform::Oui) => 1,
            Self::Ipcomp(IpcompTransform::Deflate) => 2,
            Self::Ipcomp(IpcompTransform::Lzs) => 3,
        }
    }

    pub fn protocol(&self) -> IpsecProtocol {
        match self {
            Self::Ah(_) => IpsecProtocol::Ah,
            Self::Esp(_) => IpsecProtocol::Esp,
            Self::Ipcomp(_) => IpsecProtocol::Ipcomp,
        }
    }

    // The AH authentication attribute must agree with the AH transform.
    pub fn matching_ah_auth(&self) -> Option<IpsecAuth> {
        match self {
            Self::Ah(AhTransform::Md5) => Some(IpsecAuth::HmacMd5),
            Self::Ah(AhTransform::Sha1) => Some(IpsecAuth::HmacSha1),
            Self::Ah(AhTransform::Sha256) => Some(IpsecAuth::HmacSha256),
            Self::Ah(AhTransform::Sha384) => Some(IpsecAuth::HmacSha384),
            Self::Ah(AhTransform::Sha512) => Some(IpsecAuth::HmacSha512),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IpsecAuth {
    HmacMd5,
    HmacSha1,
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl IpsecAuth {
    pub fn from_u16(value: u16) -> Result<IpsecAuth, CryptoError> {
        match value {
            1 => Ok(Self::HmacMd5),
            2 => Ok(Self::HmacSha1),
            5 => Ok(Self::HmacSha256),
            6 => Ok(Self::HmacSha384),
            7 => Ok(Self::HmacSha512),
            3 | 4 => {
                debug!("Auth algorithm {} isn't supported", value);
                Err("Unsupported auth algorithm".into())
            }
            _ => {
                debug!("Invalid auth algorithm {}", value);
                Err("Invalid auth algorithm".into())
            }
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::HmacMd5 => 1,
            Self::HmacSha1 => 2,
            Self::HmacSha256 => 5,
            Self::HmacSha384 => 6,
            Self::HmacSha512 => 7,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EncapsulationMode {
    Tunnel,
    Transport,
    UdpTunnelRfc,
    UdpTransportRfc,
    UdpTunnelDraft,
    UdpTransportDraft,
}

impl EncapsulationMode {
    pub fn from_u16(value: u16) -> Option<EncapsulationMode> {
        match value {
            1 => Some(Self::Tunnel),
            2 => Some(Self::Transport),
            3 => Some(Self::UdpTunnelRfc),
            4 => Some(Self::UdpTransportRfc),
            61443 => Some(Self::UdpTunnelDraft),
            61444 => Some(Self::UdpTransportDraft),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Tunnel => 1,
            Self::Transport => 2,
            Self::UdpTunnelRfc => 3,
            Self::UdpTransportRfc => 4,
            Self::UdpTunnelDraft => 61443,
            Self::UdpTransportDraft => 61444,
        }
    }

    // Strips UDP encapsulation, which only reflects NAT detection.
    pub fn base_mode(self) -> EncapsulationMode {
        match self {
            Self::Tunnel | Self::UdpTunnelRfc | Self::UdpTunnelDraft => Self::Tunnel,
            Self::Transport | Self::UdpTransportRfc | Self::UdpTransportDraft => Self::Transport,
        }
    }

    pub fn is_transport(self) -> bool {
        self.base_mode() == Self::Transport
    }

    pub fn with_udp_encapsulation(self, rfc: bool) -> EncapsulationMode {
        match (self.base_mode(), rfc) {
            (Self::Tunnel, true) => Self::UdpTunnelRfc,
            (Self::Tunnel, false) => Self::UdpTunnelDraft,
            (_, true) => Self::UdpTransportRfc,
            (_, false) => Self::UdpTransportDraft,
        }
    }
}

/// Derives the phase 2 IV from the IV material of a bound phase 1.
pub trait IvDeriver {
    fn phase2_iv(
        &self,
        hash: HashAlgorithm,
        encryption: EncryptionAlgorithm,
        phase1_iv: &[u8],
        message_id: u32,
    ) -> Result<Vec<u8>, CryptoError>;
}

// IV = hash(last phase 1 IV | message ID), truncated to the cipher block size (RFC 2409, Appendix B).
pub struct DigestIvDeriver {}

impl IvDeriver for DigestIvDeriver {
    fn phase2_iv(
        &self,
        hash: HashAlgorithm,
        encryption: EncryptionAlgorithm,
        phase1_iv: &[u8],
        message_id: u32,
    ) -> Result<Vec<u8>, CryptoError> {
        let algorithm = match hash.digest_algorithm() {
            Some(algorithm) => algorithm,
            None => {
                debug!("Hash {} is not available for IV derivation", hash);
                return Err("Hash is not available for IV derivation".into());
            }
        };
        let mut ctx = digest::Context::new(algorithm);
        ctx.update(phase1_iv);
        ctx.update(&message_id.to_be_bytes());
        let digest = ctx.finish();
        let block_size = encryption.block_size();
        if digest.as_ref().len() < block_size {
            return Err("Digest is shorter than cipher block".into());
        }
        Ok(digest.as_ref()[..block_size].to_vec())
    }
}

#[derive(Debug)]
pub enum CryptoError {
    Internal(&'static str),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Internal(msg) => f.write_str(msg),
        }
    }
}

impl error::Error for CryptoError {}

impl From<&'static str> for CryptoError {
    fn from(msg: &'static str) -> CryptoError {
        Self::Internal(msg)
    }
}
