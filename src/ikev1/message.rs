use std::{error, fmt};

use log::debug;

pub const ISAKMP_HEADER_LENGTH: usize = 28;
pub const GENERIC_HEADER_LENGTH: usize = 4;
pub const NON_ESP_MARKER_LENGTH: usize = 4;
pub const PROPOSAL_HEADER_LENGTH: usize = 8;
pub const TRANSFORM_HEADER_LENGTH: usize = 8;
const SA_HEADER_LENGTH: usize = 8;

pub const IPSEC_DOI: u32 = 1;
pub const SITUATION_IDENTITY_ONLY: u32 = 1;
const SITUATION_SECRECY: u32 = 2;
const SITUATION_INTEGRITY: u32 = 4;

const ISAKMP_MAJOR_VERSION: u8 = 1;
const ATTRIBUTE_FORMAT_TV: u16 = 1 << 15;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ExchangeType(u8);

impl ExchangeType {
    pub const BASE: ExchangeType = ExchangeType(1);
    pub const IDENTITY_PROTECTION: ExchangeType = ExchangeType(2);
    pub const AUTH_ONLY: ExchangeType = ExchangeType(3);
    pub const AGGRESSIVE: ExchangeType = ExchangeType(4);
    pub const INFORMATIONAL: ExchangeType = ExchangeType(5);
    pub const TRANSACTION: ExchangeType = ExchangeType(6);
    pub const QUICK: ExchangeType = ExchangeType(32);
    pub const NEW_GROUP: ExchangeType = ExchangeType(33);

    pub fn from_u8(value: u8) -> Result<ExchangeType, FormatError> {
        match value {
            1..=6 | 32 | 33 => Ok(ExchangeType(value)),
            _ => {
                debug!("Unsupported ISAKMP Exchange Type {}", value);
                Err("Unsupported ISAKMP Exchange Type".into())
            }
        }
    }

    pub fn to_u8(self) -> u8 {
        self.0
    }

    pub fn is_phase1(&self) -> bool {
        matches!(
            *self,
            Self::BASE | Self::IDENTITY_PROTECTION | Self::AUTH_ONLY | Self::AGGRESSIVE
        )
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::BASE => write!(f, "Base")?,
            Self::IDENTITY_PROTECTION => write!(f, "Identity Protection")?,
            Self::AUTH_ONLY => write!(f, "Authentication Only")?,
            Self::AGGRESSIVE => write!(f, "Aggressive")?,
            Self::INFORMATIONAL => write!(f, "Informational")?,
            Self::TRANSACTION => write!(f, "Transaction")?,
            Self::QUICK => write!(f, "Quick")?,
            Self::NEW_GROUP => write!(f, "New Group")?,
            _ => write!(f, "Unknown exchange type {}", self.0)?,
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PayloadType(u8);

impl PayloadType {
    pub const NONE: PayloadType = PayloadType(0);
    pub const SECURITY_ASSOCIATION: PayloadType = PayloadType(1);
    pub const PROPOSAL: PayloadType = PayloadType(2);
    pub const TRANSFORM: PayloadType = PayloadType(3);
    pub const KEY_EXCHANGE: PayloadType = PayloadType(4);
    pub const IDENTIFICATION: PayloadType = PayloadType(5);
    pub const CERTIFICATE: PayloadType = PayloadType(6);
    pub const CERTIFICATE_REQUEST: PayloadType = PayloadType(7);
    pub const HASH: PayloadType = PayloadType(8);
    pub const SIGNATURE: PayloadType = PayloadType(9);
    pub const NONCE: PayloadType = PayloadType(10);
    pub const NOTIFICATION: PayloadType = PayloadType(11);
    pub const DELETE: PayloadType = PayloadType(12);
    pub const VENDOR_ID: PayloadType = PayloadType(13);
    pub const ATTRIBUTE: PayloadType = PayloadType(14);
    pub const NAT_DISCOVERY: PayloadType = PayloadType(20);
    pub const NAT_ORIGINAL_ADDRESS: PayloadType = PayloadType(21);
    pub const FRAGMENT: PayloadType = PayloadType(132);

    pub fn from_u8(value: u8) -> PayloadType {
        PayloadType(value)
    }

    pub fn to_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::NONE => write!(f, "None"),
            Self::SECURITY_ASSOCIATION => write!(f, "Security Association"),
            Self::PROPOSAL => write!(f, "Proposal"),
            Self::TRANSFORM => write!(f, "Transform"),
            Self::KEY_EXCHANGE => write!(f, "Key Exchange"),
            Self::IDENTIFICATION => write!(f, "Identification"),
            Self::CERTIFICATE => write!(f, "Certificate"),
            Self::CERTIFICATE_REQUEST => write!(f, "Certificate Request"),
            Self::HASH => write!(f, "Hash"),
            Self::SIGNATURE => write!(f, "Signature"),
            Self::NONCE => write!(f, "Nonce"),
            Self::NOTIFICATION => write!(f, "Notification"),
            Self::DELETE => write!(f, "Delete"),
            Self::VENDOR_ID => write!(f, "Vendor ID"),
            Self::ATTRIBUTE => write!(f, "Attribute"),
            Self::NAT_DISCOVERY => write!(f, "NAT Discovery"),
            Self::NAT_ORIGINAL_ADDRESS => write!(f, "NAT Original Address"),
            Self::FRAGMENT => write!(f, "Fragment"),
            _ => write!(f, "Unknown payload type {}", self.0),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Flags(u8);

impl Flags {
    pub const ENCRYPTION: Flags = Flags(1 << 0);
    pub const COMMIT: Flags = Flags(1 << 1);
    pub const AUTH_ONLY: Flags = Flags(1 << 2);

    pub fn has(&self, flag: Flags) -> bool {
        self.0 & flag.0 != 0
    }
}

pub struct InputMessage<'a> {
    data: &'a [u8],
}

// ISAKMP header layout from RFC 2408, Section 3.1.
impl InputMessage<'_> {
    pub fn from_datagram(p: &[u8], is_nat: bool) -> Result<InputMessage, FormatError> {
        let data = if is_nat {
            if p.len() < NON_ESP_MARKER_LENGTH || p[0..NON_ESP_MARKER_LENGTH] != [0u8; 4] {
                debug!("Missing non-ESP marker");
                return Err("Missing non-ESP marker".into());
            }
            &p[NON_ESP_MARKER_LENGTH..]
        } else {
            p
        };
        if data.len() < ISAKMP_HEADER_LENGTH {
            debug!("Not enough data in message");
            return Err("Not enough data in message".into());
        }
        let message = InputMessage { data };
        if message.read_version().0 != ISAKMP_MAJOR_VERSION {
            debug!("Unsupported ISAKMP version {:?}", message.read_version());
            return Err("Unsupported ISAKMP version".into());
        }
        if message.read_length() as usize != data.len() {
            debug!(
                "Message length {} doesn't match datagram length {}",
                message.read_length(),
                data.len()
            );
            return Err("Message length mismatch".into());
        }
        Ok(message)
    }

    pub fn read_initiator_cookie(&self) -> u64 {
        let mut result = [0u8; 8];
        result.copy_from_slice(&self.data[0..8]);
        u64::from_be_bytes(result)
    }

    pub fn read_responder_cookie(&self) -> u64 {
        let mut result = [0u8; 8];
        result.copy_from_slice(&self.data[8..16]);
        u64::from_be_bytes(result)
    }

    pub fn read_next_payload(&self) -> PayloadType {
        PayloadType(self.data[16])
    }

    pub fn read_version(&self) -> (u8, u8) {
        let version = self.data[17];
        (version >> 4 & 0x0f, version & 0x0f)
    }

    pub fn read_exchange_type(&self) -> Result<ExchangeType, FormatError> {
        ExchangeType::from_u8(self.data[18])
    }

    pub fn read_flags(&self) -> Flags {
        Flags(self.data[19])
    }

    pub fn read_message_id(&self) -> u32 {
        let mut result = [0u8; 4];
        result.copy_from_slice(&self.data[20..24]);
        u32::from_be_bytes(result)
    }

    pub fn read_length(&self) -> u32 {
        let mut result = [0u8; 4];
        result.copy_from_slice(&self.data[24..28]);
        u32::from_be_bytes(result)
    }

    pub fn header(&self) -> &[u8] {
        &self.data[..ISAKMP_HEADER_LENGTH]
    }

    pub fn raw_data(&self) -> &[u8] {
        self.data
    }

    pub fn iter_payloads(&self) -> PayloadIter {
        PayloadIter {
            next_payload: self.read_next_payload(),
            data: &self.data[ISAKMP_HEADER_LENGTH..],
        }
    }
}

impl fmt::Debug for InputMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "ICOOKIE {:x} RCOOKIE {:x} Next payload {} Exchange {:?} Flags {:02x} Message ID {} Length {}",
            self.read_initiator_cookie(),
            self.read_responder_cookie(),
            self.read_next_payload(),
            self.read_exchange_type(),
            self.read_flags().0,
            self.read_message_id(),
            self.read_length(),
        )
    }
}

pub struct Payload<'a> {
    payload_type: PayloadType,
    data: &'a [u8],
}

impl<'a> Payload<'a> {
    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    // Payload body, without the generic header.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

pub struct PayloadIter<'a> {
    next_payload: PayloadType,
    data: &'a [u8],
}

impl<'a> Iterator for PayloadIter<'a> {
    type Item = Result<Payload<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_payload == PayloadType::NONE {
            if !self.data.is_empty() {
                debug!("Packet has unaccounted data");
            }
            return None;
        }
        if self.data.len() < GENERIC_HEADER_LENGTH {
            debug!("Not enough data in payload");
            self.next_payload = PayloadType::NONE;
            return Some(Err("Not enough data in payload".into()));
        }
        let payload_length = read_u16(&self.data[2..4]) as usize;
        if payload_length < GENERIC_HEADER_LENGTH || self.data.len() < payload_length {
            debug!("Payload overflow");
            self.next_payload = PayloadType::NONE;
            return Some(Err("Payload overflow".into()));
        }
        let item = Payload {
            payload_type: self.next_payload,
            data: &self.data[GENERIC_HEADER_LENGTH..payload_length],
        };
        self.next_payload = PayloadType(self.data[0]);
        self.data = &self.data[payload_length..];
        Some(Ok(item))
    }
}

// SA payload body: DOI, situation and a chain of proposal substructures (RFC 2408, Section 3.4).
pub struct SecurityAssociation<'a> {
    data: &'a [u8],
}

impl<'a> SecurityAssociation<'a> {
    pub fn from_payload(data: &'a [u8]) -> Result<SecurityAssociation<'a>, FormatError> {
        if data.len() < SA_HEADER_LENGTH {
            debug!("Invalid SA length {}", data.len());
            return Err("Invalid SA length".into());
        }
        let sa = SecurityAssociation { data };
        if sa.doi() != IPSEC_DOI {
            debug!("Invalid value of DOI {:#010x}", sa.doi());
            return Err("Invalid DOI".into());
        }
        match sa.situation() {
            SITUATION_IDENTITY_ONLY => {}
            SITUATION_SECRECY | SITUATION_INTEGRITY => {
                debug!("Situation {:#010x} unsupported", sa.situation());
                return Err("Unsupported situation".into());
            }
            _ => {
                debug!("Invalid situation {:#010x}", sa.situation());
                return Err("Invalid situation".into());
            }
        }
        Ok(sa)
    }

    pub fn doi(&self) -> u32 {
        read_u32(&self.data[0..4])
    }

    pub fn situation(&self) -> u32 {
        read_u32(&self.data[4..8])
    }

    pub fn header(&self) -> &'a [u8] {
        &self.data[..SA_HEADER_LENGTH]
    }

    pub fn iter_proposals(&self) -> ProposalIter<'a> {
        ProposalIter {
            next_payload: PayloadType::PROPOSAL,
            data: &self.data[SA_HEADER_LENGTH..],
        }
    }
}

pub struct ProposalIter<'a> {
    next_payload: PayloadType,
    data: &'a [u8],
}

impl<'a> Iterator for ProposalIter<'a> {
    type Item = Result<Proposal<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_payload == PayloadType::NONE {
            if !self.data.is_empty() {
                debug!("Unaccounted proposal bytes");
            }
            return None;
        }
        if self.next_payload != PayloadType::PROPOSAL {
            debug!("Invalid payload type {} in SA", self.next_payload);
            self.next_payload = PayloadType::NONE;
            return Some(Err("Invalid payload type in SA".into()));
        }
        if self.data.len() < PROPOSAL_HEADER_LENGTH {
            debug!("Not enough data in proposal");
            self.next_payload = PayloadType::NONE;
            return Some(Err("Not enough data in proposal".into()));
        }
        let proposal_length = read_u16(&self.data[2..4]) as usize;
        let spi_size = self.data[6] as usize;
        if proposal_length < PROPOSAL_HEADER_LENGTH + spi_size || self.data.len() < proposal_length
        {
            debug!("Invalid proposal length {}", proposal_length);
            self.next_payload = PayloadType::NONE;
            return Some(Err("Invalid proposal length".into()));
        }
        let item = Proposal {
            data: &self.data[..proposal_length],
        };
        self.next_payload = PayloadType(self.data[0]);
        self.data = &self.data[proposal_length..];
        Some(Ok(item))
    }
}

#[derive(Clone, Copy)]
pub struct Proposal<'a> {
    data: &'a [u8],
}

impl<'a> Proposal<'a> {
    pub fn proposal_num(&self) -> u8 {
        self.data[4]
    }

    pub fn protocol_id(&self) -> u8 {
        self.data[5]
    }

    pub fn spi_size(&self) -> u8 {
        self.data[6]
    }

    pub fn num_transforms(&self) -> u8 {
        self.data[7]
    }

    pub fn spi(&self) -> &'a [u8] {
        &self.data[PROPOSAL_HEADER_LENGTH..self.header_length()]
    }

    pub fn header_length(&self) -> usize {
        PROPOSAL_HEADER_LENGTH + self.spi_size() as usize
    }

    // Proposal header including the SPI.
    pub fn header(&self) -> &'a [u8] {
        &self.data[..self.header_length()]
    }

    pub fn iter_transforms(&self) -> TransformIter<'a> {
        TransformIter {
            next_payload: PayloadType::TRANSFORM,
            data: &self.data[self.header_length()..],
        }
    }
}

pub struct TransformIter<'a> {
    next_payload: PayloadType,
    data: &'a [u8],
}

impl<'a> Iterator for TransformIter<'a> {
    type Item = Result<Transform<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_payload == PayloadType::NONE {
            if !self.data.is_empty() {
                debug!("Unaccounted transform bytes");
            }
            return None;
        }
        if self.next_payload != PayloadType::TRANSFORM {
            debug!("Invalid payload type {} in proposal", self.next_payload);
            self.next_payload = PayloadType::NONE;
            return Some(Err("Invalid payload type in proposal".into()));
        }
        if self.data.len() < TRANSFORM_HEADER_LENGTH {
            debug!("Not enough data in transform");
            self.next_payload = PayloadType::NONE;
            return Some(Err("Not enough data in transform".into()));
        }
        let transform_length = read_u16(&self.data[2..4]) as usize;
        if transform_length < TRANSFORM_HEADER_LENGTH || self.data.len() < transform_length {
            debug!("Invalid transform length {}", transform_length);
            self.next_payload = PayloadType::NONE;
            return Some(Err("Invalid transform length".into()));
        }
        let item = Transform {
            data: &self.data[..transform_length],
        };
        self.next_payload = PayloadType(self.data[0]);
        self.data = &self.data[transform_length..];
        Some(Ok(item))
    }
}

#[derive(Clone, Copy)]
pub struct Transform<'a> {
    data: &'a [u8],
}

impl<'a> Transform<'a> {
    pub fn transform_num(&self) -> u8 {
        self.data[4]
    }

    pub fn transform_id(&self) -> u8 {
        self.data[5]
    }

    pub fn reserved(&self) -> u16 {
        read_u16(&self.data[6..8])
    }

    pub fn raw(&self) -> &'a [u8] {
        self.data
    }

    pub fn attributes_data(&self) -> &'a [u8] {
        &self.data[TRANSFORM_HEADER_LENGTH..]
    }

    pub fn iter_attributes(&self) -> AttributesIter<'a> {
        AttributesIter {
            data: self.attributes_data(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AttributeValue<'a> {
    Basic(u16),
    Variable(&'a [u8]),
}

#[derive(Clone, Copy, Debug)]
pub struct Attribute<'a> {
    pub attribute_type: u16,
    pub value: AttributeValue<'a>,
}

impl Attribute<'_> {
    pub fn is_basic(&self) -> bool {
        matches!(self.value, AttributeValue::Basic(_))
    }

    pub fn basic_value(&self) -> Option<u16> {
        match self.value {
            AttributeValue::Basic(value) => Some(value),
            AttributeValue::Variable(_) => None,
        }
    }

    // Life durations and key lengths are sent as 2- or 4-byte integers.
    pub fn as_u32(&self) -> Option<u32> {
        match self.value {
            AttributeValue::Basic(value) => Some(value as u32),
            AttributeValue::Variable(data) if data.len() == 2 => Some(read_u16(data) as u32),
            AttributeValue::Variable(data) if data.len() == 4 => Some(read_u32(data)),
            AttributeValue::Variable(_) => None,
        }
    }
}

pub struct AttributesIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for AttributesIter<'a> {
    type Item = Result<Attribute<'a>, FormatError>;

    fn next(&mut self) -> Option<Self::Item> {
        const ATTRIBUTE_TYPE_MASK: u16 = !ATTRIBUTE_FORMAT_TV;
        if self.data.is_empty() {
            return None;
        }
        if self.data.len() < 4 {
            debug!("Not enough data in transform attribute");
            self.data = &[];
            return Some(Err("Not enough data in transform attribute".into()));
        }
        let attribute_type = read_u16(&self.data[0..2]);
        let value = read_u16(&self.data[2..4]);
        if attribute_type & ATTRIBUTE_FORMAT_TV != 0 {
            let item = Attribute {
                attribute_type: attribute_type & ATTRIBUTE_TYPE_MASK,
                value: AttributeValue::Basic(value),
            };
            self.data = &self.data[4..];
            Some(Ok(item))
        } else {
            let attribute_length = value as usize;
            if self.data.len() < 4 + attribute_length {
                debug!(
                    "Transform attribute {} overflow, length {}",
                    attribute_type, attribute_length
                );
                self.data = &[];
                return Some(Err("Transform attribute overflow".into()));
            }
            let item = Attribute {
                attribute_type,
                value: AttributeValue::Variable(&self.data[4..4 + attribute_length]),
            };
            self.data = &self.data[4 + attribute_length..];
            Some(Ok(item))
        }
    }
}

pub fn write_basic_attribute(dest: &mut Vec<u8>, attribute_type: u16, value: u16) {
    dest.extend_from_slice(&(attribute_type | ATTRIBUTE_FORMAT_TV).to_be_bytes());
    dest.extend_from_slice(&value.to_be_bytes());
}

pub fn write_variable_attribute(
    dest: &mut Vec<u8>,
    attribute_type: u16,
    value: &[u8],
) -> Result<(), FormatError> {
    let length = u16::try_from(value.len()).map_err(|_| "Attribute value is too long")?;
    dest.extend_from_slice(&(attribute_type & !ATTRIBUTE_FORMAT_TV).to_be_bytes());
    dest.extend_from_slice(&length.to_be_bytes());
    dest.extend_from_slice(value);
    Ok(())
}

// Values above 0xffff don't fit a basic attribute and are sent as a 4-byte variable attribute.
pub fn write_duration_attribute(dest: &mut Vec<u8>, attribute_type: u16, value: u32) {
    if let Ok(value) = u16::try_from(value) {
        write_basic_attribute(dest, attribute_type, value);
    } else {
        dest.extend_from_slice(&(attribute_type & !ATTRIBUTE_FORMAT_TV).to_be_bytes());
        dest.extend_from_slice(&4u16.to_be_bytes());
        dest.extend_from_slice(&value.to_be_bytes());
    }
}

pub fn read_u16(data: &[u8]) -> u16 {
    let mut result = [0u8; 2];
    result.copy_from_slice(&data[0..2]);
    u16::from_be_bytes(result)
}

pub fn read_u32(data: &[u8]) -> u32 {
    let mut result = [0u8; 4];
    result.copy_from_slice(&data[0..4]);
    u32::from_be_bytes(result)
}

#[derive(Debug)]
pub struct FormatError {
    msg: &'static str,
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.msg)
    }
}

impl error::Error for FormatError {}

impl From<&'static str> for FormatError {
    fn from(msg: &'static str) -> FormatError {
        FormatError { msg }
    }
}
