use std::{error, fmt};

use log::{debug, trace, warn};
use rand::Rng;

use super::message::{self, PayloadType, ISAKMP_HEADER_LENGTH, NON_ESP_MARKER_LENGTH};

pub const FRAGMENT_MAX_LENGTH: usize = 552;
const FRAGMENT_HEADER_LENGTH: usize = 8;
const FLAG_LAST: u8 = 0x01;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FragmentStatus {
    Incomplete,
    Complete,
}

struct Fragment {
    index: u8,
    data: Vec<u8>,
}

/// Header of a fragment payload, validated against the message carrying it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FragmentHeader {
    pub id: u16,
    pub index: u8,
    pub is_last: bool,
    length: usize,
}

impl FragmentHeader {
    /// Parses the fragment payload header of `message` (a full ISAKMP message with a single fragment payload).
    pub fn parse(message: &[u8]) -> Result<FragmentHeader, FragmentError> {
        if message.len() < ISAKMP_HEADER_LENGTH + FRAGMENT_HEADER_LENGTH {
            debug!("Message too short for a fragment: {} bytes", message.len());
            return Err("Message too short for a fragment".into());
        }
        let header = &message[ISAKMP_HEADER_LENGTH..ISAKMP_HEADER_LENGTH + FRAGMENT_HEADER_LENGTH];
        let length = message::read_u16(&header[2..4]) as usize;
        if length < FRAGMENT_HEADER_LENGTH || message.len() != ISAKMP_HEADER_LENGTH + length {
            debug!(
                "Fragment length {} doesn't match message length {}",
                length,
                message.len()
            );
            return Err("Fragment length mismatch".into());
        }
        let index = header[6];
        if index == 0 {
            debug!("Fragment index 0 is not valid");
            return Err("Invalid fragment index".into());
        }
        Ok(FragmentHeader {
            id: message::read_u16(&header[4..6]),
            index,
            is_last: header[7] & FLAG_LAST != 0,
            length,
        })
    }
}

/// Collects fragments of a single ISAKMP message until every index up to the last one is present.
#[derive(Default)]
pub struct FragmentReassembler {
    // Newest first.
    chain: Vec<Fragment>,
    group_id: Option<u16>,
    last_index: Option<u8>,
}

impl FragmentReassembler {
    pub fn new() -> FragmentReassembler {
        FragmentReassembler {
            chain: vec![],
            group_id: None,
            last_index: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn clear(&mut self) {
        self.chain.clear();
        self.group_id = None;
        self.last_index = None;
    }

    /// Stores the fragment carried by `message` (a full ISAKMP message with a single fragment payload).
    ///
    /// A fragment from a different group replaces the chain collected so far.
    pub fn extract(&mut self, message: &[u8]) -> Result<FragmentStatus, FragmentError> {
        let header = FragmentHeader::parse(message)?;
        trace!(
            "Received fragment id {} index {} last {} length {}",
            header.id,
            header.index,
            header.is_last,
            header.length
        );

        match self.group_id {
            Some(group_id) if group_id != header.id => {
                warn!(
                    "Fragment id {} replaces incomplete fragment chain {}",
                    header.id, group_id
                );
                self.clear();
            }
            _ => {}
        }
        if self.chain.iter().any(|fragment| fragment.index == header.index) {
            debug!("Ignoring duplicate fragment index {}", header.index);
            return Ok(FragmentStatus::Incomplete);
        }
        if let Some(last_index) = self.last_index {
            if header.is_last || header.index > last_index {
                warn!(
                    "Fragment {} is outside of chain ending at {}",
                    header.index, last_index
                );
                return Err("Fragment index beyond last fragment".into());
            }
        }
        if header.is_last {
            let max_index = self.chain.iter().map(|fragment| fragment.index).max();
            if max_index.is_some_and(|max_index| max_index > header.index) {
                warn!(
                    "Fragment {} is marked last, but fragment {:?} was already received",
                    header.index, max_index
                );
                return Err("Fragment index beyond last fragment".into());
            }
            self.last_index = Some(header.index);
        }
        self.group_id = Some(header.id);
        self.chain.insert(
            0,
            Fragment {
                index: header.index,
                data: message[ISAKMP_HEADER_LENGTH + FRAGMENT_HEADER_LENGTH..].to_vec(),
            },
        );
        if self.is_complete() {
            Ok(FragmentStatus::Complete)
        } else {
            Ok(FragmentStatus::Incomplete)
        }
    }

    fn is_complete(&self) -> bool {
        match self.last_index {
            Some(last_index) => (1..=last_index)
                .all(|index| self.chain.iter().any(|fragment| fragment.index == index)),
            None => false,
        }
    }

    /// Concatenates fragment data in index order and resets the reassembler.
    pub fn reassemble(&mut self) -> Result<Vec<u8>, FragmentError> {
        let last_index = match self.last_index {
            Some(last_index) if self.is_complete() => last_index,
            _ => return Err("Fragment chain is incomplete".into()),
        };
        let mut result = vec![];
        for index in 1..=last_index {
            let fragment = self
                .chain
                .iter()
                .find(|fragment| fragment.index == index)
                .ok_or("Missing fragment")?;
            result.extend_from_slice(&fragment.data);
        }
        self.clear();
        debug!(
            "Reassembled {} fragments into {} bytes",
            last_index,
            result.len()
        );
        Ok(result)
    }
}

/// Splits an ISAKMP message into fragment messages, each reusing the original header.
pub fn fragment_message(message: &[u8], ports_floated: bool) -> Result<Vec<Vec<u8>>, FragmentError> {
    if message.len() < ISAKMP_HEADER_LENGTH {
        return Err("Message is shorter than ISAKMP header".into());
    }
    let mut chunk_size = FRAGMENT_MAX_LENGTH - ISAKMP_HEADER_LENGTH - FRAGMENT_HEADER_LENGTH;
    if ports_floated {
        chunk_size -= NON_ESP_MARKER_LENGTH;
    }
    let chunks = message.chunks(chunk_size).collect::<Vec<_>>();
    if chunks.len() > u8::MAX as usize {
        return Err("Message needs too many fragments".into());
    }
    let id = rand::thread_rng().gen::<u16>();
    let mut fragments = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.iter().enumerate() {
        let fragment_length = FRAGMENT_HEADER_LENGTH + chunk.len();
        let total_length = ISAKMP_HEADER_LENGTH + fragment_length;
        let mut fragment = Vec::with_capacity(total_length);
        fragment.extend_from_slice(&message[..ISAKMP_HEADER_LENGTH]);
        fragment[16] = PayloadType::FRAGMENT.to_u8();
        fragment[24..28].copy_from_slice(&(total_length as u32).to_be_bytes());
        fragment.push(PayloadType::NONE.to_u8());
        fragment.push(0);
        fragment.extend_from_slice(&(fragment_length as u16).to_be_bytes());
        fragment.extend_from_slice(&id.to_be_bytes());
        fragment.push((i + 1) as u8);
        fragment.push(if i + 1 == chunks.len() { FLAG_LAST } else { 0 });
        fragment.extend_from_slice(chunk);
        fragments.push(fragment);
    }
    Ok(fragments)
}

#[derive(Debug)]
pub struct FragmentError {
    msg: &'static str,
}

impl fmt::Display for FragmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.msg)
    }
}

impl error::Error for FragmentError {}

impl From<&'static str> for FragmentError {
    fn from(msg: &'static str) -> FragmentError {
        FragmentError { msg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(length: usize) -> Vec<u8> {
        let mut message = vec![0u8; length];
        message[0..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        message[16] = PayloadType::SECURITY_ASSOCIATION.to_u8();
        message[17] = 0x10;
        message[18] = 2;
        message[24..28].copy_from_slice(&(length as u32).to_be_bytes());
        for (i, b) in message[ISAKMP_HEADER_LENGTH..].iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        message
    }

    #[test]
    fn reassembly_ignores_arrival_order() {
        let message = sample_message(1200);
        let fragments = fragment_message(&message, false).unwrap();
        assert_eq!(fragments.len(), 3);

        let mut in_order = FragmentReassembler::new();
        assert_eq!(in_order.extract(&fragments[0]).unwrap(), FragmentStatus::Incomplete);
        assert_eq!(in_order.extract(&fragments[1]).unwrap(), FragmentStatus::Incomplete);
        assert_eq!(in_order.extract(&fragments[2]).unwrap(), FragmentStatus::Complete);

        let mut shuffled = FragmentReassembler::new();
        assert_eq!(shuffled.extract(&fragments[2]).unwrap(), FragmentStatus::Incomplete);
        assert_eq!(shuffled.extract(&fragments[0]).unwrap(), FragmentStatus::Incomplete);
        assert_eq!(shuffled.extract(&fragments[1]).unwrap(), FragmentStatus::Complete);

        let first = in_order.reassemble().unwrap();
        let second = shuffled.reassemble().unwrap();
        assert_eq!(first, message);
        assert_eq!(first, second);
        assert!(in_order.is_empty());
    }

    #[test]
    fn duplicates_are_ignored() {
        let message = sample_message(700);
        let fragments = fragment_message(&message, true).unwrap();
        assert_eq!(fragments.len(), 2);
        let mut reassembler = FragmentReassembler::new();
        assert_eq!(
            reassembler.extract(&fragments[0]).unwrap(),
            FragmentStatus::Incomplete
        );
        assert_eq!(
            reassembler.extract(&fragments[0]).unwrap(),
            FragmentStatus::Incomplete
        );
        assert!(reassembler.reassemble().is_err());
        assert_eq!(
            reassembler.extract(&fragments[1]).unwrap(),
            FragmentStatus::Complete
        );
        assert_eq!(reassembler.reassemble().unwrap(), message);
    }

    #[test]
    fn incomplete_without_last_fragment() {
        let message = sample_message(1200);
        let fragments = fragment_message(&message, false).unwrap();
        let mut reassembler = FragmentReassembler::new();
        reassembler.extract(&fragments[0]).unwrap();
        reassembler.extract(&fragments[1]).unwrap();
        assert!(!reassembler.is_complete());
    }

    #[test]
    fn floated_ports_shrink_fragments() {
        let message = sample_message(1200);
        let fragments = fragment_message(&message, true).unwrap();
        assert!(fragments
            .iter()
            .all(|fragment| fragment.len() + NON_ESP_MARKER_LENGTH <= FRAGMENT_MAX_LENGTH));
        let plain = fragment_message(&message, false).unwrap();
        assert_eq!(plain[0].len(), FRAGMENT_MAX_LENGTH);
    }

    #[test]
    fn rejects_length_mismatch() {
        let message = sample_message(400);
        let mut fragment = fragment_message(&message, false).unwrap().remove(0);
        fragment.push(0);
        let mut reassembler = FragmentReassembler::new();
        assert!(reassembler.extract(&fragment).is_err());
        assert!(reassembler.extract(&fragment[..30]).is_err());
    }

    fn set_group(fragment: &mut [u8], id: u16) {
        fragment[ISAKMP_HEADER_LENGTH + 4..ISAKMP_HEADER_LENGTH + 6]
            .copy_from_slice(&id.to_be_bytes());
    }

    #[test]
    fn rejects_index_zero() {
        let message = sample_message(1200);
        let fragments = fragment_message(&message, false).unwrap();
        let mut reassembler = FragmentReassembler::new();

        let mut first = fragments[0].clone();
        first[ISAKMP_HEADER_LENGTH + 6] = 0;
        assert!(FragmentHeader::parse(&first).is_err());
        assert!(reassembler.extract(&first).is_err());
        assert!(reassembler.is_empty());

        // A lone last fragment with index 0 must not complete an empty chain.
        let mut last = fragments[2].clone();
        last[ISAKMP_HEADER_LENGTH + 6] = 0;
        assert!(reassembler.extract(&last).is_err());
        assert!(reassembler.is_empty());
        assert!(reassembler.reassemble().is_err());
    }

    #[test]
    fn rejects_conflicting_last_index() {
        let message = sample_message(1200);
        let mut fragments = fragment_message(&message, false).unwrap();
        let mut reassembler = FragmentReassembler::new();
        assert_eq!(
            reassembler.extract(&fragments[2]).unwrap(),
            FragmentStatus::Incomplete
        );

        // Second fragment also claims to be last.
        fragments[1][ISAKMP_HEADER_LENGTH + 7] = FLAG_LAST;
        assert!(reassembler.extract(&fragments[1]).is_err());

        let mut beyond = fragments[0].clone();
        beyond[ISAKMP_HEADER_LENGTH + 6] = 4;
        assert!(reassembler.extract(&beyond).is_err());

        // The original chain is still usable.
        fragments[1][ISAKMP_HEADER_LENGTH + 7] = 0;
        reassembler.extract(&fragments[0]).unwrap();
        assert_eq!(
            reassembler.extract(&fragments[1]).unwrap(),
            FragmentStatus::Complete
        );
        assert_eq!(reassembler.reassemble().unwrap(), message);
    }

    #[test]
    fn rejects_last_below_received_index() {
        let message = sample_message(1200);
        let mut fragments = fragment_message(&message, false).unwrap();
        fragments[0][ISAKMP_HEADER_LENGTH + 7] = FLAG_LAST;
        let mut reassembler = FragmentReassembler::new();
        reassembler.extract(&fragments[1]).unwrap();
        assert!(reassembler.extract(&fragments[0]).is_err());
        assert!(!reassembler.is_complete());
    }

    #[test]
    fn new_group_replaces_chain() {
        let message = sample_message(1200);
        let mut first = fragment_message(&message, false).unwrap();
        let mut second = fragment_message(&message, false).unwrap();
        first.iter_mut().for_each(|fragment| set_group(fragment, 1));
        second.iter_mut().for_each(|fragment| set_group(fragment, 2));

        let mut reassembler = FragmentReassembler::new();
        reassembler.extract(&first[0]).unwrap();
        reassembler.extract(&first[1]).unwrap();
        assert_eq!(
            reassembler.extract(&second[2]).unwrap(),
            FragmentStatus::Incomplete
        );
        assert_eq!(
            reassembler.extract(&second[0]).unwrap(),
            FragmentStatus::Incomplete
        );
        assert_eq!(
            reassembler.extract(&second[1]).unwrap(),
            FragmentStatus::Complete
        );
        assert_eq!(reassembler.reassemble().unwrap(), message);
    }
}
