//! Global transaction identifiers for remote branches.
//!
//! A GID names one prepared branch on one participant. The text form is
//!
//! ```text
//! dtx1-<coordinator:016x>-<local xid:016x>-<branch seq:08x>
//! ```
//!
//! Every field is fixed-width lowercase hex, so the string is always
//! [`GID_LEN`] bytes and the first [`PREFIX_LEN`] bytes identify the
//! coordinator that issued it. Participants may hold prepared branches of
//! several coordinators; the prefix lets a coordinator pick out its own
//! without decoding anybody else's.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{DistTxnError, Result};

const TAG: &str = "dtx1-";
const COORDINATOR_WIDTH: usize = 16;
const XID_WIDTH: usize = 16;
const SEQ_WIDTH: usize = 8;

/// Length of the coordinator scoped prefix, trailing separator included.
pub const PREFIX_LEN: usize = TAG.len() + COORDINATOR_WIDTH + 1;
/// Length of every encoded GID.
pub const GID_LEN: usize = PREFIX_LEN + XID_WIDTH + 1 + SEQ_WIDTH;

/// Identity of a coordinator process, unique across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoordinatorId(pub u64);

impl fmt::Display for CoordinatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifier of one remote branch of a local transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gid {
    pub coordinator: CoordinatorId,
    pub local_xid: u64,
    pub branch_seq: u32,
}

impl Gid {
    pub fn new(coordinator: CoordinatorId, local_xid: u64, branch_seq: u32) -> Self {
        Self {
            coordinator,
            local_xid,
            branch_seq,
        }
    }

    /// The text form sent to participants.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:016x}-{:016x}-{:08x}",
            TAG, self.coordinator.0, self.local_xid, self.branch_seq
        )
    }
}

impl FromStr for Gid {
    type Err = DistTxnError;

    /// Strict parse of a GID issued by any coordinator.
    fn from_str(s: &str) -> Result<Self> {
        let malformed = || DistTxnError::MalformedGid(s.to_string());

        if s.len() != GID_LEN || !s.starts_with(TAG) {
            return Err(malformed());
        }
        let body = &s.as_bytes()[TAG.len()..];
        let xid_start = COORDINATOR_WIDTH + 1;
        let seq_start = xid_start + XID_WIDTH + 1;
        if body[COORDINATOR_WIDTH] != b'-' || body[xid_start + XID_WIDTH] != b'-' {
            return Err(malformed());
        }

        let coordinator = parse_hex(&body[..COORDINATOR_WIDTH]).ok_or_else(malformed)?;
        let local_xid = parse_hex(&body[xid_start..xid_start + XID_WIDTH]).ok_or_else(malformed)?;
        let branch_seq = parse_hex(&body[seq_start..]).ok_or_else(malformed)?;

        Ok(Gid {
            coordinator: CoordinatorId(coordinator),
            local_xid,
            // SEQ_WIDTH hex digits always fit.
            branch_seq: branch_seq as u32,
        })
    }
}

/// Lowercase hex only; `from_str_radix` alone would accept `+` and uppercase.
fn parse_hex(digits: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    for &d in digits {
        let nibble = match d {
            b'0'..=b'9' => d - b'0',
            b'a'..=b'f' => d - b'a' + 10,
            _ => return None,
        };
        value = (value << 4) | u64::from(nibble);
    }
    Some(value)
}

/// Encodes a GID without constructing a codec.
pub fn encode(coordinator: CoordinatorId, local_xid: u64, branch_seq: u32) -> String {
    Gid::new(coordinator, local_xid, branch_seq).encode()
}

/// Encoder/decoder bound to one coordinator identity.
///
/// `decode` only accepts GIDs carrying this coordinator's prefix; anything
/// else, including perfectly valid GIDs of other coordinators, is reported
/// as [`DistTxnError::MalformedGid`].
#[derive(Debug, Clone)]
pub struct GidCodec {
    coordinator: CoordinatorId,
    prefix: String,
}

impl GidCodec {
    pub fn new(coordinator: CoordinatorId) -> Self {
        Self {
            coordinator,
            prefix: format!("{}{}-", TAG, coordinator),
        }
    }

    pub fn coordinator(&self) -> CoordinatorId {
        self.coordinator
    }

    /// The prefix shared by every GID this coordinator issues.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn encode(&self, local_xid: u64, branch_seq: u32) -> String {
        encode(self.coordinator, local_xid, branch_seq)
    }

    /// Cheap ownership test used to filter a participant's in-doubt list.
    pub fn owns(&self, gid: &str) -> bool {
        gid.starts_with(&self.prefix)
    }

    pub fn decode(&self, gid: &str) -> Result<Gid> {
        if !self.owns(gid) {
            return Err(DistTxnError::MalformedGid(gid.to_string()));
        }
        let parsed: Gid = gid.parse()?;
        debug_assert_eq!(parsed.coordinator, self.coordinator);
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_fixed_width() {
        let gid = Gid::new(CoordinatorId(1), 42, 3);
        let text = gid.encode();
        assert_eq!(text, "dtx1-0000000000000001-000000000000002a-00000003");
        assert_eq!(text.len(), GID_LEN);
    }

    #[test]
    fn extremes_round_trip() {
        let codec = GidCodec::new(CoordinatorId(u64::MAX));
        let text = codec.encode(u64::MAX, u32::MAX);
        let gid = codec.decode(&text).unwrap();
        assert_eq!(gid, Gid::new(CoordinatorId(u64::MAX), u64::MAX, u32::MAX));
    }

    #[test]
    fn foreign_coordinator_is_rejected() {
        let ours = GidCodec::new(CoordinatorId(1));
        let theirs = GidCodec::new(CoordinatorId(2));
        let text = theirs.encode(10, 0);

        assert!(!ours.owns(&text));
        assert!(matches!(ours.decode(&text), Err(DistTxnError::MalformedGid(_))));
        // Still a valid GID in general.
        assert!(text.parse::<Gid>().is_ok());
    }

    #[test]
    fn corrupted_strings_are_rejected() {
        let codec = GidCodec::new(CoordinatorId(1));
        let good = codec.encode(5, 1);

        let truncated = &good[..good.len() - 1];
        let uppercase = good.to_uppercase();
        let signed = good.replacen("-0000000000000005", "-+000000000000005", 1);
        let bad_separator = good.replacen("-00000001", "_00000001", 1);

        for candidate in [truncated, uppercase.as_str(), signed.as_str(), bad_separator.as_str(), ""] {
            assert!(
                codec.decode(candidate).is_err(),
                "accepted {candidate:?}"
            );
        }
    }
}
