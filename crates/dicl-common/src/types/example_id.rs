//! ExampleId - time-sortable identity for stored examples
//!
//! Ids are UUIDv7 values: the leading 48 bits hold the Unix timestamp in
//! milliseconds, the next 12 bits a per-process sequence. Byte order therefore
//! equals creation order, and the creation timestamp is recoverable from the id
//! alone without a separate column.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::{Builder, Uuid};

/// Largest value the 12-bit sequence field can carry
const MAX_SEQUENCE: u16 = 0x0fff;

struct IdClock {
    last_millis: u64,
    sequence: u16,
}

static ID_CLOCK: Mutex<IdClock> = parking_lot::const_mutex(IdClock {
    last_millis: 0,
    sequence: 0,
});

/// Unique, immutable, time-sortable example identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExampleId(Uuid);

impl ExampleId {
    /// Generate a fresh id, strictly greater than every id previously generated
    /// by this process.
    ///
    /// # Example
    /// ```
    /// use dicl_common::ExampleId;
    ///
    /// let first = ExampleId::new();
    /// let second = ExampleId::new();
    /// assert!(second > first);
    /// ```
    pub fn new() -> Self {
        let now = Utc::now().timestamp_millis().max(0) as u64;

        let (millis, sequence) = {
            let mut clock = ID_CLOCK.lock();
            if now > clock.last_millis {
                clock.last_millis = now;
                clock.sequence = 0;
            } else if clock.sequence < MAX_SEQUENCE {
                clock.sequence += 1;
            } else {
                // Sequence exhausted within this millisecond; borrow the next one.
                clock.last_millis += 1;
                clock.sequence = 0;
            }
            (clock.last_millis, clock.sequence)
        };

        let mut random = [0u8; 10];
        rand::thread_rng().fill_bytes(&mut random[2..]);
        random[0..2].copy_from_slice(&sequence.to_be_bytes());

        Self(Builder::from_unix_timestamp_millis(millis, &random).into_uuid())
    }

    /// Wrap an existing UUID (e.g. read back from persistence)
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from the canonical hyphenated form
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Whether the id is a UUIDv7, so that its order is creation order
    pub fn is_time_ordered(&self) -> bool {
        self.0.get_version_num() == 7
    }

    /// Creation time encoded in the id, if it carries one
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let (secs, nanos) = self.0.get_timestamp()?.to_unix();
        DateTime::<Utc>::from_timestamp(secs as i64, nanos)
    }
}

impl Default for ExampleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExampleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ExampleId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let ids: Vec<ExampleId> = (0..10_000).map(|_| ExampleId::new()).collect();
        for pair in ids.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_created_at_recoverable() {
        let before = Utc::now().timestamp_millis();
        let id = ExampleId::new();
        let after = Utc::now().timestamp_millis();

        let created = id.created_at().unwrap().timestamp_millis();
        // The sequence borrow can push an id at most a few ms ahead of the wall clock.
        assert!(created >= before);
        assert!(created <= after + 5);
    }

    #[test]
    fn test_uuid_version() {
        let id = ExampleId::new();
        assert_eq!(id.as_uuid().get_version_num(), 7);
    }

    #[test]
    fn test_only_v7_is_time_ordered() {
        assert!(ExampleId::new().is_time_ordered());
        assert!(!ExampleId::from_uuid(Uuid::new_v4()).is_time_ordered());
        assert!(!ExampleId::from_uuid(Uuid::nil()).is_time_ordered());
    }

    #[test]
    fn test_serde_transparent() {
        let id = ExampleId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));

        let parsed: ExampleId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
