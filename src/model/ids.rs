//! Snowflake ids: 42 bits of millisecond timestamp, 11 bits of per-process
//! counter. Every entity on the platform is identified by one, so comparing
//! two ids with `<` also compares their creation order.

use std::fmt::{self, Display};
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde::de::Error;

use crate::model::ids::sealed::IsId;
use crate::utils::{millis_to_datetime, Clock};

/// 2015-01-01T00:00:00Z, the epoch snowflake timestamps count from.
pub const EPOCH_MILLIS: u64 = 1_420_070_400_000;

/// Bits reserved for the per-process counter.
pub const COUNTER_BITS: u64 = 11;

/// Recover the unix millisecond timestamp embedded in a raw snowflake.
pub fn snowflake_time(raw: u64) -> DateTime<Utc> {
    millis_to_datetime((raw >> COUNTER_BITS) + EPOCH_MILLIS)
}

/// The process-wide snowflake source.
///
/// Ids are `(millis_since_epoch << 11) | counter`. The last handed-out value
/// is kept in an atomic; a generation either takes the fresh clock reading or
/// `last + 1`, whichever is larger, so ids are strictly increasing even when
/// the counter overflows within one millisecond or the clock stalls.
#[derive(Debug)]
pub struct Snowflakes {
    last: AtomicU64,
    clock: Clock,
}

impl Snowflakes {
    pub fn new(clock: Clock) -> Self {
        Self {
            last: AtomicU64::new(0),
            clock,
        }
    }

    pub fn generate_raw(&self) -> u64 {
        loop {
            let last = self.last.load(Ordering::Acquire);
            let from_clock = (self.clock.now_millis() - EPOCH_MILLIS) << COUNTER_BITS;
            let next = if from_clock > last { from_clock } else { last + 1 };
            if self.last
                .compare_exchange(last, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next;
            }
        }
    }

    pub fn generate<I: From<u64>>(&self) -> I {
        I::from(self.generate_raw())
    }
}

macro_rules! id_impl {
    ($($id:tt),+ $(,)?) => {
        $(
            #[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
            pub struct $id(pub u64);

            impl $id {
                /// The moment this id was generated.
                pub fn timestamp(&self) -> DateTime<Utc> {
                    snowflake_time(self.0)
                }
            }

            impl Display for $id {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<u64> for $id {
                fn from(raw: u64) -> Self {
                    Self(raw)
                }
            }

            impl FromStr for $id {
                type Err = ParseIntError;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    Ok(Self(s.parse()?))
                }
            }

            impl<'de> Deserialize<'de> for $id {
                fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                    struct IdVisitor;

                    impl<'de> ::serde::de::Visitor<'de> for IdVisitor {
                        type Value = $id;

                        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                            write!(f, "a string ({})", stringify!($id))
                        }

                        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> where E: Error {
                            v.parse().map_err(E::custom)
                        }

                        fn visit_borrowed_str<E>(self, v: &'de str) -> Result<Self::Value, E> where E: Error {
                            v.parse().map_err(E::custom)
                        }

                        fn visit_string<E>(self, v: String) -> Result<Self::Value, E> where E: Error {
                            v.parse().map_err(E::custom)
                        }

                        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> where E: Error {
                            Ok($id(v))
                        }
                    }

                    d.deserialize_any(IdVisitor)
                }
            }

            impl Serialize for $id {
                fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                    let str = self.0.to_string();
                    s.serialize_str(&str)
                }
            }

            impl sealed::IsId for $id {}

            impl Id for $id {
                type Id = Self;

                fn id(&self) -> Self { *self }
            }
        )+
    };
}

id_impl!(
    UserId,
    GuildId,
    ChannelId,
    MessageId,
    RoleId,
    AttachmentId,
);

mod sealed {
    use std::fmt::Debug;

    pub trait IsId: Copy + std::hash::Hash + Eq + Debug {}
}

pub trait Id {
    type Id: IsId;

    fn id(&self) -> Self::Id;
}

/// Impl [Id](Id) for a type, using its `id` field to get the id.
macro_rules! obj_id_impl {
    ($ty:ty => $id_ty:ty) => {
        impl $crate::model::ids::Id for $ty {
            type Id = $id_ty;

            fn id(&self) -> Self::Id {
                self.id
            }
        }
    };
}

impl<'a, I: Id> Id for &'a I {
    type Id = I::Id;

    fn id(&self) -> Self::Id { (*self).id() }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let flakes = Snowflakes::new(Clock::new());
        let mut prev = 0;
        for _ in 0..10_000 {
            let id = flakes.generate_raw();
            assert!(id > prev, "{} !> {}", id, prev);
            prev = id;
        }
    }

    #[test]
    fn ids_are_unique_under_contention() {
        let flakes = std::sync::Arc::new(Snowflakes::new(Clock::new()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let flakes = std::sync::Arc::clone(&flakes);
                std::thread::spawn(move || (0..2_000).map(|_| flakes.generate_raw()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
    }

    #[test]
    fn timestamp_recoverable() {
        let clock = Clock::new();
        let flakes = Snowflakes::new(clock.clone());
        let before = clock.now_millis();
        let id: MessageId = flakes.generate();
        let after = clock.now_millis();
        let recovered = id.timestamp().timestamp_millis() as u64;
        assert!(recovered >= before.saturating_sub(1) && recovered <= after + 1);
    }

    #[test]
    fn string_round_trip() {
        let id = ChannelId(123_456_789_012);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"123456789012\"");
        let back: ChannelId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
