//! The domain model: users, guilds, members, channels, messages, invites,
//! presences, and the snowflake ids tying them together.
//!
//! Aggregates reference each other by id only; the flat containers on
//! [`ChatState`](crate::ChatState) resolve them on access.

#[macro_use]
pub mod ids;
pub mod channel;
pub mod guild;
pub mod invite;
pub mod message;
pub mod permissions;
pub mod presence;
pub mod user;
