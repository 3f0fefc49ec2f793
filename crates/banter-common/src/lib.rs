//! # banter-common
//!
//! Shared types and configuration used across the Banter client crates.
//! This is the foundation layer — no business logic, just primitives and contracts.

pub mod config;
pub mod events;

/// A voice-enabled container (guild/workspace).
pub type RoomId = uuid::Uuid;

/// A specific voice channel within a room.
pub type SubRoomId = uuid::Uuid;

/// A platform user.
pub type UserId = uuid::Uuid;
