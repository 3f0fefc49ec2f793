//! # banter-voice
//!
//! Client-side voice/media session core for Banter.
//!
//! Architecture: the relay is an SFU — it forwards producer tracks to
//! subscribing consumers without re-encoding, so per-user volume stays a
//! client-side concern and the client negotiates one send and one recv
//! transport per session.
//!
//! - [`controller::VoiceSessionController`] — the session state machine:
//!   join/leave, transport and producer/consumer negotiation, mute/deafen,
//!   device switching, screen share. Cancellation is session-token based.
//! - [`engine`] — the trait seam to the external media engine that does the
//!   actual ICE/DTLS/SRTP work.
//! - [`signaling`] — the narrow gateway seam the controller talks through.
//! - [`levels`] — the local metering pipeline (RNNoise + RMS) behind the
//!   speaking indicator.
//! - [`roster`] — the thin reconciler merging authoritative snapshots with
//!   live deltas for presentation.

pub mod controller;
pub mod engine;
pub mod error;
pub mod levels;
pub mod policy;
pub mod roster;
mod session;
pub mod signaling;

pub use controller::VoiceSessionController;
pub use error::{Result, VoiceError};
pub use policy::{LocalMediaPolicy, UserAudioPreference};
pub use roster::{RemoteVoiceState, RosterEvent, VoiceRoster};
pub use signaling::Signaling;
