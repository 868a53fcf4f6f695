//! Client side of time-boxed access: keeps a playback surface supplied with
//! fresh signed handles.
//!
//! `schedule` decides when to rotate, `client` reaches the gate, `surface`
//! applies a handle to a media element and `session` drives the three.

pub mod client;
pub mod schedule;
pub mod session;
pub mod surface;

pub use client::{AccessClient, GateAccessClient, HttpAccessClient};
pub use schedule::{PolicyError, RotationPolicy};
pub use session::{EndReason, PlaybackEvent, PlaybackSession, SessionState};
pub use surface::{PlaybackSurface, Playhead};
