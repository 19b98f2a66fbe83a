//! # Call Sessions
//!
//! Per-connection turn-taking for the carrier's media stream.
//!
//! ## Module Organization:
//! - **buffer**: Frames of the turn currently being listened to
//! - **timer**: Restartable trailing-silence countdown
//! - **machine**: The Listening/Speaking/Stopped state machine, one tokio task per call
//! - **registry**: Owns every live session, keyed by connection identity
//!
//! ## Data Flow:
//! ```text
//! WebSocket text ──▶ SessionRegistry::dispatch ──▶ session inbox ──▶ CallSession
//!                                                     ▲                  │
//!                                    SilenceTimer fire ┘                  ▼
//!                                                                   FrameSink ──▶ WebSocket
//! ```

pub mod buffer;
pub mod machine;
pub mod registry;
pub mod timer;

pub use machine::FrameSink;
pub use registry::SessionRegistry;
