//! # Carrier Streaming Protocol
//!
//! The carrier talks to us over a WebSocket using JSON text frames. Every frame is an
//! object with an `event` tag; the remaining fields depend on the tag.
//!
//! ## Inbound vocabulary:
//! - **connected**: Socket is up, no call metadata yet
//! - **start**: Stream/call identity plus caller and callee numbers
//! - **media**: One audio chunk (`chunk`, `timestamp`, base64 `payload`)
//! - **dtmf**: Key press (`digit`, `duration`)
//! - **mark**: Named playback marker
//! - **clear**: Stop whatever is playing and drop buffered audio
//! - **stop**: Call is over
//!
//! ## Outbound vocabulary:
//! We only ever answer with the shapes we receive: `media` echoes and
//! `dtmf`/`mark`/`clear` acknowledgements.
//!
//! Field names are defined by the carrier and must stay byte-for-byte identical.

pub mod inbound;   // Decoding raw text into typed events
pub mod outbound;  // Encoding echoes and acknowledgements

pub use inbound::{decode, AudioFrame, EventKind, InboundEvent, StartInfo};
pub use outbound::{encode, OutboundFrame};
