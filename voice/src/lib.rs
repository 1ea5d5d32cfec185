//! Core of a Discord voice client: the voice gateway websocket, the
//! encrypted UDP transport and the PCM-to-Opus pipeline.
//!
//! The parent gateway connection is not part of this crate; it is reached
//! through the event and command types in [`host`].

pub mod close_code;
pub mod codec;
pub mod constants;
pub mod error;
pub mod event;
pub mod host;
pub mod opcode;
pub mod udp;
pub mod ws;

pub use close_code::{GatewayCloseCode, ReconnectPolicy};
pub use error::VoiceError;
pub use event::{GatewayEvent, GatewayPacket};
pub use opcode::GatewayOpcode;
