use std::fmt;

use serde::{Deserialize, Serialize};

use self::GatewayOpcode::*;

/// Voice gateway opcodes (v4).
///
/// Codes this client has no handling for are kept as [`Unknown`] so they
/// survive a round trip through the packet envelope instead of failing
/// deserialisation.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum GatewayOpcode {
  Identify,
  SelectProtocol,
  Ready,
  Heartbeat,
  SessionDescription,
  Speaking,
  HeartbeatAck,
  Resume,
  Hello,
  Resumed,
  ClientDisconnect,
  Unknown(u8)
}

impl GatewayOpcode {
  /// The raw wire code.
  pub const fn code(self) -> u8 {
    match self {
      Identify => 0,
      SelectProtocol => 1,
      Ready => 2,
      Heartbeat => 3,
      SessionDescription => 4,
      Speaking => 5,
      HeartbeatAck => 6,
      Resume => 7,
      Hello => 8,
      Resumed => 9,
      ClientDisconnect => 13,
      Unknown(code) => code
    }
  }

  /// Opcodes a client may legitimately put on the wire.
  ///
  /// Heartbeat and HeartbeatAck flow in both directions under the observed
  /// heartbeat exchange; everything else outbound is a handshake frame or a
  /// Speaking update. The connection's sender drops user frames that fail
  /// this check rather than echoing server payloads back at the gateway.
  pub const fn client_sendable(self) -> bool {
    matches!(self, Identify | SelectProtocol | Heartbeat | Speaking | HeartbeatAck | Resume)
  }
}

impl fmt::Display for GatewayOpcode {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}", self.code())
  }
}

impl From<GatewayOpcode> for u8 {
  fn from(opcode: GatewayOpcode) -> u8 {
    opcode.code()
  }
}

impl From<u8> for GatewayOpcode {
  fn from(code: u8) -> GatewayOpcode {
    match code {
      0 => Identify,
      1 => SelectProtocol,
      2 => Ready,
      3 => Heartbeat,
      4 => SessionDescription,
      5 => Speaking,
      6 => HeartbeatAck,
      7 => Resume,
      8 => Hello,
      9 => Resumed,
      13 => ClientDisconnect,
      _ => Unknown(code)
    }
  }
}
