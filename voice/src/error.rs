use thiserror::Error;

/// Failures a voice session surfaces to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoiceError {
  /// The parent gateway never answered the voice-state request.
  #[error("voice gateway did not respond to the join request")]
  NotAvailable,
  /// The voice server update carried a null endpoint; the guild has no
  /// voice server allocated right now.
  #[error("no voice server is available for the guild")]
  NoServerAvailable,
  /// The voice gateway deviated from the documented handshake order.
  #[error("voice gateway sent a payload out of order")]
  InvalidPayloadOrder,
  /// The server offered none of the encryption modes this client speaks.
  #[error("server does not offer encryption mode {0}")]
  ModeUnavailable(String),
  /// The voice gateway closed the session with a terminal close code.
  #[error("voice gateway closed the session with code {0}")]
  Closed(u16)
}
