//! Events and commands of the parent Discord gateway, as far as voice cares.
//!
//! The parent connection is an external collaborator; dispatches reach this
//! library as `(name, payload)` pairs and anything unrecognised is kept as
//! [`HostEvent::Unknown`] rather than dropped.

use serde_json::{json, Value};

#[derive(Clone, Debug)]
pub enum HostEvent {
  /// The parent gateway finished (re)connecting. A voice session that sees
  /// this mid-stream must assume its server-side state is stale.
  Ready,
  VoiceStateUpdate(VoiceStateUpdate),
  VoiceServerUpdate(VoiceServerUpdate),
  Unknown { name: String, data: Value }
}

#[derive(Clone, Debug)]
pub struct VoiceStateUpdate {
  pub guild_id: Option<u64>,
  pub user_id: Option<u64>,
  pub channel_id: Option<u64>,
  pub session_id: String
}

#[derive(Clone, Debug)]
pub struct VoiceServerUpdate {
  pub guild_id: u64,
  pub token: String,
  /// `None` when Discord has no voice server allocated for the guild.
  pub endpoint: Option<String>
}

impl HostEvent {
  pub fn from_dispatch(name: &str, data: Value) -> HostEvent {
    match name {
      "READY" => HostEvent::Ready,
      "VOICE_STATE_UPDATE" => match VoiceStateUpdate::from_value(&data) {
        Some(update) => HostEvent::VoiceStateUpdate(update),
        None => HostEvent::Unknown {
          name: name.to_owned(),
          data
        }
      },
      "VOICE_SERVER_UPDATE" => match VoiceServerUpdate::from_value(&data) {
        Some(update) => HostEvent::VoiceServerUpdate(update),
        None => HostEvent::Unknown {
          name: name.to_owned(),
          data
        }
      },
      _ => HostEvent::Unknown {
        name: name.to_owned(),
        data
      }
    }
  }
}

impl VoiceStateUpdate {
  fn from_value(data: &Value) -> Option<Self> {
    Some(Self {
      guild_id: data.get("guild_id").and_then(snowflake),
      user_id: data.get("user_id").and_then(snowflake),
      channel_id: data.get("channel_id").and_then(snowflake),
      session_id: data.get("session_id")?.as_str()?.to_owned()
    })
  }
}

impl VoiceServerUpdate {
  fn from_value(data: &Value) -> Option<Self> {
    Some(Self {
      guild_id: data.get("guild_id").and_then(snowflake)?,
      token: data.get("token")?.as_str()?.to_owned(),
      endpoint: data.get("endpoint").and_then(|value| value.as_str()).map(str::to_owned)
    })
  }
}

/// Discord serialises ids both as JSON numbers and as decimal strings.
fn snowflake(value: &Value) -> Option<u64> {
  match value {
    Value::Number(number) => number.as_u64(),
    Value::String(raw) => raw.parse().ok(),
    _ => None
  }
}

/// The one command voice issues to the parent gateway (opcode 4).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateVoiceState {
  pub guild_id: u64,
  pub channel_id: Option<u64>,
  pub self_mute: bool,
  pub self_deaf: bool
}

impl UpdateVoiceState {
  pub fn join(guild_id: u64, channel_id: u64) -> Self {
    Self {
      guild_id,
      channel_id: Some(channel_id),
      self_mute: false,
      self_deaf: false
    }
  }

  pub fn leave(guild_id: u64) -> Self {
    Self {
      guild_id,
      channel_id: None,
      self_mute: false,
      self_deaf: false
    }
  }

  pub fn to_command(&self) -> Value {
    json!({
      "op": 4,
      "d": {
        "guild_id": self.guild_id,
        "channel_id": self.channel_id,
        "self_mute": self.self_mute,
        "self_deaf": self.self_deaf
      }
    })
  }
}
