use std::net::IpAddr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::opcode::GatewayOpcode;

/// The `{"op": n, "d": ...}` envelope every voice gateway frame travels in.
#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayPacket {
  #[serde(rename = "op")]
  pub opcode: GatewayOpcode,
  #[serde(rename = "d")]
  pub data: Option<Value>
}

impl GatewayPacket {
  pub fn new<T>(opcode: GatewayOpcode, data: T) -> Self
  where
    T: Into<Option<Value>>
  {
    Self {
      opcode,
      data: data.into()
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum GatewayEvent {
  Identify(Identify),
  SelectProtocol(SelectProtocol),
  Ready(Ready),
  Heartbeat(u64),
  SessionDescription(SessionDescription),
  Speaking(Speaking),
  HeartbeatAck(u64),
  Resume(Resume),
  Hello(Hello),
  Resumed
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identify {
  pub server_id: u64,
  pub user_id: u64,
  pub session_id: String,
  pub token: String
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectProtocol {
  pub protocol: String,
  pub data: SelectProtocolData
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectProtocolData {
  pub address: IpAddr,
  pub port: u16,
  pub mode: String
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ready {
  pub ssrc: u32,
  pub ip: String,
  pub port: u16,
  pub modes: Vec<String>
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
  pub mode: String,
  pub secret_key: Vec<u8>
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Speaking {
  pub speaking: u8,
  pub delay: u32,
  pub ssrc: u32
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resume {
  pub server_id: u64,
  pub session_id: String,
  pub token: String
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hello {
  pub heartbeat_interval: f32
}

impl From<&GatewayEvent> for GatewayOpcode {
  fn from(event: &GatewayEvent) -> GatewayOpcode {
    use GatewayEvent::*;
    match event {
      Identify(_) => GatewayOpcode::Identify,
      SelectProtocol(_) => GatewayOpcode::SelectProtocol,
      Ready(_) => GatewayOpcode::Ready,
      Heartbeat(_) => GatewayOpcode::Heartbeat,
      SessionDescription(_) => GatewayOpcode::SessionDescription,
      Speaking(_) => GatewayOpcode::Speaking,
      HeartbeatAck(_) => GatewayOpcode::HeartbeatAck,
      Resume(_) => GatewayOpcode::Resume,
      Hello(_) => GatewayOpcode::Hello,
      Resumed => GatewayOpcode::Resumed
    }
  }
}

impl From<GatewayEvent> for GatewayOpcode {
  fn from(event: GatewayEvent) -> GatewayOpcode {
    (&event).into()
  }
}

impl TryFrom<GatewayPacket> for GatewayEvent {
  type Error = anyhow::Error;

  fn try_from(packet: GatewayPacket) -> Result<GatewayEvent, Self::Error> {
    use serde_json::from_value;
    use GatewayOpcode::*;

    let data = packet.data.context("no packet data");
    match packet.opcode {
      Identify => Ok(GatewayEvent::Identify(from_value(data?)?)),
      SelectProtocol => Ok(GatewayEvent::SelectProtocol(from_value(data?)?)),
      Ready => Ok(GatewayEvent::Ready(from_value(data?)?)),
      Heartbeat => Ok(GatewayEvent::Heartbeat(from_value(data?)?)),
      SessionDescription => Ok(GatewayEvent::SessionDescription(from_value(data?)?)),
      Speaking => Ok(GatewayEvent::Speaking(from_value(data?)?)),
      HeartbeatAck => Ok(GatewayEvent::HeartbeatAck(from_value(data?)?)),
      Resume => Ok(GatewayEvent::Resume(from_value(data?)?)),
      Hello => Ok(GatewayEvent::Hello(from_value(data?)?)),
      Resumed => Ok(GatewayEvent::Resumed),
      _ => Err(anyhow::anyhow!("unsupported opcode: {}", packet.opcode))
    }
  }
}

impl TryFrom<GatewayEvent> for GatewayPacket {
  type Error = anyhow::Error;

  fn try_from(event: GatewayEvent) -> Result<GatewayPacket, Self::Error> {
    use GatewayEvent::*;
    Ok(GatewayPacket {
      opcode: (&event).into(),
      data: match event {
        Identify(identify) => Some(serde_json::to_value(identify)?),
        SelectProtocol(select_protocol) => Some(serde_json::to_value(select_protocol)?),
        Ready(ready) => Some(serde_json::to_value(ready)?),
        Heartbeat(nonce) => Some(serde_json::to_value(nonce)?),
        SessionDescription(description) => Some(serde_json::to_value(description)?),
        Speaking(speaking) => Some(serde_json::to_value(speaking)?),
        HeartbeatAck(nonce) => Some(serde_json::to_value(nonce)?),
        Resume(resume) => Some(serde_json::to_value(resume)?),
        Hello(hello) => Some(serde_json::to_value(hello)?),
        Resumed => None
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ready_parses_from_the_wire_shape() {
    let packet: GatewayPacket = serde_json::from_str(
      r#"{"op":2,"d":{"ssrc":12345,"ip":"203.0.113.7","port":50004,"modes":["xsalsa20_poly1305","xsalsa20_poly1305_suffix"]}}"#
    )
    .unwrap();
    let event = GatewayEvent::try_from(packet).unwrap();

    match event {
      GatewayEvent::Ready(ready) => {
        assert_eq!(ready.ssrc, 12345);
        assert_eq!(ready.port, 50004);
        assert!(ready.modes.iter().any(|mode| mode == "xsalsa20_poly1305"));
      }
      other => panic!("expected ready, got {:?}", other)
    }
  }

  #[test]
  fn identify_round_trips_through_the_envelope() {
    let identify = Identify {
      server_id: 1,
      user_id: 2,
      session_id: "abc".to_owned(),
      token: "t".to_owned()
    };
    let packet: GatewayPacket = GatewayEvent::Identify(identify.clone()).try_into().unwrap();
    assert_eq!(u8::from(packet.opcode), 0);

    let json = serde_json::to_string(&packet).unwrap();
    let parsed: GatewayPacket = serde_json::from_str(&json).unwrap();
    assert_eq!(GatewayEvent::try_from(parsed).unwrap(), GatewayEvent::Identify(identify));
  }

  #[test]
  fn heartbeat_nonce_is_a_bare_number() {
    let packet: GatewayPacket = GatewayEvent::Heartbeat(1700000000).try_into().unwrap();
    assert_eq!(packet.data, Some(serde_json::json!(1700000000)));
  }

  #[test]
  fn resumed_has_no_payload() {
    let packet: GatewayPacket = serde_json::from_str(r#"{"op":9,"d":null}"#).unwrap();
    assert_eq!(GatewayEvent::try_from(packet).unwrap(), GatewayEvent::Resumed);
  }

  #[test]
  fn undocumented_opcodes_are_rejected_not_misread() {
    let packet: GatewayPacket = serde_json::from_str(r#"{"op":18,"d":{}}"#).unwrap();
    assert!(GatewayEvent::try_from(packet).is_err());
  }
}
