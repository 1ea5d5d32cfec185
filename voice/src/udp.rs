//! Voice UDP transport: IP discovery, RTP framing, encryption, paced sends.

use std::net::IpAddr;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use discortp::discord::{IpDiscoveryPacket, IpDiscoveryType, MutableIpDiscoveryPacket, MutableKeepalivePacket};
use discortp::rtp::{MutableRtpPacket, RtpPacket, RtpType};
use discortp::wrap::{Wrap16, Wrap32};
use discortp::MutablePacket;
use flume::{Receiver, Sender};
use rand::random;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};
use utils::cell::Cell;
use xsalsa20poly1305::aead::generic_array::GenericArray;
use xsalsa20poly1305::{AeadInPlace, Key, KeyInit, XSalsa20Poly1305, TAG_SIZE};

use crate::constants::{FRAME_DURATION, MAX_OPUS_FRAME, TIMESTAMP_STEP, UDP_KEEPALIVE_INTERVAL};

const RTP_HEADER_LEN: usize = 12;
const RTP_BUFFER_SIZE: usize = RTP_HEADER_LEN + TAG_SIZE + MAX_OPUS_FRAME;

/// The session's externally visible address, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpDiscoveryResult {
  pub ssrc: u32,
  pub address: IpAddr,
  pub port: u16
}

#[derive(Debug, Clone)]
pub enum UdpEvent {
  IpDiscovered(IpDiscoveryResult),
  /// A received RTP datagram, verbatim. This library does not decode peer
  /// audio; the bytes are surfaced for whoever wants them.
  Packet(Vec<u8>)
}

/// What a session owner holds: transport events in, Opus frames out.
#[derive(Clone)]
pub struct UdpHandle {
  pub events: Receiver<UdpEvent>,
  pub frames: Sender<Vec<u8>>
}

pub struct UdpLaunchOptions {
  pub ssrc: u32,
  pub ip: String,
  pub port: u16,
  pub mode: String,
  pub events: Sender<UdpEvent>,
  pub frames: Receiver<Vec<u8>>,
  /// Filled by the websocket once Session Description arrives. No audio
  /// leaves the socket before then.
  pub secret_key: Cell<[u8; 32]>
}

/// Runs one transport until its session ends or the socket fails.
pub async fn run(options: UdpLaunchOptions) -> Result<()> {
  let socket = UdpSocket::bind("0.0.0.0:0").await?;
  socket.connect((options.ip.as_str(), options.port)).await?;
  debug!("voice udp socket bound to {:?}", socket.local_addr());

  let discovery = discover_ip(&socket, options.ssrc).await?;
  debug!("discovered public address {}:{}", discovery.address, discovery.port);
  options
    .events
    .send_async(UdpEvent::IpDiscovered(discovery))
    .await
    .context("session dropped during ip discovery")?;

  let key = options.secret_key.wait().await;
  let cipher = XSalsa20Poly1305::new(Key::from_slice(&key));
  debug!("voice udp transport keyed, starting transmission");

  let mut stream = RtpStream::new(options.ssrc);
  let mut rtp_buffer = vec![0u8; RTP_BUFFER_SIZE];
  let mut receive_buffer = [0u8; 1460];
  let mut deadline = Instant::now();

  let mut keepalive = interval(UDP_KEEPALIVE_INTERVAL);
  keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    select! {
      frame = options.frames.recv_async() => {
        let frame = match frame {
          Ok(frame) => frame,
          // every producer handle is gone; the session is over
          Err(_) => break
        };

        // pace on the 20 ms wall-clock grid so scheduling jitter does not
        // accumulate; after a producer stall, re-anchor instead of bursting
        sleep_until(deadline).await;
        let length = stream.seal(&cipher, &mut rtp_buffer, &frame)?;
        socket.send(&rtp_buffer[..length]).await?;

        deadline += FRAME_DURATION;
        let now = Instant::now();
        if deadline < now {
          deadline = now;
        }
      }

      _ = keepalive.tick() => {
        send_keepalive(&socket, options.ssrc).await?;
      }

      received = socket.recv(&mut receive_buffer) => {
        let length = received?;
        if let Some(event) = classify(&receive_buffer[..length]) {
          match options.events.try_send(event) {
            Ok(()) => {}
            // inbound is bounded and nobody is required to drain it
            Err(flume::TrySendError::Full(_)) => trace!("inbound queue full, dropping datagram"),
            Err(flume::TrySendError::Disconnected(_)) => break
          }
        }
      }
    }
  }

  debug!("voice udp transport exiting");
  Ok(())
}

struct RtpStream {
  ssrc: u32,
  sequence: Wrap16,
  timestamp: Wrap32
}

impl RtpStream {
  fn new(ssrc: u32) -> Self {
    Self {
      ssrc,
      sequence: random::<u16>().into(),
      timestamp: random::<u32>().into()
    }
  }

  /// Writes one encrypted RTP packet into `buffer`, returning its length.
  ///
  /// The nonce is the 12-byte RTP header zero-padded to 24 bytes; the
  /// payload is the 16-byte tag followed by the ciphertext.
  fn seal(&mut self, cipher: &XSalsa20Poly1305, buffer: &mut [u8], opus: &[u8]) -> Result<usize> {
    if opus.len() > MAX_OPUS_FRAME {
      return Err(anyhow!("opus frame of {} bytes exceeds the packet budget", opus.len()));
    }

    let mut view = MutableRtpPacket::new(buffer).context("rtp buffer too small")?;
    view.set_version(2);
    view.set_payload_type(RtpType::Unassigned(0x78));
    view.set_sequence(self.sequence);
    self.sequence += 1;
    view.set_timestamp(self.timestamp);
    self.timestamp += TIMESTAMP_STEP as u32;
    view.set_ssrc(self.ssrc);

    let mut nonce_bytes = [0u8; 24];
    nonce_bytes[..RTP_HEADER_LEN].copy_from_slice(&buffer[..RTP_HEADER_LEN]);
    let nonce = GenericArray::from_slice(&nonce_bytes);

    let payload = &mut buffer[RTP_HEADER_LEN..];
    payload[TAG_SIZE..TAG_SIZE + opus.len()].copy_from_slice(opus);
    let tag = cipher
      .encrypt_in_place_detached(nonce, b"", &mut payload[TAG_SIZE..TAG_SIZE + opus.len()])
      .map_err(|error| anyhow!("voice packet encryption failed: {}", error))?;
    payload[..TAG_SIZE].copy_from_slice(&tag);

    Ok(RTP_HEADER_LEN + TAG_SIZE + opus.len())
  }
}

async fn discover_ip(socket: &UdpSocket, ssrc: u32) -> Result<IpDiscoveryResult> {
  let mut buffer = [0; IpDiscoveryPacket::const_packet_size()];
  let mut view = MutableIpDiscoveryPacket::new(&mut buffer).unwrap();
  view.set_pkt_type(IpDiscoveryType::Request);
  view.set_length(70);
  view.set_ssrc(ssrc);
  socket.send(&buffer).await?;

  let length = socket.recv(&mut buffer).await?;
  parse_discovery(&buffer[..length])
}

fn parse_discovery(data: &[u8]) -> Result<IpDiscoveryResult> {
  let view = IpDiscoveryPacket::new(data).context("malformed ip discovery response")?;
  if view.get_pkt_type() != IpDiscoveryType::Response {
    return Err(anyhow!("unexpected ip discovery packet type"));
  }

  let raw = view.get_address_raw();
  let null_index = raw
    .iter()
    .position(|&byte| byte == 0)
    .context("unterminated address in ip discovery response")?;
  let address = std::str::from_utf8(&raw[..null_index])?;

  Ok(IpDiscoveryResult {
    ssrc: view.get_ssrc(),
    address: IpAddr::from_str(address)?,
    port: view.get_port()
  })
}

fn classify(data: &[u8]) -> Option<UdpEvent> {
  if data.len() == IpDiscoveryPacket::const_packet_size() {
    if let Ok(result) = parse_discovery(data) {
      return Some(UdpEvent::IpDiscovered(result));
    }
  }

  if RtpPacket::new(data).map_or(false, |view| view.get_version() == 2) {
    return Some(UdpEvent::Packet(data.to_vec()));
  }

  trace!("discarding unrecognised datagram of {} bytes", data.len());
  None
}

async fn send_keepalive(socket: &UdpSocket, ssrc: u32) -> Result<()> {
  let mut buffer = [0; MutableKeepalivePacket::minimum_packet_size()];
  let mut view = MutableKeepalivePacket::new(&mut buffer).unwrap();
  view.set_ssrc(ssrc);
  socket.send(&buffer).await?;
  trace!("sent udp keepalive");
  Ok(())
}

#[cfg(test)]
mod tests {
  use crate::constants::OUTBOUND_FRAME_QUEUE;

  use super::*;

  fn cipher_of(key: [u8; 32]) -> XSalsa20Poly1305 {
    XSalsa20Poly1305::new(Key::from_slice(&key))
  }

  fn open(cipher: &XSalsa20Poly1305, packet: &[u8]) -> Vec<u8> {
    let mut nonce_bytes = [0u8; 24];
    nonce_bytes[..RTP_HEADER_LEN].copy_from_slice(&packet[..RTP_HEADER_LEN]);
    let nonce = GenericArray::from_slice(&nonce_bytes);

    let tag = GenericArray::clone_from_slice(&packet[RTP_HEADER_LEN..RTP_HEADER_LEN + TAG_SIZE]);
    let mut ciphertext = packet[RTP_HEADER_LEN + TAG_SIZE..].to_vec();
    cipher
      .decrypt_in_place_detached(nonce, b"", &mut ciphertext, &tag)
      .expect("authentication failed");
    ciphertext
  }

  #[test]
  fn sealed_packets_round_trip() {
    let cipher = cipher_of([7u8; 32]);
    let mut stream = RtpStream::new(12345);
    let mut buffer = vec![0u8; RTP_BUFFER_SIZE];

    let opus = [0xf8, 0xff, 0xfe];
    let length = stream.seal(&cipher, &mut buffer, &opus).unwrap();

    assert_eq!(length, RTP_HEADER_LEN + TAG_SIZE + opus.len());
    assert_eq!(buffer[0], 0x80);
    assert_eq!(buffer[1], 0x78);
    assert_eq!(open(&cipher, &buffer[..length]), opus);
  }

  #[test]
  fn tampered_packets_fail_authentication() {
    let cipher = cipher_of([7u8; 32]);
    let mut stream = RtpStream::new(12345);
    let mut buffer = vec![0u8; RTP_BUFFER_SIZE];

    let length = stream.seal(&cipher, &mut buffer, &[1, 2, 3, 4]).unwrap();
    buffer[length - 1] ^= 0xff;

    let mut nonce_bytes = [0u8; 24];
    nonce_bytes[..RTP_HEADER_LEN].copy_from_slice(&buffer[..RTP_HEADER_LEN]);
    let nonce = GenericArray::from_slice(&nonce_bytes);
    let tag = GenericArray::clone_from_slice(&buffer[RTP_HEADER_LEN..RTP_HEADER_LEN + TAG_SIZE]);
    let mut ciphertext = buffer[RTP_HEADER_LEN + TAG_SIZE..length].to_vec();

    assert!(cipher.decrypt_in_place_detached(nonce, b"", &mut ciphertext, &tag).is_err());
  }

  #[test]
  fn sequence_and_timestamp_advance_per_frame() {
    let cipher = cipher_of([0u8; 32]);
    let mut stream = RtpStream::new(12345);
    let mut buffer = vec![0u8; RTP_BUFFER_SIZE];

    let mut sequences = Vec::new();
    let mut timestamps = Vec::new();
    for _ in 0..3 {
      let length = stream.seal(&cipher, &mut buffer, &[0u8; 8]).unwrap();
      let view = RtpPacket::new(&buffer[..length]).unwrap();
      assert_eq!(view.get_ssrc(), 12345);
      sequences.push(view.get_sequence());
      timestamps.push(view.get_timestamp());
    }

    assert_eq!(sequences[1], sequences[0] + 1);
    assert_eq!(sequences[2], sequences[0] + 2);
    assert_eq!(timestamps[1], timestamps[0] + 960);
    assert_eq!(timestamps[2], timestamps[0] + 1920);
  }

  #[test]
  fn discovery_replies_parse_to_address_and_port() {
    let mut reply = [0u8; IpDiscoveryPacket::const_packet_size()];
    let mut view = MutableIpDiscoveryPacket::new(&mut reply).unwrap();
    view.set_pkt_type(IpDiscoveryType::Response);
    view.set_length(70);
    view.set_ssrc(12345);
    reply[8..8 + 9].copy_from_slice(b"127.0.0.1");
    reply[72] = 0xc3;
    reply[73] = 0x52; // port 50002 big-endian

    let result = parse_discovery(&reply).unwrap();
    assert_eq!(result.ssrc, 12345);
    assert_eq!(result.address, IpAddr::from_str("127.0.0.1").unwrap());
    assert_eq!(result.port, 50002);
  }

  #[test]
  fn discovery_requests_are_not_mistaken_for_replies() {
    let mut request = [0u8; IpDiscoveryPacket::const_packet_size()];
    let mut view = MutableIpDiscoveryPacket::new(&mut request).unwrap();
    view.set_pkt_type(IpDiscoveryType::Request);
    view.set_length(70);
    view.set_ssrc(12345);

    assert!(parse_discovery(&request).is_err());
  }

  #[test]
  fn classify_separates_rtp_from_noise() {
    let cipher = cipher_of([0u8; 32]);
    let mut stream = RtpStream::new(1);
    let mut buffer = vec![0u8; RTP_BUFFER_SIZE];
    let length = stream.seal(&cipher, &mut buffer, &[0u8; 16]).unwrap();

    assert!(matches!(classify(&buffer[..length]), Some(UdpEvent::Packet(_))));
    assert!(classify(&[0u8; 4]).is_none());
  }

  #[tokio::test]
  async fn mock_peer_discovery_round_trip() {
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(peer_addr).await.unwrap();

    let echo = tokio::spawn(async move {
      let mut buffer = [0u8; 128];
      let (length, from) = peer.recv_from(&mut buffer).await.unwrap();
      assert_eq!(length, IpDiscoveryPacket::const_packet_size());

      let request = IpDiscoveryPacket::new(&buffer[..length]).unwrap();
      assert_eq!(request.get_pkt_type(), IpDiscoveryType::Request);
      let ssrc = request.get_ssrc();

      let mut reply = [0u8; IpDiscoveryPacket::const_packet_size()];
      let mut view = MutableIpDiscoveryPacket::new(&mut reply).unwrap();
      view.set_pkt_type(IpDiscoveryType::Response);
      view.set_length(70);
      view.set_ssrc(ssrc);
      let address = from.ip().to_string();
      reply[8..8 + address.len()].copy_from_slice(address.as_bytes());
      reply[72..74].copy_from_slice(&from.port().to_be_bytes());
      peer.send_to(&reply, from).await.unwrap();
    });

    let result = discover_ip(&client, 12345).await.unwrap();
    echo.await.unwrap();

    assert_eq!(result.ssrc, 12345);
    assert_eq!(result.address, client.local_addr().unwrap().ip());
    assert_eq!(result.port, client.local_addr().unwrap().port());
  }

  #[test]
  fn outbound_queue_blocks_at_its_bound() {
    let (tx, rx) = flume::bounded::<Vec<u8>>(OUTBOUND_FRAME_QUEUE);

    for _ in 0..OUTBOUND_FRAME_QUEUE {
      tx.try_send(vec![0u8; 3]).unwrap();
    }
    assert!(matches!(tx.try_send(vec![0u8; 3]), Err(flume::TrySendError::Full(_))));

    rx.recv().unwrap();
    assert!(tx.try_send(vec![0u8; 3]).is_ok());
  }
}
