//! Voice gateway websocket client.
//!
//! One task per session runs the Start / Resume / Closed state machine,
//! owning the UDP transport and the heartbeat and sender side-tasks for as
//! long as the session lives.

use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Result};
use flume::{Receiver, Sender};
use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use utils::cell::Cell;
use utils::task::TaskGuard;

use crate::close_code::{GatewayCloseCode, ReconnectPolicy};
use crate::constants::{ENCRYPTION_MODE, HANDSHAKE_TIMEOUT, HEARTBEAT_WARMUP, RESUME_BACKOFF, SEND_PACE};
use crate::error::VoiceError;
use crate::event::{
  GatewayEvent, GatewayPacket, Hello, Identify, Ready, Resume, SelectProtocol, SelectProtocolData, SessionDescription
};
use crate::host::HostEvent;
use crate::udp::{self, UdpEvent, UdpLaunchOptions};

type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What a session owner holds: parsed frames (or a terminal typed error)
/// in, user-originated frames out.
pub struct WsHandle {
  pub events: Receiver<Result<GatewayEvent, VoiceError>>,
  pub commands: Sender<GatewayEvent>
}

pub struct WsLaunchOptions {
  pub user_id: u64,
  pub guild_id: u64,
  pub session_id: String,
  pub token: String,
  /// `host:port`, or a full `ws(s)://` URL which is used verbatim.
  pub endpoint: String,
  /// Duplicated parent gateway stream, watched for reconnects.
  pub host_events: broadcast::Receiver<HostEvent>,
  pub events: Sender<Result<GatewayEvent, VoiceError>>,
  pub commands: Receiver<GatewayEvent>,
  pub udp_events_tx: Sender<UdpEvent>,
  pub udp_events_rx: Receiver<UdpEvent>,
  pub udp_frames: Receiver<Vec<u8>>,
  /// Reports the transport task so the session owner can abort it directly.
  pub udp_task: Cell<tokio::task::AbortHandle>,
  /// Filled when the Start handshake completes through Session Description.
  pub ssrc: Cell<u32>
}

/// Entry point for the per-session websocket task.
pub async fn run(options: WsLaunchOptions) {
  if let Err(error) = drive(options).await {
    warn!("voice websocket task failed: {:#}", error);
  }
}

enum Stage {
  Start,
  Resume
}

struct Connection {
  socket: WsSocket,
  hello: Hello
}

enum Transition {
  Resume,
  Restart,
  Terminate(Option<VoiceError>)
}

#[derive(Debug)]
enum HandshakeError {
  Timeout,
  Close(Option<u16>),
  Fatal(VoiceError),
  Io(anyhow::Error)
}

async fn drive(mut options: WsLaunchOptions) -> Result<()> {
  let mut stage = Stage::Start;
  let mut udp_task: Option<TaskGuard<()>> = None;
  let mut established = false;

  loop {
    let connection = match stage {
      Stage::Start => {
        // a full restart gets a fresh transport; the old one dies first
        drop(udp_task.take());

        match start(&options).await {
          Ok((connection, guard)) => {
            udp_task = Some(guard);
            established = true;
            connection
          }
          Err(HandshakeError::Timeout) => {
            warn!("voice handshake timed out, attempting resume");
            stage = Stage::Resume;
            continue;
          }
          Err(HandshakeError::Io(error)) => {
            warn!("voice gateway connect failed: {:#}", error);
            sleep(RESUME_BACKOFF).await;
            stage = Stage::Resume;
            continue;
          }
          Err(HandshakeError::Close(code)) => match close_transition(code) {
            Transition::Resume => {
              stage = Stage::Resume;
              continue;
            }
            Transition::Restart => {
              stage = Stage::Start;
              continue;
            }
            Transition::Terminate(error) => {
              report(&options.events, error).await;
              break;
            }
          },
          Err(HandshakeError::Fatal(error)) => {
            report(&options.events, Some(error)).await;
            break;
          }
        }
      }

      Stage::Resume => {
        if !established {
          stage = Stage::Start;
          continue;
        }

        match resume(&options).await {
          Ok(connection) => connection,
          Err(HandshakeError::Timeout) | Err(HandshakeError::Io(_)) => {
            debug!("voice resume attempt failed, retrying in {:?}", RESUME_BACKOFF);
            sleep(RESUME_BACKOFF).await;
            continue;
          }
          Err(HandshakeError::Close(code)) => match close_transition(code) {
            Transition::Resume => {
              sleep(RESUME_BACKOFF).await;
              continue;
            }
            Transition::Restart => {
              stage = Stage::Start;
              continue;
            }
            Transition::Terminate(error) => {
              report(&options.events, error).await;
              break;
            }
          },
          Err(HandshakeError::Fatal(error)) => {
            report(&options.events, Some(error)).await;
            break;
          }
        }
      }
    };

    match event_loop(
      connection,
      &options.events,
      &options.commands,
      &mut options.host_events
    )
    .await
    {
      Transition::Resume => stage = Stage::Resume,
      Transition::Restart => stage = Stage::Start,
      Transition::Terminate(error) => {
        report(&options.events, error).await;
        break;
      }
    }
  }

  debug!("voice websocket task for guild {} exiting", options.guild_id);
  // the transport dies with its guard
  drop(udp_task);
  Ok(())
}

async fn report(events: &Sender<Result<GatewayEvent, VoiceError>>, error: Option<VoiceError>) {
  if let Some(error) = error {
    let _ = events.send_async(Err(error)).await;
  }
}

async fn start(options: &WsLaunchOptions) -> Result<(Connection, TaskGuard<()>), HandshakeError> {
  let mut socket = connect(&options.endpoint).await?;

  send(&mut socket, GatewayEvent::Identify(Identify {
    server_id: options.guild_id,
    user_id: options.user_id,
    session_id: options.session_id.clone(),
    token: options.token.clone()
  }))
  .await
  .map_err(HandshakeError::Io)?;

  let (hello, ready) = await_hello_ready(&mut socket).await?;
  debug!("voice gateway ready: ssrc {}, udp {}:{}", ready.ssrc, ready.ip, ready.port);

  if !ready.modes.iter().any(|mode| mode == ENCRYPTION_MODE) {
    return Err(HandshakeError::Fatal(VoiceError::ModeUnavailable(ENCRYPTION_MODE.to_owned())));
  }

  // a fresh key cell per handshake: a restarted transport must never start
  // sending under the previous session's key
  let secret_key = Cell::new();
  let udp_options = UdpLaunchOptions {
    ssrc: ready.ssrc,
    ip: ready.ip.clone(),
    port: ready.port,
    mode: ENCRYPTION_MODE.to_owned(),
    events: options.udp_events_tx.clone(),
    frames: options.udp_frames.clone(),
    secret_key: secret_key.clone()
  };
  let udp_guard = TaskGuard::new(tokio::spawn(async move {
    if let Err(error) = udp::run(udp_options).await {
      warn!("voice udp transport failed: {:#}", error);
    }
  }));
  options.udp_task.fill(udp_guard.abort_handle());

  let discovery = await_discovery(&options.udp_events_rx).await?;
  send(&mut socket, GatewayEvent::SelectProtocol(SelectProtocol {
    protocol: "udp".to_owned(),
    data: SelectProtocolData {
      address: discovery.address,
      port: discovery.port,
      mode: ENCRYPTION_MODE.to_owned()
    }
  }))
  .await
  .map_err(HandshakeError::Io)?;

  let description = await_session_description(&mut socket, &options.events).await?;
  if description.mode != ENCRYPTION_MODE {
    return Err(HandshakeError::Fatal(VoiceError::ModeUnavailable(description.mode)));
  }
  let key: [u8; 32] = description
    .secret_key
    .as_slice()
    .try_into()
    .map_err(|_| HandshakeError::Fatal(VoiceError::InvalidPayloadOrder))?;
  secret_key.fill(key);
  options.ssrc.fill(ready.ssrc);
  info!("voice session established (ssrc {})", ready.ssrc);

  Ok((Connection { socket, hello }, udp_guard))
}

async fn resume(options: &WsLaunchOptions) -> Result<Connection, HandshakeError> {
  let mut socket = connect(&options.endpoint).await?;

  send(&mut socket, GatewayEvent::Resume(Resume {
    server_id: options.guild_id,
    session_id: options.session_id.clone(),
    token: options.token.clone()
  }))
  .await
  .map_err(HandshakeError::Io)?;

  let hello = await_hello_resumed(&mut socket).await?;
  info!("voice session resumed");

  Ok(Connection { socket, hello })
}

async fn event_loop(
  connection: Connection,
  events: &Sender<Result<GatewayEvent, VoiceError>>,
  commands: &Receiver<GatewayEvent>,
  host_events: &mut broadcast::Receiver<HostEvent>
) -> Transition {
  let Connection { socket, hello } = connection;
  let heartbeat_interval = Duration::from_millis(hello.heartbeat_interval.round() as u64);
  let receive_timeout = heartbeat_interval * 2;

  let (sink, mut stream) = socket.split();
  let (library_tx, library_rx) = flume::unbounded::<GatewayPacket>();
  let (close_tx, close_rx) = flume::bounded::<CloseFrame<'static>>(1);

  let _heartbeat = TaskGuard::new(tokio::spawn(heartbeat_loop(library_tx.clone(), heartbeat_interval)));
  let _sender = TaskGuard::new(tokio::spawn(sender_loop(sink, library_rx, commands.clone(), close_rx)));

  let mut watchdog_open = true;
  loop {
    select! {
      result = timeout(receive_timeout, next_frame(&mut stream)) => {
        match result {
          Err(_) => {
            warn!("voice gateway went silent for {:?}", receive_timeout);
            return Transition::Resume;
          }
          Ok(Err(error)) => {
            warn!("voice gateway read failed: {:#}", error);
            return Transition::Resume;
          }
          Ok(Ok(Frame::Event(GatewayEvent::HeartbeatAck(_)))) => {}
          Ok(Ok(Frame::Event(GatewayEvent::Heartbeat(nonce)))) => {
            // Discord answers client heartbeats with a Heartbeat of its
            // own rather than the documented ack; echo the nonce back
            if let Ok(packet) = GatewayEvent::HeartbeatAck(nonce).try_into() {
              let _ = library_tx.send(packet);
            }
          }
          Ok(Ok(Frame::Event(event))) => {
            let _ = events.send_async(Ok(event)).await;
          }
          Ok(Ok(Frame::Skip)) => {}
          Ok(Ok(Frame::Closed(code))) => return close_transition(code)
        }
      }

      host = host_events.recv(), if watchdog_open => {
        match host {
          Ok(HostEvent::Ready) => {
            info!("parent gateway reconnected, resuming the voice session");
            let _ = close_tx
              .send_async(CloseFrame {
                code: CloseCode::Away,
                reason: "".into()
              })
              .await;
            let _ = timeout(Duration::from_secs(1), drain_until_closed(&mut stream)).await;
            return Transition::Resume;
          }
          Ok(_) => {}
          Err(broadcast::error::RecvError::Lagged(skipped)) => {
            debug!("host event stream lagged by {} events", skipped);
          }
          Err(broadcast::error::RecvError::Closed) => watchdog_open = false
        }
      }
    }
  }
}

/// Injects a Heartbeat into the library send queue every interval, after a
/// short warmup. The nonce is the current epoch in seconds.
async fn heartbeat_loop(library: Sender<GatewayPacket>, heartbeat_interval: Duration) {
  sleep(HEARTBEAT_WARMUP).await;

  let mut ticker = interval(heartbeat_interval);
  // a stalled scheduler must not make up for lost ticks with a burst
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  loop {
    ticker.tick().await;
    let packet = match GatewayEvent::Heartbeat(epoch_seconds()).try_into() {
      Ok(packet) => packet,
      Err(_) => continue
    };
    if library.send_async(packet).await.is_err() {
      break;
    }
  }
}

/// The single writer for one connection: drains the library queue and the
/// user queue, whichever is ready, keeping frames at least [`SEND_PACE`]
/// apart.
async fn sender_loop(
  mut sink: SplitSink<WsSocket, Message>,
  library: Receiver<GatewayPacket>,
  user: Receiver<GatewayEvent>,
  close: Receiver<CloseFrame<'static>>
) {
  loop {
    let packet = select! {
      biased;

      frame = close.recv_async() => {
        if let Ok(frame) = frame {
          let _ = sink.send(Message::Close(Some(frame))).await;
        }
        break;
      }

      packet = library.recv_async() => match packet {
        Ok(packet) => packet,
        Err(_) => break
      },

      event = user.recv_async() => match event {
        Ok(event) => {
          let packet: GatewayPacket = match event.try_into() {
            Ok(packet) => packet,
            Err(error) => {
              warn!("dropping unencodable user frame: {:#}", error);
              continue;
            }
          };
          if !packet.opcode.client_sendable() {
            warn!("dropping user frame with server-only opcode {}", packet.opcode);
            continue;
          }
          packet
        }
        Err(_) => break
      }
    };

    let json = match serde_json::to_string(&packet) {
      Ok(json) => json,
      Err(error) => {
        warn!("dropping unserialisable frame: {}", error);
        continue;
      }
    };
    debug!("> {}", json);
    if sink.send(Message::Text(json)).await.is_err() {
      break;
    }

    sleep(SEND_PACE).await;
  }
}

enum Frame {
  Event(GatewayEvent),
  /// A payload this client does not decode; logged and ignored.
  Skip,
  Closed(Option<u16>)
}

async fn next_frame<S>(stream: &mut S) -> Result<Frame>
where
  S: Stream<Item = std::result::Result<Message, WsError>> + Unpin
{
  loop {
    let message = match stream.next().await {
      Some(message) => message?,
      None => return Ok(Frame::Closed(None))
    };

    match message {
      Message::Text(json) => {
        debug!("< {}", json);
        let packet: GatewayPacket = match serde_json::from_str(&json) {
          Ok(packet) => packet,
          Err(error) => {
            warn!("undecodable voice gateway payload: {}", error);
            return Ok(Frame::Skip);
          }
        };
        match GatewayEvent::try_from(packet) {
          Ok(event) => return Ok(Frame::Event(event)),
          Err(error) => {
            debug!("ignoring voice gateway frame: {:#}", error);
            return Ok(Frame::Skip);
          }
        }
      }
      Message::Close(frame) => return Ok(Frame::Closed(frame.map(|frame| frame.code.into()))),
      Message::Ping(_) | Message::Pong(_) => continue,
      other => {
        warn!("unexpected voice gateway message: {:?}", other);
        continue;
      }
    }
  }
}

async fn drain_until_closed<S>(stream: &mut S)
where
  S: Stream<Item = std::result::Result<Message, WsError>> + Unpin
{
  loop {
    match stream.next().await {
      Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
      Some(Ok(_)) => continue
    }
  }
}

async fn connect(endpoint: &str) -> Result<WsSocket, HandshakeError> {
  let url = gateway_url(endpoint);
  debug!("connecting to voice gateway {}", url);
  let (socket, _) = connect_async(url)
    .await
    .map_err(|error| HandshakeError::Io(error.into()))?;
  Ok(socket)
}

fn gateway_url(endpoint: &str) -> String {
  if endpoint.contains("://") {
    format!("{}/?v=4", endpoint)
  } else {
    format!("wss://{}/?v=4", endpoint)
  }
}

async fn send<S>(sink: &mut S, event: GatewayEvent) -> Result<()>
where
  S: Sink<Message, Error = WsError> + Unpin
{
  let packet: GatewayPacket = event.try_into()?;
  let json = serde_json::to_string(&packet)?;
  debug!("> {}", json);
  sink.send(Message::Text(json)).await?;
  Ok(())
}

/// Hello and Ready arrive in either order; collect both or give up.
async fn await_hello_ready<S>(stream: &mut S) -> Result<(Hello, Ready), HandshakeError>
where
  S: Stream<Item = std::result::Result<Message, WsError>> + Unpin
{
  let wait = async {
    let mut hello = None;
    let mut ready = None;
    loop {
      match next_frame(stream).await.map_err(HandshakeError::Io)? {
        Frame::Event(GatewayEvent::Hello(it)) => {
          hello = Some(it);
          if ready.is_some() {
            break;
          }
        }
        Frame::Event(GatewayEvent::Ready(it)) => {
          ready = Some(it);
          if hello.is_some() {
            break;
          }
        }
        Frame::Skip => {}
        Frame::Closed(code) => return Err(HandshakeError::Close(code)),
        Frame::Event(other) => {
          warn!("expected hello or ready, got: {:?}", other);
          return Err(HandshakeError::Fatal(VoiceError::InvalidPayloadOrder));
        }
      }
    }
    Ok((hello.unwrap(), ready.unwrap()))
  };

  match timeout(HANDSHAKE_TIMEOUT, wait).await {
    Ok(result) => result,
    Err(_) => Err(HandshakeError::Timeout)
  }
}

async fn await_hello_resumed<S>(stream: &mut S) -> Result<Hello, HandshakeError>
where
  S: Stream<Item = std::result::Result<Message, WsError>> + Unpin
{
  let wait = async {
    let mut hello = None;
    let mut resumed = false;
    loop {
      match next_frame(stream).await.map_err(HandshakeError::Io)? {
        Frame::Event(GatewayEvent::Hello(it)) => {
          hello = Some(it);
          if resumed {
            break;
          }
        }
        Frame::Event(GatewayEvent::Resumed) => {
          resumed = true;
          if hello.is_some() {
            break;
          }
        }
        Frame::Skip => {}
        Frame::Closed(code) => return Err(HandshakeError::Close(code)),
        Frame::Event(other) => {
          warn!("expected hello or resumed, got: {:?}", other);
          return Err(HandshakeError::Fatal(VoiceError::InvalidPayloadOrder));
        }
      }
    }
    Ok(hello.unwrap())
  };

  match timeout(HANDSHAKE_TIMEOUT, wait).await {
    Ok(result) => result,
    Err(_) => Err(HandshakeError::Timeout)
  }
}

/// Waits for the transport to report its discovered address.
async fn await_discovery(udp_events: &Receiver<UdpEvent>) -> Result<udp::IpDiscoveryResult, HandshakeError> {
  let wait = async {
    loop {
      match udp_events.recv_async().await {
        Ok(UdpEvent::IpDiscovered(result)) => break Ok(result),
        Ok(UdpEvent::Packet(_)) => continue,
        Err(_) => break Err(HandshakeError::Io(anyhow!("udp transport died during ip discovery")))
      }
    }
  };

  match timeout(HANDSHAKE_TIMEOUT, wait).await {
    Ok(result) => result,
    Err(_) => Err(HandshakeError::Timeout)
  }
}

/// Session Description may arrive after unrelated frames; those are
/// forwarded to the session rather than treated as protocol errors.
async fn await_session_description<S>(
  stream: &mut S,
  events: &Sender<Result<GatewayEvent, VoiceError>>
) -> Result<SessionDescription, HandshakeError>
where
  S: Stream<Item = std::result::Result<Message, WsError>> + Unpin
{
  let wait = async {
    loop {
      match next_frame(stream).await.map_err(HandshakeError::Io)? {
        Frame::Event(GatewayEvent::SessionDescription(description)) => break Ok(description),
        Frame::Event(event) => {
          let _ = events.send_async(Ok(event)).await;
        }
        Frame::Skip => {}
        Frame::Closed(code) => break Err(HandshakeError::Close(code))
      }
    }
  };

  match timeout(HANDSHAKE_TIMEOUT, wait).await {
    Ok(result) => result,
    Err(_) => Err(HandshakeError::Timeout)
  }
}

fn close_transition(code: Option<u16>) -> Transition {
  match code {
    None => {
      warn!("voice gateway connection dropped without a close frame");
      Transition::Resume
    }
    Some(code) => match GatewayCloseCode::from(code).reconnect_policy() {
      ReconnectPolicy::Resume => {
        info!("voice gateway closed with {}, resuming", code);
        Transition::Resume
      }
      ReconnectPolicy::Restart => {
        info!("voice gateway closed with {}, restarting", code);
        Transition::Restart
      }
      ReconnectPolicy::Terminate => {
        warn!("voice gateway closed with {}, terminating", code);
        Transition::Terminate(Some(VoiceError::Closed(code)))
      }
    }
  }
}

fn epoch_seconds() -> u64 {
  SystemTime::now()
    .duration_since(SystemTime::UNIX_EPOCH)
    .map(|duration| duration.as_secs())
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use futures_util::stream;

  use crate::opcode::GatewayOpcode;

  use super::*;

  fn text(json: &str) -> std::result::Result<Message, WsError> {
    Ok(Message::Text(json.to_owned()))
  }

  #[test]
  fn gateway_urls_default_to_tls() {
    assert_eq!(gateway_url("example.discord.gg:443"), "wss://example.discord.gg:443/?v=4");
    assert_eq!(gateway_url("ws://127.0.0.1:9000"), "ws://127.0.0.1:9000/?v=4");
  }

  #[tokio::test]
  async fn hello_and_ready_arrive_in_either_order() {
    let mut frames = stream::iter(vec![
      text(r#"{"op":2,"d":{"ssrc":12345,"ip":"127.0.0.1","port":4000,"modes":["xsalsa20_poly1305"]}}"#),
      text(r#"{"op":8,"d":{"heartbeat_interval":45000.0}}"#)
    ]);

    let (hello, ready) = await_hello_ready(&mut frames).await.ok().unwrap();
    assert_eq!(hello.heartbeat_interval, 45000.0);
    assert_eq!(ready.ssrc, 12345);
  }

  #[tokio::test]
  async fn unexpected_handshake_frames_are_a_payload_order_error() {
    let mut frames = stream::iter(vec![
      text(r#"{"op":8,"d":{"heartbeat_interval":45000.0}}"#),
      text(r#"{"op":5,"d":{"speaking":1,"delay":0,"ssrc":1}}"#)
    ]);

    match await_hello_ready(&mut frames).await {
      Err(HandshakeError::Fatal(VoiceError::InvalidPayloadOrder)) => {}
      _ => panic!("expected an invalid payload order error")
    }
  }

  #[tokio::test]
  async fn undecodable_handshake_frames_are_skipped() {
    let mut frames = stream::iter(vec![
      text(r#"{"op":18,"d":{}}"#),
      text(r#"{"op":8,"d":{"heartbeat_interval":45000.0}}"#),
      text(r#"{"op":2,"d":{"ssrc":1,"ip":"127.0.0.1","port":4000,"modes":["xsalsa20_poly1305"]}}"#)
    ]);

    assert!(await_hello_ready(&mut frames).await.is_ok());
  }

  #[tokio::test]
  async fn close_during_handshake_carries_its_code() {
    let mut frames = stream::iter(vec![Ok(Message::Close(Some(CloseFrame {
      code: CloseCode::from(4006),
      reason: "".into()
    })))]);

    match await_hello_ready(&mut frames).await {
      Err(HandshakeError::Close(Some(4006))) => {}
      _ => panic!("expected the close code to surface")
    }
  }

  #[tokio::test]
  async fn session_description_tolerates_interleaved_frames() {
    let (events_tx, events_rx) = flume::unbounded();
    let mut frames = stream::iter(vec![
      text(r#"{"op":5,"d":{"speaking":1,"delay":0,"ssrc":7}}"#),
      text(r#"{"op":4,"d":{"mode":"xsalsa20_poly1305","secret_key":[0,0,0,0]}}"#)
    ]);

    let description = await_session_description(&mut frames, &events_tx).await.ok().unwrap();
    assert_eq!(description.mode, "xsalsa20_poly1305");

    // the stray frame went to the session instead of killing the handshake
    match events_rx.try_recv().unwrap() {
      Ok(GatewayEvent::Speaking(speaking)) => assert_eq!(speaking.ssrc, 7),
      other => panic!("expected the speaking frame, got {:?}", other)
    }
  }

  #[tokio::test(start_paused = true)]
  async fn heartbeats_tick_after_the_warmup() {
    let (library_tx, library_rx) = flume::unbounded();
    let _task = TaskGuard::new(tokio::spawn(heartbeat_loop(library_tx, Duration::from_millis(100))));

    for _ in 0..3 {
      let packet = library_rx.recv_async().await.unwrap();
      assert_eq!(packet.opcode, GatewayOpcode::Heartbeat);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn missed_heartbeat_ticks_do_not_burst() {
    let (library_tx, library_rx) = flume::unbounded();
    let _task = TaskGuard::new(tokio::spawn(heartbeat_loop(library_tx, Duration::from_millis(100))));

    library_rx.recv_async().await.unwrap();

    // stall the generator for several intervals; the backlog must not be
    // replayed back-to-back
    tokio::time::advance(Duration::from_millis(350)).await;

    let first = tokio::time::Instant::now();
    library_rx.recv_async().await.unwrap();
    library_rx.recv_async().await.unwrap();
    let second = tokio::time::Instant::now();

    assert!(second - first >= Duration::from_millis(100));
  }

  #[test]
  fn close_codes_drive_the_state_machine() {
    assert!(matches!(close_transition(Some(4015)), Transition::Resume));
    assert!(matches!(close_transition(Some(4014)), Transition::Restart));
    assert!(matches!(
      close_transition(Some(1000)),
      Transition::Terminate(Some(VoiceError::Closed(1000)))
    ));
    assert!(matches!(
      close_transition(Some(4001)),
      Transition::Terminate(Some(VoiceError::Closed(4001)))
    ));
    assert!(matches!(close_transition(None), Transition::Resume));
  }
}
