//! Session coordination for the voice core: joining channels through the
//! parent gateway, fanning one audio stream out to every joined session,
//! and guaranteed teardown on scope exit.

pub mod broadcast;
pub mod gateway;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver as HostReceiver;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use utils::cell::Cell;
use utils::task::TaskGuard;
use voice::codec::{Chunker, FrameEncoder, PcmSource};
use voice::constants::{
  HANDSHAKE_TIMEOUT, INBOUND_EVENT_QUEUE, JOIN_TIMEOUT, OPUS_SILENCE_FRAME, OPUS_SILENCE_FRAMES, OUTBOUND_FRAME_QUEUE
};
use voice::error::VoiceError;
use voice::event::GatewayEvent;
use voice::host::{HostEvent, UpdateVoiceState, VoiceServerUpdate};
use voice::udp::UdpHandle;
use voice::ws::{self, WsHandle, WsLaunchOptions};

pub use crate::broadcast::BroadcastSink;
pub use crate::gateway::GatewayLink;

/// One joined voice channel.
///
/// Exists only after the full handshake (through Session Description) and
/// owns its websocket task: dropping the session aborts the task, which
/// takes the transport and side-tasks with it.
pub struct VoiceSession {
  pub guild_id: u64,
  pub channel_id: u64,
  /// Assigned by the server at Ready; immutable for the session lifetime.
  pub ssrc: u32,
  pub ws: WsHandle,
  pub udp: UdpHandle,
  udp_task: Cell<AbortHandle>,
  _task: TaskGuard<()>
}

/// The coordinator: a set of joined sessions behind one playback mutex.
pub struct Voice {
  link: GatewayLink,
  sessions: Mutex<Vec<VoiceSession>>,
  playback: Mutex<()>,
  bitrate: Option<u32>
}

impl Voice {
  pub fn new(link: GatewayLink) -> Self {
    Self {
      link,
      sessions: Mutex::new(Vec::new()),
      playback: Mutex::new(()),
      bitrate: None
    }
  }

  /// Like [`Voice::new`], with an Opus bitrate override for every play.
  pub fn with_bitrate(link: GatewayLink, bitrate: u32) -> Self {
    Self {
      bitrate: Some(bitrate),
      ..Self::new(link)
    }
  }

  pub fn link(&self) -> &GatewayLink {
    &self.link
  }

  pub async fn session_count(&self) -> usize {
    self.sessions.lock().await.len()
  }

  /// Joins a voice channel and registers the session for broadcasting.
  ///
  /// Returns the server-assigned ssrc once the voice handshake has run all
  /// the way through Session Description.
  pub async fn join(&self, guild_id: u64, channel_id: u64) -> Result<u32, VoiceError> {
    let mut host_events = self.link.subscribe();

    self
      .link
      .update_voice_state(UpdateVoiceState::join(guild_id, channel_id))
      .map_err(|_| VoiceError::NotAvailable)?;

    let (session_id, server) = await_server_grant(&mut host_events, guild_id, self.link.user_id()).await?;
    let endpoint = server.endpoint.ok_or(VoiceError::NoServerAvailable)?;
    debug!("voice server for guild {}: {}", guild_id, endpoint);

    let (events_tx, events_rx) = flume::unbounded();
    let (commands_tx, commands_rx) = flume::unbounded();
    let (udp_events_tx, udp_events_rx) = flume::bounded(INBOUND_EVENT_QUEUE);
    let (frames_tx, frames_rx) = flume::bounded(OUTBOUND_FRAME_QUEUE);
    let ssrc_cell = Cell::new();
    let udp_task = Cell::new();

    let options = WsLaunchOptions {
      user_id: self.link.user_id(),
      guild_id: server.guild_id,
      session_id,
      token: server.token,
      endpoint,
      host_events: self.link.subscribe(),
      events: events_tx,
      commands: commands_rx,
      udp_events_tx,
      udp_events_rx: udp_events_rx.clone(),
      udp_frames: frames_rx,
      udp_task: udp_task.clone(),
      ssrc: ssrc_cell.clone()
    };
    let task = TaskGuard::new(tokio::spawn(ws::run(options)));

    let ssrc = await_session_ready(&ssrc_cell, &events_rx).await?;

    let session = VoiceSession {
      guild_id,
      channel_id,
      ssrc,
      ws: WsHandle {
        events: events_rx,
        commands: commands_tx
      },
      udp: UdpHandle {
        events: udp_events_rx,
        frames: frames_tx
      },
      udp_task,
      _task: task
    };
    info!("joined voice channel {} in guild {} (ssrc {})", channel_id, guild_id, ssrc);
    self.sessions.lock().await.push(session);
    Ok(ssrc)
  }

  /// Drives one PCM source through the codec into every joined session.
  ///
  /// The playback mutex is held for the whole call, so concurrent plays
  /// serialise globally instead of interleaving frames on the wire.
  pub async fn play<S: PcmSource>(&self, source: &mut S) -> Result<()> {
    let sink = BroadcastSink::snapshot(&self.sessions.lock().await);
    if sink.is_empty() {
      debug!("play requested with no joined sessions");
      return Ok(());
    }

    sink.set_speaking(true).await;
    let playback = self.playback.lock().await;

    let result = drive_source(source, &sink, self.bitrate).await;

    // the mutex only guards the encode and fan-out stage; release it
    // before the speaking-false round trip so a queued play can start
    drop(playback);
    sink.set_speaking(false).await;
    result
  }

  /// Leaves every joined channel: one disconnecting voice-state update per
  /// guild, then the session tasks are torn down.
  pub async fn leave_all(&self) {
    let mut sessions = self.sessions.lock().await;
    for session in sessions.drain(..) {
      // best effort: on shutdown the parent's sender may already be gone
      if let Err(error) = self.link.update_voice_state(UpdateVoiceState::leave(session.guild_id)) {
        warn!("could not send voice disconnect for guild {}: {:#}", session.guild_id, error);
      }
      if let Some(udp_task) = session.udp_task.get() {
        udp_task.abort();
      }
      debug!("voice session for guild {} torn down", session.guild_id);
      // dropping the session aborts its websocket task
    }
  }
}

/// Runs `scope` with a fresh coordinator and always cleans up afterwards,
/// whether the body succeeded or not.
pub async fn voice_scope<F, Fut, T>(link: GatewayLink, scope: F) -> Result<T>
where
  F: FnOnce(Arc<Voice>) -> Fut,
  Fut: Future<Output = Result<T>>
{
  let voice = Arc::new(Voice::new(link));
  let result = scope(voice.clone()).await;
  voice.leave_all().await;
  result
}

async fn drive_source<S: PcmSource>(source: &mut S, sink: &BroadcastSink, bitrate: Option<u32>) -> Result<()> {
  let mut encoder = FrameEncoder::new(bitrate)?;
  let mut chunker = Chunker::new();

  while let Some(chunk) = source.read_chunk().await? {
    chunker.push(&chunk);
    while let Some(samples) = chunker.next_frame() {
      let frame = encoder.encode(&samples)?;
      sink.send_frame(&frame).await;
    }
  }

  if chunker.remainder() > 0 {
    debug!("discarding {} trailing pcm bytes", chunker.remainder());
  }

  // flush the remote jitter buffers
  for _ in 0..OPUS_SILENCE_FRAMES {
    sink.send_frame(OPUS_SILENCE_FRAME).await;
  }
  Ok(())
}

/// The gateway answers a join with both a voice state update (session id)
/// and a voice server update (token + endpoint), in no particular order.
async fn await_server_grant(
  host_events: &mut HostReceiver<HostEvent>,
  guild_id: u64,
  user_id: u64
) -> Result<(String, VoiceServerUpdate), VoiceError> {
  let wait = async {
    let mut session_id = None;
    let mut server = None;
    loop {
      let event = match host_events.recv().await {
        Ok(event) => event,
        Err(RecvError::Lagged(_)) => continue,
        Err(RecvError::Closed) => return Err(VoiceError::NotAvailable)
      };

      match event {
        HostEvent::VoiceStateUpdate(update) => {
          let ours = update.guild_id.map_or(true, |id| id == guild_id)
            && update.user_id.map_or(true, |id| id == user_id);
          if ours {
            session_id = Some(update.session_id);
            if server.is_some() {
              break;
            }
          }
        }
        HostEvent::VoiceServerUpdate(update) if update.guild_id == guild_id => {
          server = Some(update);
          if session_id.is_some() {
            break;
          }
        }
        _ => {}
      }
    }
    Ok((session_id.unwrap(), server.unwrap()))
  };

  match timeout(JOIN_TIMEOUT, wait).await {
    Ok(result) => result,
    Err(_) => Err(VoiceError::NotAvailable)
  }
}

/// Blocks until the websocket task reports the ssrc, escaping early if the
/// task dies or surfaces a typed error instead.
async fn await_session_ready(
  ssrc: &Cell<u32>,
  events: &flume::Receiver<Result<GatewayEvent, VoiceError>>
) -> Result<u32, VoiceError> {
  let wait = async {
    loop {
      select! {
        ssrc = ssrc.wait() => return Ok(ssrc),
        event = events.recv_async() => match event {
          Ok(Err(error)) => return Err(error),
          // frames arriving before the ssrc report are not for the caller
          Ok(Ok(_)) => continue,
          Err(_) => return Err(VoiceError::InvalidPayloadOrder)
        }
      }
    }
  };

  match timeout(HANDSHAKE_TIMEOUT, wait).await {
    Ok(result) => result,
    Err(_) => Err(VoiceError::NotAvailable)
  }
}
