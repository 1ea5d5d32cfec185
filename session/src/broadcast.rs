//! Fan-out of one encoded audio stream to every active session.

use flume::Sender;
use futures_util::future::join_all;
use tracing::warn;
use voice::event::{GatewayEvent, Speaking};

use crate::VoiceSession;

/// A point-in-time snapshot of the session set. Sessions joined after the
/// snapshot receive audio from the next play call, not this one.
pub struct BroadcastSink {
  targets: Vec<Target>
}

struct Target {
  guild_id: u64,
  ssrc: u32,
  frames: Sender<Vec<u8>>,
  commands: Sender<GatewayEvent>
}

impl BroadcastSink {
  pub fn snapshot(sessions: &[VoiceSession]) -> Self {
    Self {
      targets: sessions
        .iter()
        .map(|session| Target {
          guild_id: session.guild_id,
          ssrc: session.ssrc,
          frames: session.udp.frames.clone(),
          commands: session.ws.commands.clone()
        })
        .collect()
    }
  }

  pub fn is_empty(&self) -> bool {
    self.targets.is_empty()
  }

  /// Enqueues one frame into every session's outbound queue, joining all
  /// writes before returning. One full queue stalls the whole fan-out;
  /// that backpressure is the design, so no session falls more than a
  /// frame behind its peers.
  pub async fn send_frame(&self, frame: &[u8]) {
    let writes = self.targets.iter().map(|target| async move {
      if target.frames.send_async(frame.to_vec()).await.is_err() {
        warn!("voice transport for guild {} is gone, dropping its frame", target.guild_id);
      }
    });
    join_all(writes).await;
  }

  pub async fn set_speaking(&self, speaking: bool) {
    for target in &self.targets {
      let event = GatewayEvent::Speaking(Speaking {
        speaking: speaking.into(),
        delay: 0,
        ssrc: target.ssrc
      });
      if target.commands.send_async(event).await.is_err() {
        warn!("voice session for guild {} is gone, dropping speaking update", target.guild_id);
      }
    }
  }

  #[cfg(test)]
  fn from_parts(parts: Vec<(u64, u32, Sender<Vec<u8>>, Sender<GatewayEvent>)>) -> Self {
    Self {
      targets: parts
        .into_iter()
        .map(|(guild_id, ssrc, frames, commands)| Target {
          guild_id,
          ssrc,
          frames,
          commands
        })
        .collect()
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::time::timeout;

  use super::*;

  fn two_session_sink(
    capacity: usize
  ) -> (BroadcastSink, flume::Receiver<Vec<u8>>, flume::Receiver<Vec<u8>>, flume::Receiver<GatewayEvent>) {
    let (frames_a, frames_a_rx) = flume::bounded(capacity);
    let (frames_b, frames_b_rx) = flume::bounded(capacity);
    let (commands_a, commands_a_rx) = flume::unbounded();
    let (commands_b, _commands_b_rx) = flume::unbounded();

    let sink = BroadcastSink::from_parts(vec![(1, 10, frames_a, commands_a), (2, 20, frames_b, commands_b)]);
    (sink, frames_a_rx, frames_b_rx, commands_a_rx)
  }

  #[tokio::test]
  async fn every_target_gets_a_copy_of_each_frame() {
    let (sink, frames_a, frames_b, _commands) = two_session_sink(4);

    sink.send_frame(&[1, 2, 3]).await;
    sink.send_frame(&[4, 5]).await;

    assert_eq!(frames_a.recv_async().await.unwrap(), vec![1, 2, 3]);
    assert_eq!(frames_a.recv_async().await.unwrap(), vec![4, 5]);
    assert_eq!(frames_b.recv_async().await.unwrap(), vec![1, 2, 3]);
    assert_eq!(frames_b.recv_async().await.unwrap(), vec![4, 5]);
  }

  #[tokio::test]
  async fn one_full_queue_stalls_the_fan_out() {
    let (frames_a, frames_a_rx) = flume::bounded(8);
    let (frames_b, frames_b_rx) = flume::bounded(1);
    let (commands, _commands_rx) = flume::unbounded();
    let sink = BroadcastSink::from_parts(vec![(1, 10, frames_a, commands.clone()), (2, 20, frames_b, commands)]);

    sink.send_frame(&[1]).await;

    // session b's queue is full and never drained, so the fan-out of the
    // second frame cannot complete even though session a has room
    let stalled = timeout(Duration::from_millis(50), sink.send_frame(&[2])).await;
    assert!(stalled.is_err());

    // draining the slow queue lets the next frame through
    assert_eq!(frames_b_rx.recv_async().await.unwrap(), vec![1]);
    sink.send_frame(&[3]).await;
    assert_eq!(frames_a_rx.recv_async().await.unwrap(), vec![1]);
  }

  #[tokio::test]
  async fn speaking_updates_carry_each_sessions_ssrc() {
    let (sink, _frames_a, _frames_b, commands) = two_session_sink(4);

    sink.set_speaking(true).await;
    sink.set_speaking(false).await;

    match commands.recv_async().await.unwrap() {
      GatewayEvent::Speaking(speaking) => {
        assert_eq!(speaking.speaking, 1);
        assert_eq!(speaking.ssrc, 10);
      }
      other => panic!("expected a speaking frame, got {:?}", other)
    }
    match commands.recv_async().await.unwrap() {
      GatewayEvent::Speaking(speaking) => assert_eq!(speaking.speaking, 0),
      other => panic!("expected a speaking frame, got {:?}", other)
    }
  }

  #[tokio::test]
  async fn dead_sessions_do_not_fail_the_broadcast() {
    let (frames, frames_rx) = flume::bounded(4);
    let (commands, commands_rx) = flume::unbounded();
    drop(frames_rx);
    drop(commands_rx);

    let sink = BroadcastSink::from_parts(vec![(1, 10, frames, commands)]);
    sink.send_frame(&[1]).await;
    sink.set_speaking(true).await;
  }
}
