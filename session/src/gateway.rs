//! The liaison to the parent Discord gateway.
//!
//! The parent connection lives outside this workspace. The embedder feeds
//! its dispatches in through [`GatewayLink::publish_dispatch`] and forwards
//! every command popping out of the queue returned by [`GatewayLink::new`]
//! to its shard. Everything else is pass-through; the link carries no state
//! beyond the cached bot user id.

use anyhow::{Context, Result};
use flume::{Receiver, Sender};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use voice::host::{HostEvent, UpdateVoiceState};

const EVENT_STREAM_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct GatewayLink {
  user_id: u64,
  events: broadcast::Sender<HostEvent>,
  commands: Sender<UpdateVoiceState>
}

impl GatewayLink {
  /// `user_id` is the bot's own id, read from the parent's cache.
  pub fn new(user_id: u64) -> (Self, Receiver<UpdateVoiceState>) {
    let (events, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
    let (commands, commands_rx) = flume::unbounded();
    (
      Self {
        user_id,
        events,
        commands
      },
      commands_rx
    )
  }

  pub fn user_id(&self) -> u64 {
    self.user_id
  }

  /// An independent view of the gateway event stream.
  pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
    self.events.subscribe()
  }

  pub fn publish(&self, event: HostEvent) {
    // an error only means nobody is subscribed right now
    let _ = self.events.send(event);
  }

  /// Feed one raw dispatch in; unrecognised names are preserved as
  /// [`HostEvent::Unknown`], not dropped.
  pub fn publish_dispatch(&self, name: &str, data: Value) {
    self.publish(HostEvent::from_dispatch(name, data));
  }

  pub fn update_voice_state(&self, update: UpdateVoiceState) -> Result<()> {
    debug!("> {}", update.to_command());
    self.commands.send(update).context("parent gateway command queue is closed")?;
    Ok(())
  }
}
