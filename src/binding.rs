//! Boundary between the tree and an external UI.
//!
//! Outbound, [`bind`] attaches an observer ("widget") to a channel so every
//! value change reaches it. [`UiBridge`] is a ready-made widget that forwards
//! changes over a bounded crossbeam channel to a UI thread.
//!
//! Inbound, user events arrive as named callback invocations through a
//! [`CallbackRegistry`], e.g. a start toggle calling `startPressed(true)`,
//! whose handler arms a loop.

use crate::channel::{Channel, ChannelObserver, ObserverId, Sample};
use crate::config::ConfigValue;
use crate::error::{QDaqError, Result};
use crate::scheduler::Loop;
use crate::sync;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Default capacity of the [`UiBridge`] message queue.
pub const UI_CHANNEL_CAPACITY: usize = 1024;

/// A live link between a channel and an external consumer.
pub struct Binding {
    channel: Arc<Channel>,
    id: ObserverId,
}

impl Binding {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Write a user-entered value into the bound channel.
    pub fn write(&self, value: f64) {
        self.channel.push(value);
    }

    /// Stop delivering changes to the widget.
    pub fn unbind(self) -> bool {
        self.channel.unsubscribe(self.id)
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("channel", &self.channel.full_path())
            .field("id", &self.id)
            .finish()
    }
}

/// Register `widget` for every value change of `channel`.
pub fn bind(channel: &Arc<Channel>, widget: Arc<dyn ChannelObserver>) -> Binding {
    let id = channel.subscribe(widget);
    tracing::debug!("Bound {} (observer {:?})", channel.full_path(), id);
    Binding {
        channel: channel.clone(),
        id,
    }
}

/// Messages forwarded to the UI thread.
#[derive(Debug, Clone, PartialEq)]
pub enum UiMessage {
    /// A bound channel changed.
    ValueChanged { path: String, sample: Sample },
}

/// Observer that forwards changes into a bounded queue.
///
/// Never blocks the engine thread: when the queue is full the update is
/// dropped and counted.
pub struct ChannelForwarder {
    tx: Sender<UiMessage>,
    dropped: AtomicU64,
}

impl ChannelForwarder {
    /// Updates dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ChannelObserver for ChannelForwarder {
    fn value_changed(&self, path: &str, sample: &Sample) {
        let msg = UiMessage::ValueChanged {
            path: path.to_string(),
            sample: *sample,
        };
        match self.tx.try_send(msg) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// UI-side end of the forwarding queue.
pub struct UiBridge {
    pub msg_rx: Receiver<UiMessage>,
    forwarder: Arc<ChannelForwarder>,
}

impl UiBridge {
    pub fn new() -> Self {
        Self::with_capacity(UI_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, msg_rx) = bounded(capacity);
        Self {
            msg_rx,
            forwarder: Arc::new(ChannelForwarder {
                tx,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Bind `channel` to this bridge's forwarder.
    pub fn bind(&self, channel: &Arc<Channel>) -> Binding {
        bind(channel, self.forwarder.clone())
    }

    pub fn forwarder(&self) -> &Arc<ChannelForwarder> {
        &self.forwarder
    }

    /// Drain all pending messages.
    pub fn drain(&self) -> Vec<UiMessage> {
        let mut msgs = Vec::new();
        while let Ok(msg) = self.msg_rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    /// Try to receive a single message without blocking.
    pub fn try_recv(&self) -> Option<UiMessage> {
        self.msg_rx.try_recv().ok()
    }
}

impl Default for UiBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler for a named UI callback.
pub type CallbackHandler = Box<dyn Fn(&ConfigValue) -> Result<()> + Send + Sync>;

/// Named callbacks invoked by external UI events.
#[derive(Default)]
pub struct CallbackRegistry {
    handlers: RwLock<HashMap<String, CallbackHandler>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `name`.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&ConfigValue) -> Result<()> + Send + Sync + 'static,
    {
        sync::write(&self.handlers).insert(name.into(), Box::new(handler));
    }

    pub fn unregister(&self, name: &str) -> bool {
        sync::write(&self.handlers).remove(name).is_some()
    }

    /// Invoke the handler for `name` with `arg`.
    pub fn invoke(&self, name: &str, arg: impl Into<ConfigValue>) -> Result<()> {
        let arg = arg.into();
        let handlers = sync::read(&self.handlers);
        let handler = handlers
            .get(name)
            .ok_or_else(|| QDaqError::not_found(name, name))?;
        tracing::debug!("Callback {}({})", name, arg);
        handler(&arg)
    }

    /// Registered callback names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = sync::read(&self.handlers).keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Handler for a start/stop toggle: `true` arms `target`, `false` disarms it.
///
/// Holds only a weak reference, so a registered toggle does not keep a removed
/// loop alive. Parent and child loops get separate toggles; toggling one never
/// affects the other.
pub fn toggle_handler(target: &Arc<Loop>) -> impl Fn(&ConfigValue) -> Result<()> + Send + Sync {
    let target = Arc::downgrade(target);
    move |arg: &ConfigValue| {
        let target = target
            .upgrade()
            .ok_or_else(|| QDaqError::Engine("toggle target no longer exists".to_string()))?;
        let on = arg.as_bool().ok_or_else(|| {
            QDaqError::Config(format!("toggle expects a bool, got {}", arg))
        })?;
        if on {
            target.arm()
        } else {
            target.disarm()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannelObserver;
    use crate::scheduler::LoopState;

    #[test]
    fn test_bind_delivers_changes() {
        let ch = Channel::new("x").unwrap();
        let mut widget = MockChannelObserver::new();
        widget
            .expect_value_changed()
            .withf(|path, s| path == "x" && s.value == 2.0)
            .times(1)
            .return_const(());
        let binding = bind(&ch, Arc::new(widget));
        binding.write(2.0);
        assert!(binding.unbind());
        ch.push(3.0);
    }

    #[test]
    fn test_bridge_forwards_and_drops_when_full() {
        let bridge = UiBridge::with_capacity(2);
        let ch = Channel::new("x").unwrap();
        let _binding = bridge.bind(&ch);
        for v in 1..=4 {
            ch.push(v as f64);
        }
        let msgs = bridge.drain();
        assert_eq!(msgs.len(), 2);
        match &msgs[0] {
            UiMessage::ValueChanged { path, sample } => {
                assert_eq!(path, "x");
                assert_eq!(sample.value, 1.0);
            }
        }
        assert_eq!(bridge.forwarder().dropped(), 2);
        assert!(bridge.try_recv().is_none());
    }

    #[test]
    fn test_callbacks() {
        let callbacks = CallbackRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        callbacks.register("ping", move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        callbacks.invoke("ping", true).unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(matches!(
            callbacks.invoke("pong", true),
            Err(QDaqError::NotFound { .. })
        ));
        assert_eq!(callbacks.names(), vec!["ping".to_string()]);
    }

    #[test]
    fn test_toggle_handler_arms_and_disarms() {
        let l = Loop::with_period_ms("loop", 20).unwrap();
        l.create_loop_engine().unwrap();
        let callbacks = CallbackRegistry::new();
        callbacks.register("startPressed", toggle_handler(&l));

        callbacks.invoke("startPressed", true).unwrap();
        assert_eq!(l.state(), LoopState::Running);
        callbacks.invoke("startPressed", false).unwrap();
        assert_eq!(l.state(), LoopState::Idle);
        assert!(callbacks.invoke("startPressed", 1.5).is_err());
    }
}
