//! Publish/subscribe event bus.
//!
//! Each subscription runs its handler in a dedicated task with its own
//! queue, so a slow handler never blocks the publisher or other handlers.
//! Within one tag a handler observes events in publish order; across tags
//! no ordering is defined.

use crate::pipeline::state::State;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Event tag used for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    StateChanged,
    UserSpeaking,
    AsrFinal,
    ToolCallRequested,
    ToolAudioReady,
    EmotionChanged,
    TtsInterrupted,
}

/// Bus event payload.
#[derive(Debug, Clone)]
pub enum BusEvent {
    StateChanged { from: State, to: State },
    UserSpeaking,
    AsrFinal { text: String },
    ToolCallRequested { name: String },
    ToolAudioReady { name: String },
    EmotionChanged { emotion: String },
    TtsInterrupted,
}

impl BusEvent {
    pub fn tag(&self) -> EventTag {
        match self {
            Self::StateChanged { .. } => EventTag::StateChanged,
            Self::UserSpeaking => EventTag::UserSpeaking,
            Self::AsrFinal { .. } => EventTag::AsrFinal,
            Self::ToolCallRequested { .. } => EventTag::ToolCallRequested,
            Self::ToolAudioReady { .. } => EventTag::ToolAudioReady,
            Self::EmotionChanged { .. } => EventTag::EmotionChanged,
            Self::TtsInterrupted => EventTag::TtsInterrupted,
        }
    }
}

/// Handler invoked for each delivered event.
pub type EventHandler = Box<dyn FnMut(BusEvent) + Send>;

struct Subscription {
    tag: EventTag,
    tx: mpsc::UnboundedSender<BusEvent>,
}

/// Tag-routed publish/subscribe bus.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to one tag. The handler runs in its own task and
    /// lives until the bus is dropped.
    pub fn subscribe(&self, tag: EventTag, mut handler: EventHandler) {
        let (tx, mut rx) = mpsc::unbounded_channel::<BusEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
        });
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.push(Subscription { tag, tx });
        }
    }

    /// Publish an event to every subscriber of its tag. Never blocks.
    pub fn publish(&self, event: BusEvent) {
        let tag = event.tag();
        let Ok(mut subs) = self.subscriptions.lock() else {
            return;
        };
        subs.retain(|sub| {
            if sub.tag != tag {
                return true;
            }
            match sub.tx.send(event.clone()) {
                Ok(()) => true,
                Err(_) => {
                    debug!(?tag, "dropping dead bus subscription");
                    false
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn events_delivered_in_publish_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_handler = Arc::clone(&seen);
        bus.subscribe(
            EventTag::AsrFinal,
            Box::new(move |event| {
                if let BusEvent::AsrFinal { text } = event {
                    seen_handler.lock().unwrap().push(text);
                }
            }),
        );

        for i in 0..10 {
            bus.publish(BusEvent::AsrFinal { text: i.to_string() });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock().unwrap();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(*seen, expected);
    }

    #[tokio::test]
    async fn handlers_only_see_their_tag() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_handler = Arc::clone(&count);
        bus.subscribe(
            EventTag::TtsInterrupted,
            Box::new(move |_| {
                count_handler.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(BusEvent::UserSpeaking);
        bus.publish(BusEvent::TtsInterrupted);
        bus.publish(BusEvent::AsrFinal { text: "x".into() });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_handler_does_not_block_publisher() {
        let bus = EventBus::new();
        bus.subscribe(
            EventTag::UserSpeaking,
            Box::new(|_| {
                std::thread::sleep(Duration::from_millis(200));
            }),
        );

        let start = std::time::Instant::now();
        for _ in 0..5 {
            bus.publish(BusEvent::UserSpeaking);
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
