use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::marks::CssColor;
use crate::{EditorId, LinkId};

/// Typed cross-document messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Message {
    NavigateToLink {
        from_editor_id: EditorId,
        to_editor_id: EditorId,
        partner_id: LinkId,
        source_id: LinkId,
    },
    UpdateFirstLink {
        editor_id: EditorId,
        link_id: LinkId,
        partner_id: LinkId,
        target_editor_id: EditorId,
    },
    SyncHighlight {
        content: String,
        color: CssColor,
        /// Originating editor; receivers skip it.
        origin: Option<EditorId>,
    },
    ThemeChanged {
        is_dark_mode: bool,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::NavigateToLink { .. } => "navigate_to_link",
            Message::UpdateFirstLink { .. } => "update_first_link",
            Message::SyncHighlight { .. } => "sync_highlight",
            Message::ThemeChanged { .. } => "theme_changed",
        }
    }
}

pub type Handler = Box<dyn FnMut(&Message) + Send>;

#[derive(Default)]
struct BusState {
    ready: VecDeque<Message>,
    deferred: VecDeque<Message>,
    handlers: Vec<Handler>,
}

/// Publish/subscribe channel between editors.
///
/// `publish` makes a message deliverable on the next `drain`; `defer` holds it
/// until the host confirms a render with `release_deferred`. Subscribers see
/// every message as it is drained.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<Mutex<BusState>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, message: Message) {
        trace!(kind = message.kind(), "publish");
        self.inner.lock().ready.push_back(message);
    }

    pub fn defer(&self, message: Message) {
        trace!(kind = message.kind(), "defer");
        self.inner.lock().deferred.push_back(message);
    }

    pub fn subscribe(&self, handler: impl FnMut(&Message) + Send + 'static) {
        self.inner.lock().handlers.push(Box::new(handler));
    }

    /// Moves deferred messages to the ready queue; returns how many moved.
    pub fn release_deferred(&self) -> usize {
        let mut state = self.inner.lock();
        let released = state.deferred.len();
        let deferred = std::mem::take(&mut state.deferred);
        state.ready.extend(deferred);
        released
    }

    /// Pops the next ready message and notifies subscribers.
    pub fn next(&self) -> Option<Message> {
        let (message, mut handlers) = {
            let mut state = self.inner.lock();
            let message = state.ready.pop_front()?;
            (message, std::mem::take(&mut state.handlers))
        };
        // Handlers run unlocked so they may publish.
        for handler in handlers.iter_mut() {
            handler(&message);
        }
        let mut state = self.inner.lock();
        handlers.append(&mut state.handlers);
        state.handlers = handlers;
        Some(message)
    }

    pub fn deferred(&self) -> usize {
        self.inner.lock().deferred.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn deferred_messages_wait_for_release() {
        let bus = MessageBus::new();
        bus.defer(Message::ThemeChanged { is_dark_mode: true });
        bus.publish(Message::ThemeChanged { is_dark_mode: false });

        assert_eq!(
            bus.next(),
            Some(Message::ThemeChanged {
                is_dark_mode: false
            })
        );
        assert_eq!(bus.next(), None);
        assert_eq!(bus.release_deferred(), 1);
        assert_eq!(bus.next(), Some(Message::ThemeChanged { is_dark_mode: true }));
    }

    #[test]
    fn subscribers_observe_drained_messages() {
        let bus = MessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |message| sink.lock().push(message.kind()));

        bus.publish(Message::SyncHighlight {
            content: "alpha".into(),
            color: CssColor::new("rgba(1, 2, 3, 0.4)"),
            origin: None,
        });
        assert!(seen.lock().is_empty());
        while bus.next().is_some() {}
        assert_eq!(*seen.lock(), vec!["sync_highlight"]);
    }

    #[test]
    fn payloads_use_camel_case_fields() {
        let editor = Uuid::nil();
        let message = Message::UpdateFirstLink {
            editor_id: editor,
            link_id: editor,
            partner_id: editor,
            target_editor_id: editor,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "updateFirstLink",
                "editorId": editor,
                "linkId": editor,
                "partnerId": editor,
                "targetEditorId": editor,
            })
        );
    }
}
