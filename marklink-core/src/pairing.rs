use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::Message;
use crate::config::PairingConfig;
use crate::editor::Editor;
use crate::error::{CoreError, CoreResult};
use crate::marks::{LinkAttrs, MarkType};
use crate::{EditorId, LinkId};

/// The one outstanding half of a link, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingState {
    pub waiting_for_partner: Option<LinkId>,
    pub waiting_editor_id: Option<EditorId>,
}

impl PairingState {
    pub fn is_waiting(&self) -> bool {
        self.waiting_for_partner.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationResult {
    /// First leg: an unresolved link now waits for its partner.
    Local {
        link_id: LinkId,
        span: (usize, usize),
    },
    /// Second leg: the local link is resolved and `pending` must be delivered
    /// to the source editor once this mutation has rendered.
    Completed {
        link_id: LinkId,
        span: (usize, usize),
        pending: Message,
    },
}

impl MutationResult {
    pub fn link_id(&self) -> LinkId {
        match self {
            MutationResult::Local { link_id, .. } | MutationResult::Completed { link_id, .. } => {
                *link_id
            }
        }
    }
}

pub struct LinkPairingCoordinator {
    state: Mutex<PairingState>,
    glyph: String,
}

impl LinkPairingCoordinator {
    pub fn new(config: &PairingConfig) -> Self {
        Self {
            state: Mutex::new(PairingState::default()),
            glyph: config.glyph.clone(),
        }
    }

    pub fn state(&self) -> PairingState {
        *self.state.lock()
    }

    pub fn is_waiting(&self) -> bool {
        self.state.lock().is_waiting()
    }

    /// Replaces `from..to` in `editor` with the link glyph and either starts
    /// a pairing or completes the outstanding one.
    pub fn begin_or_complete_link(
        &self,
        editor: &mut Editor,
        from: usize,
        to: usize,
    ) -> CoreResult<MutationResult> {
        editor.schema().require(MarkType::BidirectionalLink)?;
        if editor.doc().textblock_at(from, to).is_none() {
            return Err(CoreError::RangeSpansBlocks { from, to });
        }
        editor.set_selection(from, to);

        let previous = std::mem::take(&mut *self.state.lock());
        let editor_id = editor.id();

        match previous.waiting_for_partner {
            None => {
                let link_id = Uuid::new_v4();
                let span = editor.insert_link(LinkAttrs::unresolved(link_id), &self.glyph)?;
                *self.state.lock() = PairingState {
                    waiting_for_partner: Some(link_id),
                    waiting_editor_id: Some(editor_id),
                };
                debug!(editor = %editor_id, link = %link_id, "pairing started");
                Ok(MutationResult::Local { link_id, span })
            }
            Some(partner_id) => {
                let source_editor_id = previous.waiting_editor_id.unwrap_or(editor_id);
                let link_id = Uuid::new_v4();
                let attrs = LinkAttrs::resolved(link_id, partner_id, source_editor_id);
                let span = match editor.insert_link(attrs, &self.glyph) {
                    Ok(span) => span,
                    Err(err) => {
                        *self.state.lock() = previous;
                        return Err(err);
                    }
                };
                info!(
                    source = %source_editor_id,
                    target = %editor_id,
                    first = %partner_id,
                    second = %link_id,
                    "pairing completed"
                );
                Ok(MutationResult::Completed {
                    link_id,
                    span,
                    pending: Message::UpdateFirstLink {
                        editor_id: source_editor_id,
                        link_id: partner_id,
                        partner_id: link_id,
                        target_editor_id: editor_id,
                    },
                })
            }
        }
    }

    pub fn cancel(&self) -> Option<PairingState> {
        let previous = std::mem::take(&mut *self.state.lock());
        previous.is_waiting().then(|| {
            debug!(link = ?previous.waiting_for_partner, "pairing cancelled");
            previous
        })
    }

    /// Cancels only a pairing whose first leg lives in `editor_id`.
    pub fn cancel_if_waiting_on(&self, editor_id: EditorId) -> bool {
        let mut state = self.state.lock();
        if state.waiting_editor_id == Some(editor_id) {
            *state = PairingState::default();
            debug!(editor = %editor_id, "pairing dropped with its source editor");
            true
        } else {
            false
        }
    }
}
