use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use tracing::debug;
use uuid::Uuid;

use crate::document::{Document, MarkSpan, Transaction};
use crate::error::{CoreError, CoreResult};
use crate::marks::{LinkAttrs, Mark, MarkType, Schema};
use crate::navigator::Viewport;
use crate::{EditorId, LinkId};

static EDITOR_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::from_u128(0x3f9a_6c1e_84d2_5b07_9e41_c2a8_d7f0_16b3)
});

/// Stable id for a named editor, so a reopened document keeps the identity
/// its link targets refer to.
pub fn editor_id_for_name(name: &str) -> EditorId {
    Uuid::new_v5(&*EDITOR_NAMESPACE, name.trim().as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn cursor(pos: usize) -> Self {
        Self {
            anchor: pos,
            head: pos,
        }
    }

    pub fn from(&self) -> usize {
        self.anchor.min(self.head)
    }

    pub fn to(&self) -> usize {
        self.anchor.max(self.head)
    }

    pub fn is_empty(&self) -> bool {
        self.anchor == self.head
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Motion {
    Left,
    Right,
    Up,
    Down,
    LineStart,
    LineEnd,
    DocStart,
    DocEnd,
}

pub struct Editor {
    id: EditorId,
    title: String,
    doc: Document,
    schema: Arc<Schema>,
    selection: Selection,
    pub viewport: Viewport,
    last_edit: Option<Instant>,
    revision: u64,
}

impl Editor {
    pub fn new(id: EditorId, doc: Document, schema: Arc<Schema>) -> Self {
        let start = doc.text_positions().first().copied().unwrap_or_default();
        Self {
            id,
            title: id.to_string(),
            doc,
            schema,
            selection: Selection::cursor(start),
            viewport: Viewport::default(),
            last_edit: None,
            revision: 0,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn id(&self) -> EditorId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    /// Bumped on every change to the document tree.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn last_edit(&self) -> Option<Instant> {
        self.last_edit
    }

    /// Clears the pending-edit marker, returning when the edit happened.
    pub fn take_last_edit(&mut self) -> Option<Instant> {
        self.last_edit.take()
    }

    pub fn set_selection(&mut self, anchor: usize, head: usize) {
        self.selection = Selection {
            anchor: self.clamp_pos(anchor),
            head: self.clamp_pos(head),
        };
    }

    pub fn selected_text(&self) -> String {
        self.doc
            .text_between(self.selection.from(), self.selection.to())
    }

    pub fn move_cursor(&mut self, motion: Motion, count: usize, extend: bool) {
        let positions = self.doc.text_positions();
        if positions.is_empty() {
            return;
        }
        let mut head = self.selection.head;
        for _ in 0..count.max(1) {
            head = step(&self.doc, &positions, head, motion);
        }
        self.selection = if extend {
            Selection {
                anchor: self.selection.anchor,
                head,
            }
        } else {
            Selection::cursor(head)
        };
    }

    /// Selects the run of alphanumeric characters around the cursor.
    pub fn select_word(&mut self) -> bool {
        let head = self.selection.head;
        let Some(block) = self.doc.textblock_at(head, head) else {
            return false;
        };
        let chars: Vec<char> = block.text().chars().collect();
        let offset = head - block.content_start;
        let is_word = |index: usize| chars.get(index).is_some_and(|c| c.is_alphanumeric());
        if !is_word(offset) && !(offset > 0 && is_word(offset - 1)) {
            return false;
        }
        let mut start = offset.min(chars.len());
        while start > 0 && is_word(start - 1) {
            start -= 1;
        }
        let mut end = offset;
        while is_word(end) {
            end += 1;
        }
        self.selection = Selection {
            anchor: block.content_start + start,
            head: block.content_start + end,
        };
        true
    }

    /// Applies `tr` atomically and keeps the selection on valid positions.
    pub fn apply(&mut self, tr: &Transaction) -> CoreResult<bool> {
        let changed = self.doc.apply(tr)?;
        if changed {
            self.revision += 1;
            let Selection { anchor, head } = self.selection;
            self.set_selection(anchor, head);
        }
        Ok(changed)
    }

    pub fn insert_text(&mut self, text: &str, now: Instant) -> CoreResult<()> {
        let (from, to) = (self.selection.from(), self.selection.to());
        self.require_single_block(from, to)?;
        self.apply(&Transaction::new().replace_text(from, to, text))?;
        self.selection = Selection::cursor(from + text.chars().count());
        self.last_edit = Some(now);
        Ok(())
    }

    /// Deletes the selection, or the character before the cursor. Does not
    /// join blocks.
    pub fn delete_backward(&mut self, now: Instant) -> CoreResult<bool> {
        let (mut from, to) = (self.selection.from(), self.selection.to());
        if from == to {
            match self.doc.textblock_at(from, to) {
                Some(block) if from > block.content_start => from -= 1,
                _ => return Ok(false),
            }
        }
        self.require_single_block(from, to)?;
        self.apply(&Transaction::new().replace_text(from, to, ""))?;
        self.selection = Selection::cursor(from);
        self.last_edit = Some(now);
        Ok(true)
    }

    pub fn split_block(&mut self, now: Instant) -> CoreResult<()> {
        let (from, to) = (self.selection.from(), self.selection.to());
        self.require_single_block(from, to)?;
        let tr = Transaction::new().replace_text(from, to, "").split_block(from);
        self.apply(&tr)?;
        // closing + opening token
        self.selection = Selection::cursor(self.clamp_pos(from + 2));
        self.last_edit = Some(now);
        Ok(())
    }

    /// Replaces the selection with `glyph` carrying a link mark. Returns the
    /// glyph span.
    pub fn insert_link(&mut self, attrs: LinkAttrs, glyph: &str) -> CoreResult<(usize, usize)> {
        self.schema.require(MarkType::BidirectionalLink)?;
        let (from, to) = (self.selection.from(), self.selection.to());
        self.require_single_block(from, to)?;
        let end = from + glyph.chars().count();
        let tr = Transaction::new()
            .replace_text(from, to, glyph)
            .add_mark(from, end, Mark::Link(attrs));
        self.apply(&tr)?;
        self.selection = Selection::cursor(end);
        Ok((from, end))
    }

    /// The link span under `pos`, falling back to the character before it.
    pub fn link_at(&self, pos: usize) -> Option<MarkSpan> {
        let links = self.doc.mark_spans(MarkType::BidirectionalLink);
        let hit = |pos: usize| links.iter().find(|span| span.from <= pos && pos < span.to);
        hit(pos)
            .or_else(|| pos.checked_sub(1).and_then(hit))
            .cloned()
    }

    pub fn link_under_cursor(&self) -> Option<MarkSpan> {
        self.link_at(self.selection.head)
    }

    /// Rewrites the first link whose id is `link_id` as the resolved half of
    /// a pair. Returns false when no such link exists.
    pub fn update_link_partner(
        &mut self,
        link_id: LinkId,
        partner_id: LinkId,
        target_editor_id: EditorId,
    ) -> CoreResult<bool> {
        self.schema.require(MarkType::BidirectionalLink)?;
        let Some(span) = self.doc.find_mark_span(MarkType::BidirectionalLink, |mark| {
            mark.as_link().is_some_and(|link| link.id == Some(link_id))
        }) else {
            debug!(editor = %self.id, link = %link_id, "link to update not found");
            return Ok(false);
        };
        let attrs = LinkAttrs::resolved(link_id, partner_id, target_editor_id);
        let tr = Transaction::new()
            .remove_mark(span.from, span.to, MarkType::BidirectionalLink)
            .add_mark(span.from, span.to, Mark::Link(attrs));
        self.apply(&tr)?;
        Ok(true)
    }

    pub fn find_link_for_reveal(&self, link_id: LinkId) -> Option<MarkSpan> {
        self.doc.find_mark_span(MarkType::BidirectionalLink, |mark| {
            mark.as_link()
                .is_some_and(|link| link.id == Some(link_id) || link.partner_id == Some(link_id))
        })
    }

    pub fn links(&self) -> Vec<MarkSpan> {
        self.doc.mark_spans(MarkType::BidirectionalLink)
    }

    pub fn highlights(&self) -> Vec<MarkSpan> {
        self.doc.mark_spans(MarkType::HighlightSync)
    }

    fn require_single_block(&self, from: usize, to: usize) -> CoreResult<()> {
        let size = self.doc.content_size();
        if from > to || to > size {
            return Err(CoreError::InvalidRange { from, to, size });
        }
        self.doc
            .textblock_at(from, to)
            .map(|_| ())
            .ok_or(CoreError::RangeSpansBlocks { from, to })
    }

    fn clamp_pos(&self, pos: usize) -> usize {
        let positions = self.doc.text_positions();
        match positions.binary_search(&pos) {
            Ok(_) => pos,
            Err(index) => positions
                .get(index)
                .or_else(|| positions.last())
                .copied()
                .unwrap_or_default(),
        }
    }
}

fn step(doc: &Document, positions: &[usize], head: usize, motion: Motion) -> usize {
    let index = positions
        .binary_search(&head)
        .unwrap_or_else(|index| index.min(positions.len() - 1));
    let blocks = doc.textblocks();
    let current = blocks
        .iter()
        .position(|block| block.content_start <= head && head <= block.content_end);
    match motion {
        Motion::Left => positions[index.saturating_sub(1)],
        Motion::Right => positions[(index + 1).min(positions.len() - 1)],
        Motion::DocStart => positions[0],
        Motion::DocEnd => positions[positions.len() - 1],
        Motion::LineStart => current.map_or(head, |i| blocks[i].content_start),
        Motion::LineEnd => current.map_or(head, |i| blocks[i].content_end),
        Motion::Up | Motion::Down => {
            let Some(i) = current else {
                return head;
            };
            let target = match motion {
                Motion::Up => i.checked_sub(1),
                _ => Some(i + 1).filter(|next| *next < blocks.len()),
            };
            match target {
                Some(t) => {
                    let column = head - blocks[i].content_start;
                    (blocks[t].content_start + column).min(blocks[t].content_end)
                }
                None => head,
            }
        }
    }
}
