use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::Message;
use crate::config::NavigationConfig;
use crate::document::{Document, MarkSpan};
use crate::editor::Editor;
use crate::marks::{LinkAttrs, MarkType};
use crate::{EditorId, LinkId};

/// On-screen box of a document position, in rows/columns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coords {
    pub top: f32,
    pub left: f32,
    pub height: f32,
}

pub trait LayoutEngine: Send + Sync {
    fn coords_at_pos(&self, doc: &Document, pos: usize, width: u16) -> Option<Coords>;
    fn document_height(&self, doc: &Document, width: u16) -> f32;
}

/// One row per textblock, one column per character. Used when no renderer
/// is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatLayout;

impl LayoutEngine for FlatLayout {
    fn coords_at_pos(&self, doc: &Document, pos: usize, _width: u16) -> Option<Coords> {
        doc.textblocks()
            .iter()
            .enumerate()
            .find(|(_, block)| block.content_start <= pos && pos <= block.content_end)
            .map(|(row, block)| Coords {
                top: row as f32,
                left: (pos - block.content_start) as f32,
                height: 1.0,
            })
    }

    fn document_height(&self, doc: &Document, _width: u16) -> f32 {
        doc.textblocks().len() as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnimation {
    pub from: f32,
    pub to: f32,
    pub started: Instant,
    pub duration: Duration,
}

impl ScrollAnimation {
    pub fn offset_at(&self, now: Instant) -> f32 {
        let progress = progress(self.started, self.duration, now);
        // ease-in-out cubic
        let eased = if progress < 0.5 {
            4.0 * progress.powi(3)
        } else {
            1.0 - (-2.0 * progress + 2.0).powi(3) / 2.0
        };
        self.from + (self.to - self.from) * eased
    }

    pub fn is_finished(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.duration
    }
}

/// Transient emphasis on a revealed span: held at `scale`, then eased back
/// to 1.0 over `settle`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pulse {
    pub from: usize,
    pub to: usize,
    pub scale: f32,
    pub started: Instant,
    pub hold: Duration,
    pub settle: Duration,
}

impl Pulse {
    pub fn scale_at(&self, now: Instant) -> Option<f32> {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed < self.hold {
            return Some(self.scale);
        }
        if elapsed >= self.hold + self.settle {
            return None;
        }
        let t = progress(self.started + self.hold, self.settle, now);
        Some(self.scale + (1.0 - self.scale) * t)
    }

    pub fn covers(&self, pos: usize) -> bool {
        self.from <= pos && pos < self.to
    }
}

fn progress(started: Instant, duration: Duration, now: Instant) -> f32 {
    if duration.is_zero() {
        return 1.0;
    }
    let elapsed = now.saturating_duration_since(started).as_secs_f32();
    (elapsed / duration.as_secs_f32()).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Viewport {
    pub scroll_top: f32,
    pub width: u16,
    pub height: u16,
    pub scroll: Option<ScrollAnimation>,
    pub pulse: Option<Pulse>,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            scroll_top: 0.0,
            width: 80,
            height: 24,
            scroll: None,
            pulse: None,
        }
    }
}

impl Viewport {
    pub fn resize(&mut self, width: u16, height: u16) {
        self.width = width.max(1);
        self.height = height.max(1);
    }

    /// Advances running effects; returns true while anything is animating.
    pub fn tick(&mut self, now: Instant) -> bool {
        if let Some(scroll) = self.scroll {
            self.scroll_top = scroll.offset_at(now);
            if scroll.is_finished(now) {
                self.scroll_top = scroll.to;
                self.scroll = None;
            }
        }
        if let Some(pulse) = self.pulse {
            if pulse.scale_at(now).is_none() {
                self.pulse = None;
            }
        }
        self.is_animating()
    }

    pub fn is_animating(&self) -> bool {
        self.scroll.is_some() || self.pulse.is_some()
    }

    pub fn pulse_scale_at(&self, pos: usize, now: Instant) -> Option<f32> {
        self.pulse
            .filter(|pulse| pulse.covers(pos))
            .and_then(|pulse| pulse.scale_at(now))
    }
}

/// Span the navigator should scroll to and pulse inside one editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevealTarget {
    pub editor_id: EditorId,
    pub from: usize,
    pub to: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    /// The partner lives in another editor; the host must focus it first.
    CrossDocument(Message),
    Local(RevealTarget),
    NoPartner,
}

pub struct CrossDocumentNavigator {
    config: NavigationConfig,
}

impl CrossDocumentNavigator {
    pub fn new(config: NavigationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NavigationConfig {
        &self.config
    }

    /// Resolves a click on the link glyph at `at` in `editor`.
    pub fn on_link_activated(&self, editor: &Editor, attrs: &LinkAttrs, at: usize) -> Activation {
        let Some(source_id) = attrs.id else {
            return Activation::NoPartner;
        };
        match attrs.target_editor_id {
            Some(target) if target != editor.id() => match attrs.partner_id {
                Some(partner_id) => {
                    debug!(from = %editor.id(), to = %target, %partner_id, "cross-document link");
                    Activation::CrossDocument(Message::NavigateToLink {
                        from_editor_id: editor.id(),
                        to_editor_id: target,
                        partner_id,
                        source_id,
                    })
                }
                None => Activation::NoPartner,
            },
            _ => match find_local_partner(editor.doc(), attrs, at) {
                Some(span) => Activation::Local(RevealTarget {
                    editor_id: editor.id(),
                    from: span.from,
                    to: span.to,
                }),
                None => {
                    debug!(link = %source_id, "no partner in document");
                    Activation::NoPartner
                }
            },
        }
    }

    /// Locates the link to reveal after a cross-document jump: the first link
    /// whose id or partner id is `link_id`.
    pub fn locate(&self, editor: &Editor, link_id: LinkId) -> Option<RevealTarget> {
        editor.find_link_for_reveal(link_id).map(|span| RevealTarget {
            editor_id: editor.id(),
            from: span.from,
            to: span.to,
        })
    }

    /// Centers the span vertically with a smooth scroll and starts a pulse.
    pub fn reveal(
        &self,
        editor: &mut Editor,
        from: usize,
        to: usize,
        layout: &dyn LayoutEngine,
        now: Instant,
    ) -> bool {
        let width = editor.viewport.width;
        let Some(coords) = layout.coords_at_pos(editor.doc(), from, width) else {
            return false;
        };
        let height = f32::from(editor.viewport.height);
        let max_scroll = (layout.document_height(editor.doc(), width) - height).max(0.0);
        let target = (coords.top + coords.height / 2.0 - height / 2.0).clamp(0.0, max_scroll);

        let viewport = &mut editor.viewport;
        viewport.scroll = Some(ScrollAnimation {
            from: viewport.scroll_top,
            to: target,
            started: now,
            duration: self.config.scroll,
        });
        viewport.pulse = Some(Pulse {
            from,
            to,
            scale: self.config.pulse_scale,
            started: now,
            hold: self.config.pulse_hold,
            settle: self.config.pulse_settle,
        });
        debug!(editor = %editor.id(), from, to, target, "revealing span");
        true
    }
}

fn find_local_partner(doc: &Document, attrs: &LinkAttrs, at: usize) -> Option<MarkSpan> {
    let own_id = attrs.id?;
    let partner_id = attrs.partner_id?;
    doc.mark_spans(MarkType::BidirectionalLink)
        .into_iter()
        .filter(|span| !(span.from <= at && at < span.to))
        .find(|span| {
            span.mark
                .as_link()
                .is_some_and(|link| link.id == Some(partner_id) && link.partner_id == Some(own_id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marks::STANDARD_SCHEMA;
    use uuid::Uuid;

    fn editor_with_lines(lines: usize) -> Editor {
        let text: Vec<String> = (0..lines).map(|i| format!("line {i}")).collect();
        let mut editor = Editor::new(
            Uuid::new_v4(),
            Document::from_paragraphs(text),
            STANDARD_SCHEMA.clone(),
        );
        editor.viewport.resize(40, 10);
        editor
    }

    #[test]
    fn pulse_holds_then_settles_then_clears() {
        let start = Instant::now();
        let pulse = Pulse {
            from: 1,
            to: 3,
            scale: 1.5,
            started: start,
            hold: Duration::from_millis(500),
            settle: Duration::from_millis(300),
        };
        assert_eq!(pulse.scale_at(start + Duration::from_millis(100)), Some(1.5));
        let midway = pulse.scale_at(start + Duration::from_millis(650)).unwrap();
        assert!(midway < 1.5 && midway > 1.0);
        assert_eq!(pulse.scale_at(start + Duration::from_millis(800)), None);
    }

    #[test]
    fn reveal_centers_target_and_tick_finishes_effects() {
        let navigator = CrossDocumentNavigator::new(NavigationConfig::default());
        let mut editor = editor_with_lines(100);
        let block = editor.doc().textblocks()[50];
        let start = Instant::now();
        let pos = block.content_start;
        assert!(navigator.reveal(&mut editor, pos, pos + 1, &FlatLayout, start));
        assert_eq!(editor.viewport.scroll.unwrap().to, 50.5 - 5.0);

        let done = start + Duration::from_secs(1);
        assert!(!editor.viewport.tick(done));
        assert_eq!(editor.viewport.scroll_top, 45.5);
        assert!(editor.viewport.pulse.is_none());
    }

    #[test]
    fn reveal_clamps_near_document_edges() {
        let navigator = CrossDocumentNavigator::new(NavigationConfig::default());
        let mut editor = editor_with_lines(3);
        let pos = editor.doc().textblocks()[2].content_start;
        navigator.reveal(&mut editor, pos, pos + 1, &FlatLayout, Instant::now());
        assert_eq!(editor.viewport.scroll.unwrap().to, 0.0);
    }

    #[test]
    fn foreign_target_produces_navigation_request() {
        let navigator = CrossDocumentNavigator::new(NavigationConfig::default());
        let editor = editor_with_lines(1);
        let other = Uuid::new_v4();
        let attrs = LinkAttrs::resolved(Uuid::new_v4(), Uuid::new_v4(), other);
        match navigator.on_link_activated(&editor, &attrs, 1) {
            Activation::CrossDocument(Message::NavigateToLink {
                to_editor_id,
                partner_id,
                source_id,
                ..
            }) => {
                assert_eq!(to_editor_id, other);
                assert_eq!(Some(partner_id), attrs.partner_id);
                assert_eq!(Some(source_id), attrs.id);
            }
            other => panic!("unexpected activation {other:?}"),
        }
    }

    #[test]
    fn unresolved_link_is_a_no_op() {
        let navigator = CrossDocumentNavigator::new(NavigationConfig::default());
        let editor = editor_with_lines(1);
        let attrs = LinkAttrs::unresolved(Uuid::new_v4());
        assert_eq!(navigator.on_link_activated(&editor, &attrs, 1), Activation::NoPartner);
    }
}
