use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::bus::Message;
use crate::color::{ColorRegistry, Theme};
use crate::config::{ColorConfig, HighlightConfig};
use crate::document::{find_occurrences, Document, MarkSpan, Transaction};
use crate::editor::Editor;
use crate::error::{CoreError, CoreResult};
use crate::marks::{CssColor, HighlightAttrs, Mark, MarkType, Rgba};

/// Result of a user highlighting a span.
#[derive(Debug, Clone, PartialEq)]
pub struct HighlightOutcome {
    pub content: String,
    pub color: CssColor,
    /// `SyncHighlight` for every other open editor.
    pub broadcast: Message,
}

/// Keeps one color per highlighted term across every open editor.
///
/// Highlights never overlap. Longest match wins: an occurrence touching a
/// highlight of an equal or longer term is left alone, and a placed
/// occurrence evicts every shorter highlight it touches over that
/// highlight's whole extent, so each span's text stays equal to its term.
pub struct HighlightSynchronizer {
    registry: Arc<Mutex<ColorRegistry>>,
    palette: HashMap<String, [u8; 3]>,
    colors: ColorConfig,
    debounce: Duration,
    theme: Theme,
}

impl HighlightSynchronizer {
    pub fn new(
        registry: Arc<Mutex<ColorRegistry>>,
        config: &HighlightConfig,
        theme: Theme,
    ) -> Self {
        let colors = registry.lock().config().clone();
        Self {
            registry,
            palette: HashMap::new(),
            colors,
            debounce: config.debounce,
            theme,
        }
    }

    pub fn theme(&self) -> Theme {
        self.theme
    }

    /// Learns the term colors already present in `editor`, e.g. after a
    /// restore, and reserves them in the registry. Returns how many terms
    /// were new.
    pub fn adopt_existing(&mut self, editor: &Editor) -> usize {
        let mut adopted = 0;
        for span in editor.highlights() {
            let Some(attrs) = span.mark.as_highlight() else {
                continue;
            };
            let Some(rgba) = attrs.color.to_rgba() else {
                continue;
            };
            if self.palette.contains_key(&attrs.content) {
                continue;
            }
            let rgb = [rgba.r, rgba.g, rgba.b];
            self.registry.lock().adopt(rgb);
            self.palette.insert(attrs.content.clone(), rgb);
            adopted += 1;
        }
        adopted
    }

    /// Forgets every cached term color; called together with a registry clear.
    pub fn reset(&mut self) {
        self.palette.clear();
        self.registry.lock().clear();
    }

    /// Color for `content` under the current theme, allocating on first use.
    pub fn color_for(&mut self, content: &str) -> CssColor {
        if let Some(rgb) = self.palette.get(content) {
            return self.themed(*rgb, self.theme);
        }
        let css = self.registry.lock().allocate(content, self.theme);
        if let Some(rgba) = css.to_rgba() {
            self.palette
                .insert(content.to_string(), [rgba.r, rgba.g, rgba.b]);
        }
        css
    }

    pub fn on_highlight_created(
        &mut self,
        editor: &mut Editor,
        from: usize,
        to: usize,
    ) -> CoreResult<HighlightOutcome> {
        editor.schema().require(MarkType::HighlightSync)?;
        if from >= to {
            return Err(CoreError::EmptySelection);
        }
        if editor.doc().textblock_at(from, to).is_none() {
            return Err(CoreError::RangeSpansBlocks { from, to });
        }
        let content = editor.doc().text_between(from, to);
        if content.trim().is_empty() {
            return Err(CoreError::EmptySelection);
        }

        let len = content.chars().count();
        let existing = editor.highlights();
        let evicted = match placement(&existing, from, to, &content, len) {
            Placement::Blocked(span) => {
                let existing = span
                    .mark
                    .as_highlight()
                    .map(|attrs| attrs.content.clone())
                    .unwrap_or_default();
                return Err(CoreError::ShadowedHighlight { from, to, existing });
            }
            Placement::Place(evicted) => evicted,
        };

        let color = self.color_for(&content);
        let mark = Mark::Highlight(HighlightAttrs::new(content.clone(), color.clone()));
        let tr = evicted
            .iter()
            .fold(Transaction::new(), |tr, (from, to)| {
                tr.remove_mark(*from, *to, MarkType::HighlightSync)
            })
            .add_mark(from, to, mark);
        editor.apply(&tr)?;
        let also = mark_occurrences(editor, &content, &color)?;
        debug!(
            editor = %editor.id(),
            %content,
            %color,
            also,
            "highlight created"
        );

        Ok(HighlightOutcome {
            broadcast: Message::SyncHighlight {
                content: content.clone(),
                color: color.clone(),
                origin: Some(editor.id()),
            },
            content,
            color,
        })
    }

    /// Marks every unmarked occurrence of `content` in `editor`. Re-delivery
    /// is a no-op.
    pub fn on_highlight_broadcast(
        &mut self,
        editor: &mut Editor,
        content: &str,
        color: &CssColor,
    ) -> CoreResult<usize> {
        editor.schema().require(MarkType::HighlightSync)?;
        if let Some(rgba) = color.to_rgba() {
            self.palette
                .entry(content.to_string())
                .or_insert([rgba.r, rgba.g, rgba.b]);
        }
        let marked = mark_occurrences(editor, content, color)?;
        trace!(editor = %editor.id(), content, marked, "broadcast applied");
        Ok(marked)
    }

    /// True once `editor` has been idle for the debounce window since its
    /// last edit.
    pub fn is_due(&self, editor: &Editor, now: Instant) -> bool {
        editor
            .last_edit()
            .is_some_and(|edited| now.saturating_duration_since(edited) >= self.debounce)
    }

    /// Re-scans `editor` for new occurrences of terms it already highlights.
    pub fn passive_pass(&mut self, editor: &mut Editor) -> CoreResult<usize> {
        if !editor.schema().supports(MarkType::HighlightSync) {
            return Ok(0);
        }
        let mut known: Vec<(String, CssColor)> = Vec::new();
        for span in editor.highlights() {
            if let Some(attrs) = span.mark.as_highlight() {
                match known.iter_mut().find(|(content, _)| *content == attrs.content) {
                    Some(entry) => entry.1 = attrs.color.clone(),
                    None => known.push((attrs.content.clone(), attrs.color.clone())),
                }
            }
        }
        known.sort_by_key(|(content, _)| std::cmp::Reverse(content.chars().count()));

        let mut marked = 0;
        for (content, color) in &known {
            marked += mark_occurrences(editor, content, color)?;
        }
        if marked > 0 {
            debug!(editor = %editor.id(), marked, "passive highlight pass");
        }
        Ok(marked)
    }

    /// Recolors existing highlights for `theme`. Never allocates.
    pub fn on_theme_changed(&mut self, editor: &mut Editor, theme: Theme) -> CoreResult<usize> {
        self.theme = theme;
        if !editor.schema().supports(MarkType::HighlightSync) {
            return Ok(0);
        }
        let mut tr = Transaction::new();
        let mut changed = 0;
        for span in editor.highlights() {
            let Some(attrs) = span.mark.as_highlight() else {
                continue;
            };
            let recolored = match self.palette.get(&attrs.content) {
                Some(rgb) => Some(self.themed(*rgb, theme)),
                None => attrs
                    .color
                    .to_rgba()
                    .map(|rgba| CssColor::from_rgba(rgba.with_alpha(self.colors.alpha_for(theme)))),
            };
            match recolored {
                Some(color) if color != attrs.color => {
                    tr = tr
                        .remove_mark(span.from, span.to, MarkType::HighlightSync)
                        .add_mark(
                            span.from,
                            span.to,
                            Mark::Highlight(HighlightAttrs::new(attrs.content.clone(), color)),
                        );
                    changed += 1;
                }
                _ => {}
            }
        }
        if !tr.is_empty() {
            editor.apply(&tr)?;
        }
        Ok(changed)
    }

    pub fn set_theme(&mut self, theme: Theme) {
        self.theme = theme;
    }

    fn themed(&self, rgb: [u8; 3], theme: Theme) -> CssColor {
        CssColor::from_rgba(Rgba {
            r: rgb[0],
            g: rgb[1],
            b: rgb[2],
            alpha: self.colors.alpha_for(theme),
        })
    }
}

enum Placement<'a> {
    /// An equal or longer highlight already overlaps the range.
    Blocked(&'a MarkSpan),
    /// The range may be marked once these highlight extents are cleared.
    Place(Vec<(usize, usize)>),
}

fn placement<'a>(
    existing: &'a [MarkSpan],
    from: usize,
    to: usize,
    content: &str,
    len: usize,
) -> Placement<'a> {
    let mut evicted = Vec::new();
    for span in existing.iter().filter(|span| span.from < to && from < span.to) {
        let Some(attrs) = span.mark.as_highlight() else {
            continue;
        };
        let same_term = attrs.content == content && (span.from, span.to) == (from, to);
        if !same_term && attrs.content.chars().count() >= len {
            return Placement::Blocked(span);
        }
        evicted.push((span.from, span.to));
    }
    Placement::Place(evicted)
}

/// Occurrences of `content` in `doc` to mark, plus the shorter highlight
/// extents they evict.
fn pending_occurrences(
    doc: &Document,
    content: &str,
    mark: &Mark,
) -> (Vec<(usize, usize)>, Vec<(usize, usize)>) {
    let len = content.chars().count();
    let existing = doc.mark_spans(MarkType::HighlightSync);
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut evictions = Vec::new();
    for block in doc.textblocks() {
        for offset in find_occurrences(&block.text(), content) {
            let from = block.content_start + offset;
            let to = from + len;
            if doc.range_carries(from, to, mark) {
                continue;
            }
            // overlapping matches of the same term: the leftmost wins
            if ranges.iter().any(|(f, t)| *f < to && from < *t) {
                continue;
            }
            if let Placement::Place(evicted) = placement(&existing, from, to, content, len) {
                ranges.push((from, to));
                for extent in evicted {
                    if !evictions.contains(&extent) {
                        evictions.push(extent);
                    }
                }
            }
        }
    }
    (ranges, evictions)
}

fn mark_occurrences(editor: &mut Editor, content: &str, color: &CssColor) -> CoreResult<usize> {
    if content.is_empty() {
        return Ok(0);
    }
    let mark = Mark::Highlight(HighlightAttrs::new(content, color.clone()));
    let (ranges, evictions) = pending_occurrences(editor.doc(), content, &mark);
    if ranges.is_empty() {
        return Ok(0);
    }
    let tr = evictions
        .iter()
        .fold(Transaction::new(), |tr, (from, to)| {
            tr.remove_mark(*from, *to, MarkType::HighlightSync)
        });
    let tr = ranges.iter().fold(tr, |tr, (from, to)| {
        tr.add_mark(*from, *to, mark.clone())
    });
    editor.apply(&tr)?;
    Ok(ranges.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::marks::{Schema, STANDARD_SCHEMA};
    use uuid::Uuid;

    fn synchronizer() -> HighlightSynchronizer {
        let registry = ColorRegistry::new(ColorConfig {
            seed: Some(5),
            ..ColorConfig::default()
        });
        HighlightSynchronizer::new(
            Arc::new(Mutex::new(registry)),
            &HighlightConfig::default(),
            Theme::Dark,
        )
    }

    fn editor(paragraphs: &[&str]) -> Editor {
        Editor::new(
            Uuid::new_v4(),
            Document::from_paragraphs(paragraphs.iter().copied()),
            STANDARD_SCHEMA.clone(),
        )
    }

    fn highlight_ranges(editor: &Editor) -> Vec<(usize, usize, String)> {
        editor
            .highlights()
            .into_iter()
            .map(|span| {
                let attrs = span.mark.as_highlight().unwrap();
                (span.from, span.to, attrs.content.clone())
            })
            .collect()
    }

    #[test]
    fn broadcast_marks_every_occurrence_with_the_same_color() {
        let mut sync = synchronizer();
        let mut origin = editor(&["foo"]);
        let mut other = editor(&["foo bar foo"]);

        let outcome = sync.on_highlight_created(&mut origin, 1, 4).unwrap();
        assert_eq!(outcome.content, "foo");
        let marked = sync
            .on_highlight_broadcast(&mut other, "foo", &outcome.color)
            .unwrap();
        assert_eq!(marked, 2);

        let spans = other.highlights();
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[0].from, spans[0].to), (1, 4));
        assert_eq!((spans[1].from, spans[1].to), (9, 12));
        for span in spans {
            assert_eq!(span.mark.as_highlight().unwrap().color, outcome.color);
        }
    }

    #[test]
    fn repeated_broadcast_is_idempotent() {
        let mut sync = synchronizer();
        let mut doc = editor(&["alpha beta alpha"]);
        let color = CssColor::new("rgba(10, 20, 30, 0.4)");
        sync.on_highlight_broadcast(&mut doc, "alpha", &color).unwrap();
        let once = doc.doc().clone();
        let revision = doc.revision();
        assert_eq!(sync.on_highlight_broadcast(&mut doc, "alpha", &color).unwrap(), 0);
        assert_eq!(doc.doc(), &once);
        assert_eq!(doc.revision(), revision);
    }

    #[test]
    fn longer_terms_win_overlaps() {
        let mut sync = synchronizer();
        let mut doc = editor(&["foo bar"]);
        let short = CssColor::new("rgba(1, 1, 1, 0.4)");
        let long = CssColor::new("rgba(2, 2, 2, 0.4)");

        sync.on_highlight_broadcast(&mut doc, "foo", &short).unwrap();
        sync.on_highlight_broadcast(&mut doc, "foo bar", &long).unwrap();
        assert_eq!(highlight_ranges(&doc), vec![(1, 8, "foo bar".to_string())]);

        assert_eq!(sync.on_highlight_broadcast(&mut doc, "foo", &short).unwrap(), 0);
        assert_eq!(highlight_ranges(&doc), vec![(1, 8, "foo bar".to_string())]);
    }

    fn assert_spans_match_their_terms(editor: &Editor) {
        for span in editor.highlights() {
            let attrs = span.mark.as_highlight().unwrap();
            assert_eq!(editor.doc().text_between(span.from, span.to), attrs.content);
        }
    }

    #[test]
    fn longer_broadcast_evicts_partially_overlapping_shorter_highlight() {
        let mut sync = synchronizer();
        let mut doc = editor(&["foo bar baz"]);
        let partial = CssColor::new("rgba(1, 1, 1, 0.4)");
        let long = CssColor::new("rgba(2, 2, 2, 0.4)");

        sync.on_highlight_broadcast(&mut doc, "bar b", &partial).unwrap();
        sync.on_highlight_broadcast(&mut doc, "foo bar", &long).unwrap();
        assert_eq!(highlight_ranges(&doc), vec![(1, 8, "foo bar".to_string())]);
        assert_spans_match_their_terms(&doc);

        assert_eq!(sync.passive_pass(&mut doc).unwrap(), 0);
        assert_eq!(highlight_ranges(&doc), vec![(1, 8, "foo bar".to_string())]);
    }

    #[test]
    fn mixed_overlapping_broadcasts_keep_every_span_equal_to_its_term() {
        let mut sync = synchronizer();
        let mut doc = editor(&["aaa abc abcd bcd", "xabcdx cd"]);
        let terms = ["aa", "bc", "abcd", "cd", "bcd", "c"];
        for (index, term) in terms.iter().enumerate() {
            let color = CssColor::new(format!("rgba({index}, 0, 0, 0.4)"));
            sync.on_highlight_broadcast(&mut doc, term, &color).unwrap();
            assert_spans_match_their_terms(&doc);
        }
        assert_eq!(
            highlight_ranges(&doc),
            vec![
                (1, 3, "aa".to_string()),
                (6, 8, "bc".to_string()),
                (9, 13, "abcd".to_string()),
                (14, 17, "bcd".to_string()),
                (20, 24, "abcd".to_string()),
                (26, 28, "cd".to_string()),
            ]
        );
        assert_eq!(sync.passive_pass(&mut doc).unwrap(), 0);
        assert_spans_match_their_terms(&doc);
    }

    #[test]
    fn overlapping_matches_of_one_term_keep_the_leftmost() {
        let mut sync = synchronizer();
        let mut doc = editor(&["aaa"]);
        let color = CssColor::new("rgba(3, 3, 3, 0.4)");
        assert_eq!(sync.on_highlight_broadcast(&mut doc, "aa", &color).unwrap(), 1);
        assert_eq!(highlight_ranges(&doc), vec![(1, 3, "aa".to_string())]);
        assert_eq!(sync.on_highlight_broadcast(&mut doc, "aa", &color).unwrap(), 0);
    }

    #[test]
    fn creating_inside_a_longer_highlight_is_refused() {
        let mut sync = synchronizer();
        let mut doc = editor(&["foo bar"]);
        sync.on_highlight_created(&mut doc, 1, 8).unwrap();
        let before = doc.doc().clone();

        let err = sync.on_highlight_created(&mut doc, 5, 8).unwrap_err();
        assert_eq!(
            err,
            CoreError::ShadowedHighlight {
                from: 5,
                to: 8,
                existing: "foo bar".to_string()
            }
        );
        assert_eq!(doc.doc(), &before);
        assert_eq!(sync.registry.lock().allocations(), 1);
    }

    #[test]
    fn creating_a_longer_highlight_replaces_the_shorter_one() {
        let mut sync = synchronizer();
        let mut doc = editor(&["foo bar"]);
        sync.on_highlight_created(&mut doc, 5, 8).unwrap();
        sync.on_highlight_created(&mut doc, 1, 8).unwrap();
        assert_eq!(highlight_ranges(&doc), vec![(1, 8, "foo bar".to_string())]);
        assert_spans_match_their_terms(&doc);
    }

    #[test]
    fn restored_colors_are_reused_and_reserved() {
        let mut sync = synchronizer();
        let restored = Editor::new(
            Uuid::new_v4(),
            Document::from_blocks(vec![crate::document::Node::paragraph(vec![
                crate::document::Node::marked_text(
                    "kept",
                    vec![Mark::Highlight(HighlightAttrs::new(
                        "kept",
                        CssColor::new("rgba(200, 30, 90, 0.4)"),
                    ))],
                ),
            ])]),
            STANDARD_SCHEMA.clone(),
        );
        assert_eq!(sync.adopt_existing(&restored), 1);
        assert_eq!(sync.adopt_existing(&restored), 0);
        assert_eq!(sync.registry.lock().allocations(), 1);

        let mut other = editor(&["kept"]);
        let outcome = sync.on_highlight_created(&mut other, 1, 5).unwrap();
        assert_eq!(outcome.color.as_str(), "rgba(200, 30, 90, 0.4)");
        assert_eq!(sync.registry.lock().allocations(), 1);
    }

    #[test]
    fn known_terms_reuse_their_color() {
        let mut sync = synchronizer();
        let mut first = editor(&["term"]);
        let mut second = editor(&["term again"]);
        let a = sync.on_highlight_created(&mut first, 1, 5).unwrap();
        let b = sync.on_highlight_created(&mut second, 1, 5).unwrap();
        assert_eq!(a.color, b.color);
        assert_eq!(sync.registry.lock().allocations(), 1);
    }

    #[test]
    fn creation_rejects_empty_and_cross_block_ranges() {
        let mut sync = synchronizer();
        let mut doc = editor(&["ab", "cd"]);
        assert_eq!(
            sync.on_highlight_created(&mut doc, 2, 2).unwrap_err(),
            CoreError::EmptySelection
        );
        assert_eq!(
            sync.on_highlight_created(&mut doc, 2, 6).unwrap_err(),
            CoreError::RangeSpansBlocks { from: 2, to: 6 }
        );
    }

    #[test]
    fn missing_schema_support_is_reported() {
        let mut sync = synchronizer();
        let mut doc = Editor::new(
            Uuid::new_v4(),
            Document::from_paragraphs(["foo"]),
            Arc::new(Schema::standard().without(MarkType::HighlightSync)),
        );
        let err = sync
            .on_highlight_broadcast(&mut doc, "foo", &CssColor::new("rgba(1, 2, 3, 0.4)"))
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::Schema {
                mark: MarkType::HighlightSync
            }
        );
        assert!(doc.highlights().is_empty());
    }

    #[test]
    fn passive_pass_marks_newly_typed_duplicates() {
        let mut sync = synchronizer();
        let mut doc = editor(&["foo "]);
        sync.on_highlight_created(&mut doc, 1, 4).unwrap();
        doc.set_selection(5, 5);
        let typed_at = Instant::now();
        doc.insert_text("foo", typed_at).unwrap();
        assert_eq!(doc.highlights().len(), 1);

        assert!(!sync.is_due(&doc, typed_at + Duration::from_millis(100)));
        assert!(sync.is_due(&doc, typed_at + Duration::from_millis(1500)));
        assert_eq!(sync.passive_pass(&mut doc).unwrap(), 1);
        assert_eq!(
            highlight_ranges(&doc),
            vec![(1, 4, "foo".to_string()), (5, 8, "foo".to_string())]
        );
    }

    #[test]
    fn theme_change_recolors_without_allocating() {
        let mut sync = synchronizer();
        let mut doc = editor(&["alpha"]);
        let dark = sync.on_highlight_created(&mut doc, 1, 6).unwrap().color;
        assert_eq!(sync.on_theme_changed(&mut doc, Theme::Light).unwrap(), 1);
        let light = doc.highlights()[0].mark.as_highlight().unwrap().color.clone();
        let (dark, light) = (dark.to_rgba().unwrap(), light.to_rgba().unwrap());
        assert_eq!((dark.r, dark.g, dark.b), (light.r, light.g, light.b));
        assert!((light.alpha - 0.35).abs() < f32::EPSILON);
        assert_eq!(sync.registry.lock().allocations(), 1);
        assert_eq!(sync.on_theme_changed(&mut doc, Theme::Light).unwrap(), 0);
    }

    #[test]
    fn theme_change_keeps_foreign_colors_and_swaps_alpha() {
        let mut sync = synchronizer();
        let mut doc = Editor::new(
            Uuid::new_v4(),
            Document::from_blocks(vec![crate::document::Node::paragraph(vec![
                crate::document::Node::marked_text(
                    "loaded",
                    vec![Mark::Highlight(HighlightAttrs::new(
                        "loaded",
                        CssColor::new("rgba(9, 8, 7, 0.4)"),
                    ))],
                ),
            ])]),
            STANDARD_SCHEMA.clone(),
        );
        sync.on_theme_changed(&mut doc, Theme::Light).unwrap();
        let color = doc.highlights()[0].mark.as_highlight().unwrap().color.clone();
        assert_eq!(color.as_str(), "rgba(9, 8, 7, 0.35)");
    }
}
