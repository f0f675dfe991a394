use std::time::Instant;

use marklink_core::document::{BlockKind, Document, Node};
use marklink_core::marks::Mark;
use marklink_core::navigator::{Coords, LayoutEngine};
use marklink_core::{Editor, Theme};
use rayon::prelude::*;
use tracing::{instrument, trace};

/// Terminal columns taken by `c`. Wide east-asian and emoji ranges count two.
pub fn char_width(c: char) -> u16 {
    match c as u32 {
        0x1100..=0x115F
        | 0x2E80..=0xA4CF
        | 0xAC00..=0xD7A3
        | 0xF900..=0xFAFF
        | 0xFE30..=0xFE4F
        | 0xFF00..=0xFF60
        | 0xFFE0..=0xFFE6
        | 0x1F300..=0x1F64F
        | 0x1F900..=0x1F9FF
        | 0x20000..=0x3FFFD => 2,
        _ => 1,
    }
}

fn str_width(s: &str) -> u16 {
    s.chars().map(char_width).sum()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub pos: usize,
    pub ch: char,
    pub marks: Vec<Mark>,
}

/// One screen row of a laid-out document.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub kind: BlockKind,
    pub prefix: String,
    pub cells: Vec<Cell>,
    /// First position on this row.
    pub start: usize,
    /// Position after the last cell.
    pub end: usize,
    /// The last row of a textblock also owns its closing cursor position.
    pub closes_block: bool,
}

impl Row {
    fn contains(&self, pos: usize) -> bool {
        (self.start <= pos && pos < self.end) || (self.closes_block && pos == self.end)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentLayout {
    pub rows: Vec<Row>,
}

impl DocumentLayout {
    pub fn row_of(&self, pos: usize) -> Option<usize> {
        self.rows.iter().position(|row| row.contains(pos))
    }

    pub fn coords(&self, pos: usize) -> Option<Coords> {
        let index = self.row_of(pos)?;
        let row = &self.rows[index];
        let before: u16 = row
            .cells
            .iter()
            .take_while(|cell| cell.pos < pos)
            .map(|cell| char_width(cell.ch))
            .sum();
        Some(Coords {
            top: index as f32,
            left: f32::from(str_width(&row.prefix) + before),
            height: 1.0,
        })
    }
}

/// Soft-wrapping layout: every textblock is broken into rows at word
/// boundaries, falling back to hard breaks for long words.
#[derive(Debug, Clone, Copy, Default)]
pub struct WrapLayout;

impl WrapLayout {
    pub fn new() -> Self {
        Self
    }

    #[instrument(skip(self, doc))]
    pub fn layout(&self, doc: &Document, width: u16) -> DocumentLayout {
        let width = width.max(8);
        let mut starts = Vec::with_capacity(doc.content().len());
        let mut pos = 0;
        for node in doc.content() {
            starts.push(pos);
            pos += node.size();
        }
        let rows = doc
            .content()
            .par_iter()
            .zip(starts.par_iter())
            .map(|(node, start)| {
                let mut rows = Vec::new();
                layout_block(node, *start, width, "", "", &mut rows);
                rows
            })
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        trace!(rows = rows.len(), "document laid out");
        DocumentLayout { rows }
    }
}

impl LayoutEngine for WrapLayout {
    fn coords_at_pos(&self, doc: &Document, pos: usize, width: u16) -> Option<Coords> {
        self.layout(doc, width).coords(pos)
    }

    fn document_height(&self, doc: &Document, width: u16) -> f32 {
        self.layout(doc, width).rows.len() as f32
    }
}

fn layout_block(
    node: &Node,
    pos: usize,
    width: u16,
    first_prefix: &str,
    prefix: &str,
    out: &mut Vec<Row>,
) {
    let Node::Block { kind, content, .. } = node else {
        return;
    };
    match kind {
        BlockKind::HorizontalRule => {
            let rule_width = width.saturating_sub(str_width(first_prefix)).max(1);
            out.push(Row {
                kind: *kind,
                prefix: format!("{first_prefix}{}", "─".repeat(usize::from(rule_width))),
                cells: Vec::new(),
                start: pos,
                end: pos,
                closes_block: false,
            });
        }
        BlockKind::Paragraph | BlockKind::Heading | BlockKind::CodeBlock => {
            let (first, rest) = match kind {
                BlockKind::Heading => (format!("{first_prefix}# "), format!("{prefix}  ")),
                BlockKind::CodeBlock => (format!("{first_prefix}  "), format!("{prefix}  ")),
                _ => (first_prefix.to_string(), prefix.to_string()),
            };
            wrap_textblock(*kind, content, pos + 1, width, &first, &rest, out);
        }
        BlockKind::Blockquote => {
            let first = format!("{first_prefix}│ ");
            let rest = format!("{prefix}│ ");
            layout_children(content, pos + 1, width, &first, &rest, &rest, out);
        }
        BlockKind::BulletList | BlockKind::OrderedList => {
            let mut child_pos = pos + 1;
            for (index, item) in content.iter().enumerate() {
                let marker = match kind {
                    BlockKind::OrderedList => format!("{}. ", index + 1),
                    _ => "• ".to_string(),
                };
                let item_prefix = if index == 0 { first_prefix } else { prefix };
                let first = format!("{item_prefix}{marker}");
                let rest = format!("{prefix}{}", " ".repeat(marker.chars().count()));
                layout_block(item, child_pos, width, &first, &rest, out);
                child_pos += item.size();
            }
        }
        BlockKind::ListItem => {
            layout_children(content, pos + 1, width, first_prefix, prefix, prefix, out);
        }
    }
}

fn layout_children(
    children: &[Node],
    pos: usize,
    width: u16,
    first_prefix: &str,
    prefix: &str,
    later_prefix: &str,
    out: &mut Vec<Row>,
) {
    let mut child_pos = pos;
    for (index, child) in children.iter().enumerate() {
        let first = if index == 0 { first_prefix } else { later_prefix };
        layout_block(child, child_pos, width, first, prefix, out);
        child_pos += child.size();
    }
}

fn wrap_textblock(
    kind: BlockKind,
    inline: &[Node],
    content_start: usize,
    width: u16,
    first_prefix: &str,
    prefix: &str,
    out: &mut Vec<Row>,
) {
    let mut cells = Vec::new();
    let mut pos = content_start;
    for node in inline {
        if let Node::Text { text, marks } = node {
            for ch in text.chars() {
                cells.push(Cell {
                    pos,
                    ch,
                    marks: marks.clone(),
                });
                pos += 1;
            }
        } else {
            pos += node.size();
        }
    }
    let content_end = pos;

    let mut rows: Vec<Vec<Cell>> = Vec::new();
    let mut current: Vec<Cell> = Vec::new();
    let mut used = 0u16;
    for cell in cells {
        let available = width
            .saturating_sub(str_width(if rows.is_empty() { first_prefix } else { prefix }))
            .max(1);
        let w = char_width(cell.ch);
        if used + w > available && !current.is_empty() {
            let split = current
                .iter()
                .rposition(|c| c.ch == ' ')
                .filter(|index| *index + 1 < current.len())
                .map(|index| index + 1)
                .unwrap_or(current.len());
            let carried = current.split_off(split);
            rows.push(std::mem::replace(&mut current, carried));
            used = current.iter().map(|c| char_width(c.ch)).sum();
        }
        used += w;
        current.push(cell);
    }
    rows.push(current);

    let count = rows.len();
    let mut row_start = content_start;
    for (index, cells) in rows.into_iter().enumerate() {
        let last = index + 1 == count;
        let end = if last {
            content_end
        } else {
            cells.last().map_or(row_start, |cell| cell.pos + 1)
        };
        out.push(Row {
            kind,
            prefix: if index == 0 { first_prefix } else { prefix }.to_string(),
            cells,
            start: row_start,
            end,
            closes_block: last,
        });
        row_start = end;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Composites `top` with opacity `alpha` over `self`.
    pub fn blend(self, top: Rgb, alpha: f32) -> Rgb {
        let alpha = alpha.clamp(0.0, 1.0);
        let mix = |under: u8, over: u8| {
            (f32::from(over) * alpha + f32::from(under) * (1.0 - alpha)).round() as u8
        };
        Rgb::new(mix(self.r, top.r), mix(self.g, top.g), mix(self.b, top.b))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    pub background: Rgb,
    pub foreground: Rgb,
    pub muted: Rgb,
    pub link: Rgb,
    pub code: Rgb,
}

impl Palette {
    pub fn for_theme(theme: Theme) -> Self {
        match theme {
            Theme::Dark => Self {
                background: Rgb::new(24, 24, 27),
                foreground: Rgb::new(228, 228, 231),
                muted: Rgb::new(113, 113, 122),
                link: Rgb::new(96, 165, 250),
                code: Rgb::new(251, 191, 36),
            },
            Theme::Light => Self {
                background: Rgb::new(250, 250, 249),
                foreground: Rgb::new(28, 25, 23),
                muted: Rgb::new(120, 113, 108),
                link: Rgb::new(37, 99, 235),
                code: Rgb::new(180, 83, 9),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Style {
    pub fg: Option<Rgb>,
    pub bg: Option<Rgb>,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub reverse: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StyledSpan {
    pub text: String,
    pub style: Style,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Line {
    pub spans: Vec<StyledSpan>,
}

impl Line {
    fn push(&mut self, ch: char, style: Style) {
        match self.spans.last_mut() {
            Some(span) if span.style == style => span.text.push(ch),
            _ => self.spans.push(StyledSpan {
                text: ch.to_string(),
                style,
            }),
        }
    }

    pub fn text(&self) -> String {
        self.spans.iter().map(|span| span.text.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub lines: Vec<Line>,
    /// (column, row) of the cursor when it is on screen.
    pub cursor: Option<(u16, u16)>,
    pub palette: Palette,
}

impl Frame {
    pub fn text(&self) -> Vec<String> {
        self.lines.iter().map(Line::text).collect()
    }
}

/// Draws the visible part of `editor` for its viewport.
pub fn render_frame(editor: &Editor, layout: &WrapLayout, theme: Theme, now: Instant) -> Frame {
    let palette = Palette::for_theme(theme);
    let viewport = &editor.viewport;
    let laid_out = layout.layout(editor.doc(), viewport.width);
    let top = viewport.scroll_top.max(0.0).round() as usize;
    let height = usize::from(viewport.height);
    let selection = editor.selection();

    let lines = laid_out
        .rows
        .iter()
        .skip(top)
        .take(height)
        .map(|row| {
            let mut line = Line::default();
            for ch in row.prefix.chars() {
                line.push(
                    ch,
                    Style {
                        fg: Some(palette.muted),
                        ..Style::default()
                    },
                );
            }
            for cell in &row.cells {
                let mut style = cell_style(cell, &palette);
                if selection.from() <= cell.pos && cell.pos < selection.to() {
                    style.reverse = true;
                }
                if viewport
                    .pulse_scale_at(cell.pos, now)
                    .is_some_and(|scale| scale > 1.0)
                {
                    style.bold = true;
                    style.reverse = !style.reverse;
                }
                line.push(cell.ch, style);
            }
            line
        })
        .collect();

    let cursor = laid_out.coords(selection.head).and_then(|coords| {
        let row = coords.top as usize;
        (row >= top && row < top + height).then(|| (coords.left as u16, (row - top) as u16))
    });

    Frame {
        lines,
        cursor,
        palette,
    }
}

fn cell_style(cell: &Cell, palette: &Palette) -> Style {
    let mut style = Style {
        fg: Some(palette.foreground),
        ..Style::default()
    };
    for mark in &cell.marks {
        match mark {
            Mark::Strong => style.bold = true,
            Mark::Em => style.italic = true,
            Mark::Code => style.fg = Some(palette.code),
            Mark::Link(_) => {
                style.fg = Some(palette.link);
                style.underline = true;
            }
            Mark::Highlight(attrs) => {
                if let Some(rgba) = attrs.color.to_rgba() {
                    let color = Rgb::new(rgba.r, rgba.g, rgba.b);
                    style.bg = Some(palette.background.blend(color, rgba.alpha));
                }
            }
        }
    }
    style
}
