use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::marks::{add_to_set, remove_from_set, Mark, MarkType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Paragraph,
    Heading,
    CodeBlock,
    Blockquote,
    BulletList,
    OrderedList,
    ListItem,
    HorizontalRule,
}

impl BlockKind {
    pub fn name(&self) -> &'static str {
        match self {
            BlockKind::Paragraph => "paragraph",
            BlockKind::Heading => "heading",
            BlockKind::CodeBlock => "code_block",
            BlockKind::Blockquote => "blockquote",
            BlockKind::BulletList => "bullet_list",
            BlockKind::OrderedList => "ordered_list",
            BlockKind::ListItem => "list_item",
            BlockKind::HorizontalRule => "horizontal_rule",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "paragraph" => Some(BlockKind::Paragraph),
            "heading" => Some(BlockKind::Heading),
            "code_block" => Some(BlockKind::CodeBlock),
            "blockquote" => Some(BlockKind::Blockquote),
            "bullet_list" => Some(BlockKind::BulletList),
            "ordered_list" => Some(BlockKind::OrderedList),
            "list_item" => Some(BlockKind::ListItem),
            "horizontal_rule" => Some(BlockKind::HorizontalRule),
            _ => None,
        }
    }

    /// Blocks whose children are inline text.
    pub fn is_textblock(&self) -> bool {
        matches!(
            self,
            BlockKind::Paragraph | BlockKind::Heading | BlockKind::CodeBlock
        )
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, BlockKind::HorizontalRule)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawNode")]
pub enum Node {
    Block {
        kind: BlockKind,
        attrs: Option<Value>,
        content: Vec<Node>,
    },
    Text {
        text: String,
        marks: Vec<Mark>,
    },
}

impl Node {
    pub fn block(kind: BlockKind, content: Vec<Node>) -> Self {
        Node::Block {
            kind,
            attrs: None,
            content: normalize_inline(content),
        }
    }

    pub fn paragraph(content: Vec<Node>) -> Self {
        Self::block(BlockKind::Paragraph, content)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Node::Text {
            text: text.into(),
            marks: Vec::new(),
        }
    }

    pub fn marked_text(text: impl Into<String>, marks: Vec<Mark>) -> Self {
        let mut set = Vec::new();
        for mark in marks {
            add_to_set(&mut set, mark);
        }
        Node::Text {
            text: text.into(),
            marks: set,
        }
    }

    /// Size in document positions: text counts scalar values, leaf blocks count
    /// one, other blocks add an opening and a closing token around their content.
    pub fn size(&self) -> usize {
        match self {
            Node::Text { text, .. } => text.chars().count(),
            Node::Block { kind, content, .. } => {
                if kind.is_leaf() {
                    1
                } else {
                    2 + content.iter().map(Node::size).sum::<usize>()
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct RawNode {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    attrs: Option<Value>,
    #[serde(default)]
    content: Vec<Node>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    marks: Vec<Mark>,
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        if raw.kind == "text" {
            let text = raw
                .text
                .ok_or_else(|| "text node without text".to_owned())?;
            return Ok(Node::marked_text(text, raw.marks));
        }
        let kind =
            BlockKind::from_name(&raw.kind).ok_or_else(|| format!("unknown node `{}`", raw.kind))?;
        Ok(Node::Block {
            kind,
            attrs: raw.attrs,
            content: normalize_inline(raw.content),
        })
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match self {
            Node::Text { text, marks } => {
                map.serialize_entry("type", "text")?;
                if !marks.is_empty() {
                    map.serialize_entry("marks", marks)?;
                }
                map.serialize_entry("text", text)?;
            }
            Node::Block {
                kind,
                attrs,
                content,
            } => {
                map.serialize_entry("type", kind.name())?;
                if let Some(attrs) = attrs {
                    map.serialize_entry("attrs", attrs)?;
                }
                if !content.is_empty() {
                    map.serialize_entry("content", content)?;
                }
            }
        }
        map.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    Continue,
    SkipChildren,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextSpan<'a> {
    pub from: usize,
    pub to: usize,
    pub text: &'a str,
    pub marks: &'a [Mark],
}

#[derive(Debug, Clone, Copy)]
pub struct TextBlockRef<'a> {
    pub pos: usize,
    pub content_start: usize,
    pub content_end: usize,
    pub node: &'a Node,
}

impl<'a> TextBlockRef<'a> {
    pub fn text(&self) -> String {
        self.spans().iter().map(|span| span.text).collect()
    }

    pub fn spans(&self) -> Vec<TextSpan<'a>> {
        let mut spans = Vec::new();
        if let Node::Block { content, .. } = self.node {
            let mut pos = self.content_start;
            for child in content {
                let size = child.size();
                if let Node::Text { text, marks } = child {
                    spans.push(TextSpan {
                        from: pos,
                        to: pos + size,
                        text,
                        marks,
                    });
                }
                pos += size;
            }
        }
        spans
    }
}

/// A maximal run of text carrying one mark value.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkSpan {
    pub from: usize,
    pub to: usize,
    pub mark: Mark,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    ReplaceText {
        from: usize,
        to: usize,
        text: String,
    },
    SplitBlock {
        pos: usize,
    },
    AddMark {
        from: usize,
        to: usize,
        mark: Mark,
    },
    RemoveMark {
        from: usize,
        to: usize,
        kind: MarkType,
    },
}

/// An ordered batch of steps applied atomically; later steps see the
/// positions produced by earlier ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    steps: Vec<Step>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_text(mut self, from: usize, to: usize, text: impl Into<String>) -> Self {
        self.steps.push(Step::ReplaceText {
            from,
            to,
            text: text.into(),
        });
        self
    }

    pub fn split_block(mut self, pos: usize) -> Self {
        self.steps.push(Step::SplitBlock { pos });
        self
    }

    pub fn add_mark(mut self, from: usize, to: usize, mark: Mark) -> Self {
        self.steps.push(Step::AddMark { from, to, mark });
        self
    }

    pub fn remove_mark(mut self, from: usize, to: usize, kind: MarkType) -> Self {
        self.steps.push(Step::RemoveMark { from, to, kind });
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawDocument")]
pub struct Document {
    content: Vec<Node>,
}

#[derive(Deserialize)]
struct RawDocument {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<Node>,
}

impl TryFrom<RawDocument> for Document {
    type Error = String;

    fn try_from(raw: RawDocument) -> Result<Self, Self::Error> {
        if raw.kind != "doc" {
            return Err(format!("expected `doc` root, found `{}`", raw.kind));
        }
        if raw.content.is_empty() {
            return Ok(Document::empty());
        }
        Ok(Document {
            content: raw.content,
        })
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "doc")?;
        map.serialize_entry("content", &self.content)?;
        map.end()
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::empty()
    }
}

impl Document {
    pub fn empty() -> Self {
        Self {
            content: vec![Node::paragraph(Vec::new())],
        }
    }

    pub fn from_blocks(content: Vec<Node>) -> Self {
        if content.is_empty() {
            return Self::empty();
        }
        Self { content }
    }

    pub fn from_paragraphs<S: AsRef<str>>(paragraphs: impl IntoIterator<Item = S>) -> Self {
        let content = paragraphs
            .into_iter()
            .map(|text| Node::paragraph(vec![Node::text(text.as_ref())]))
            .collect();
        Self::from_blocks(content)
    }

    pub fn from_json(value: &Value) -> CoreResult<Self> {
        serde_json::from_value(value.clone()).map_err(|err| CoreError::Decode(err.to_string()))
    }

    pub fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn content(&self) -> &[Node] {
        &self.content
    }

    pub fn content_size(&self) -> usize {
        self.content.iter().map(Node::size).sum()
    }

    /// Pre-order, left-to-right traversal; `pos` is the position before each node.
    pub fn descendants<'a>(&'a self, mut f: impl FnMut(&'a Node, usize) -> Walk) {
        walk_nodes(&self.content, 0, &mut f);
    }

    pub fn text_spans(&self) -> Vec<TextSpan<'_>> {
        let mut spans = Vec::new();
        self.descendants(|node, pos| {
            if let Node::Text { text, marks } = node {
                spans.push(TextSpan {
                    from: pos,
                    to: pos + node.size(),
                    text,
                    marks,
                });
            }
            Walk::Continue
        });
        spans
    }

    pub fn textblocks(&self) -> Vec<TextBlockRef<'_>> {
        let mut blocks = Vec::new();
        self.descendants(|node, pos| match node {
            Node::Block { kind, .. } if kind.is_textblock() => {
                blocks.push(TextBlockRef {
                    pos,
                    content_start: pos + 1,
                    content_end: pos + node.size() - 1,
                    node,
                });
                Walk::SkipChildren
            }
            _ => Walk::Continue,
        });
        blocks
    }

    pub fn textblock_at(&self, from: usize, to: usize) -> Option<TextBlockRef<'_>> {
        self.textblocks()
            .into_iter()
            .find(|block| block.content_start <= from && to <= block.content_end)
    }

    /// Every position a cursor may rest on, in document order.
    pub fn text_positions(&self) -> Vec<usize> {
        self.textblocks()
            .iter()
            .flat_map(|block| block.content_start..=block.content_end)
            .collect()
    }

    pub fn text_between(&self, from: usize, to: usize) -> String {
        let mut out = String::new();
        for span in self.text_spans() {
            if span.to <= from || span.from >= to {
                continue;
            }
            let start = from.max(span.from) - span.from;
            let end = to.min(span.to) - span.from;
            out.push_str(char_slice(span.text, start, end));
        }
        out
    }

    pub fn plain_text(&self) -> String {
        self.textblocks()
            .iter()
            .map(TextBlockRef::text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Marks on the character starting at `pos`.
    pub fn marks_at(&self, pos: usize) -> Vec<Mark> {
        self.text_spans()
            .into_iter()
            .find(|span| span.from <= pos && pos < span.to)
            .map(|span| span.marks.to_vec())
            .unwrap_or_default()
    }

    pub fn mark_spans(&self, kind: MarkType) -> Vec<MarkSpan> {
        let mut out = Vec::new();
        for block in self.textblocks() {
            let mut open: Option<MarkSpan> = None;
            for span in block.spans() {
                let mark = span.marks.iter().find(|m| m.mark_type() == kind);
                let extends = matches!(
                    (&open, mark),
                    (Some(current), Some(mark)) if current.to == span.from && &current.mark == mark
                );
                if extends {
                    if let Some(current) = open.as_mut() {
                        current.to = span.to;
                    }
                    continue;
                }
                if let Some(done) = open.take() {
                    out.push(done);
                }
                if let Some(mark) = mark {
                    open = Some(MarkSpan {
                        from: span.from,
                        to: span.to,
                        mark: mark.clone(),
                    });
                }
            }
            if let Some(done) = open.take() {
                out.push(done);
            }
        }
        out
    }

    /// First span (left to right) whose mark satisfies `pred`.
    pub fn find_mark_span(
        &self,
        kind: MarkType,
        pred: impl Fn(&Mark) -> bool,
    ) -> Option<MarkSpan> {
        self.mark_spans(kind).into_iter().find(|span| pred(&span.mark))
    }

    /// True when every character in `from..to` carries exactly `mark`.
    pub fn range_carries(&self, from: usize, to: usize, mark: &Mark) -> bool {
        if from >= to {
            return false;
        }
        let mut covered = from;
        for span in self.text_spans() {
            if span.to <= from || span.from >= to {
                continue;
            }
            if span.from > covered || !span.marks.contains(mark) {
                return false;
            }
            covered = span.to;
        }
        covered >= to
    }

    pub fn has_mark_type(&self, kind: MarkType) -> bool {
        self.text_spans()
            .iter()
            .any(|span| span.marks.iter().any(|m| m.mark_type() == kind))
    }

    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.descendants(|node, _| match node {
            Node::Text { text, .. } if !text.is_empty() => {
                empty = false;
                Walk::Stop
            }
            Node::Block { kind, .. } if kind.is_leaf() => {
                empty = false;
                Walk::Stop
            }
            _ => Walk::Continue,
        });
        empty
    }

    /// Applies every step or none; returns whether the tree changed.
    pub fn apply(&mut self, tr: &Transaction) -> CoreResult<bool> {
        let mut content = self.content.clone();
        for step in tr.steps() {
            apply_step(&mut content, step)?;
        }
        let changed = content != self.content;
        self.content = content;
        Ok(changed)
    }
}

fn walk_nodes<'a, F>(nodes: &'a [Node], start: usize, f: &mut F) -> bool
where
    F: FnMut(&'a Node, usize) -> Walk,
{
    let mut pos = start;
    for node in nodes {
        match f(node, pos) {
            Walk::Stop => return true,
            Walk::SkipChildren => {}
            Walk::Continue => {
                if let Node::Block { content, .. } = node {
                    if walk_nodes(content, pos + 1, f) {
                        return true;
                    }
                }
            }
        }
        pos += node.size();
    }
    false
}

fn apply_step(content: &mut Vec<Node>, step: &Step) -> CoreResult<()> {
    let size = content.iter().map(Node::size).sum::<usize>();
    match step {
        Step::AddMark { from, to, mark } => {
            check_range(*from, *to, size)?;
            mark_range(content, 0, *from, *to, &mut |marks: &mut Vec<Mark>| {
                add_to_set(marks, mark.clone())
            });
        }
        Step::RemoveMark { from, to, kind } => {
            check_range(*from, *to, size)?;
            mark_range(content, 0, *from, *to, &mut |marks: &mut Vec<Mark>| {
                remove_from_set(marks, *kind)
            });
        }
        Step::ReplaceText { from, to, text } => {
            check_range(*from, *to, size)?;
            let (path, block_pos) = locate_textblock(content, 0, *from, *to).ok_or(
                CoreError::RangeSpansBlocks {
                    from: *from,
                    to: *to,
                },
            )?;
            let offset = block_pos + 1;
            if let Some(Node::Block { content: inline, .. }) = node_at_path(content, &path) {
                replace_inline(inline, from - offset, to - offset, text);
            }
        }
        Step::SplitBlock { pos } => {
            check_range(*pos, *pos, size)?;
            let (path, block_pos) = locate_textblock(content, 0, *pos, *pos).ok_or(
                CoreError::RangeSpansBlocks {
                    from: *pos,
                    to: *pos,
                },
            )?;
            let index = path.last().copied().unwrap_or_default();
            let siblings = siblings_at_path(content, &path).ok_or(CoreError::RangeSpansBlocks {
                from: *pos,
                to: *pos,
            })?;
            if let Node::Block {
                kind,
                attrs,
                content: inline,
            } = &mut siblings[index]
            {
                let tail = split_inline(inline, pos - block_pos - 1);
                let next = Node::Block {
                    kind: *kind,
                    attrs: attrs.clone(),
                    content: tail,
                };
                siblings.insert(index + 1, next);
            }
        }
    }
    Ok(())
}

fn check_range(from: usize, to: usize, size: usize) -> CoreResult<()> {
    if from > to || to > size {
        return Err(CoreError::InvalidRange { from, to, size });
    }
    Ok(())
}

fn locate_textblock(
    nodes: &[Node],
    start: usize,
    from: usize,
    to: usize,
) -> Option<(Vec<usize>, usize)> {
    let mut pos = start;
    for (index, node) in nodes.iter().enumerate() {
        let size = node.size();
        if let Node::Block { kind, content, .. } = node {
            let inner_start = pos + 1;
            let inner_end = pos + size - 1;
            if !kind.is_leaf() && from >= inner_start && to <= inner_end {
                if kind.is_textblock() {
                    return Some((vec![index], pos));
                }
                let (mut path, block_pos) = locate_textblock(content, inner_start, from, to)?;
                path.insert(0, index);
                return Some((path, block_pos));
            }
        }
        pos += size;
    }
    None
}

fn node_at_path<'a>(nodes: &'a mut [Node], path: &[usize]) -> Option<&'a mut Node> {
    let (first, rest) = path.split_first()?;
    let node = nodes.get_mut(*first)?;
    if rest.is_empty() {
        return Some(node);
    }
    match node {
        Node::Block { content, .. } => node_at_path(content, rest),
        Node::Text { .. } => None,
    }
}

fn siblings_at_path<'a>(nodes: &'a mut Vec<Node>, path: &[usize]) -> Option<&'a mut Vec<Node>> {
    if path.len() <= 1 {
        return Some(nodes);
    }
    match nodes.get_mut(path[0])? {
        Node::Block { content, .. } => siblings_at_path(content, &path[1..]),
        Node::Text { .. } => None,
    }
}

fn mark_range(
    nodes: &mut Vec<Node>,
    start: usize,
    from: usize,
    to: usize,
    f: &mut dyn FnMut(&mut Vec<Mark>),
) {
    if from >= to {
        return;
    }
    let mut pos = start;
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes.drain(..) {
        let size = node.size();
        let end = pos + size;
        let overlaps = end > from && pos < to;
        match node {
            Node::Text { text, marks } if overlaps => {
                let cut_a = from.clamp(pos, end) - pos;
                let cut_b = to.clamp(pos, end) - pos;
                if cut_a > 0 {
                    out.push(Node::Text {
                        text: char_slice(&text, 0, cut_a).to_owned(),
                        marks: marks.clone(),
                    });
                }
                let mut middle = marks.clone();
                f(&mut middle);
                out.push(Node::Text {
                    text: char_slice(&text, cut_a, cut_b).to_owned(),
                    marks: middle,
                });
                if cut_b < size {
                    out.push(Node::Text {
                        text: char_slice(&text, cut_b, size).to_owned(),
                        marks,
                    });
                }
            }
            Node::Block {
                kind,
                attrs,
                mut content,
            } if overlaps && !kind.is_leaf() => {
                mark_range(&mut content, pos + 1, from, to, f);
                out.push(Node::Block {
                    kind,
                    attrs,
                    content,
                });
            }
            other => out.push(other),
        }
        pos = end;
    }
    *nodes = normalize_inline(out);
}

fn replace_inline(content: &mut Vec<Node>, from: usize, to: usize, text: &str) {
    let mut before = Vec::new();
    let mut after = Vec::new();
    let mut pos = 0;
    for node in content.drain(..) {
        let size = node.size();
        let end = pos + size;
        match node {
            Node::Text {
                text: existing,
                marks,
            } => {
                let cut_a = from.clamp(pos, end) - pos;
                let cut_b = to.clamp(pos, end) - pos;
                if cut_a > 0 {
                    before.push(Node::Text {
                        text: char_slice(&existing, 0, cut_a).to_owned(),
                        marks: marks.clone(),
                    });
                }
                if cut_b < size {
                    after.push(Node::Text {
                        text: char_slice(&existing, cut_b, size).to_owned(),
                        marks,
                    });
                }
            }
            other if end <= from => before.push(other),
            other if pos >= to => after.push(other),
            _ => {}
        }
        pos = end;
    }
    before.push(Node::text(text));
    before.extend(after);
    *content = normalize_inline(before);
}

fn split_inline(content: &mut Vec<Node>, at: usize) -> Vec<Node> {
    let mut head = Vec::new();
    let mut tail = Vec::new();
    let mut pos = 0;
    for node in content.drain(..) {
        let size = node.size();
        let end = pos + size;
        match node {
            Node::Text { text, marks } if pos < at && at < end => {
                let cut = at - pos;
                head.push(Node::Text {
                    text: char_slice(&text, 0, cut).to_owned(),
                    marks: marks.clone(),
                });
                tail.push(Node::Text {
                    text: char_slice(&text, cut, size).to_owned(),
                    marks,
                });
            }
            other if end <= at => head.push(other),
            other => tail.push(other),
        }
        pos = end;
    }
    *content = normalize_inline(head);
    normalize_inline(tail)
}

/// Drops empty text nodes and merges neighbours carrying identical marks.
fn normalize_inline(nodes: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::with_capacity(nodes.len());
    for node in nodes {
        if let Node::Text { text, marks } = node {
            if text.is_empty() {
                continue;
            }
            if let Some(Node::Text {
                text: previous,
                marks: previous_marks,
            }) = out.last_mut()
            {
                if *previous_marks == marks {
                    previous.push_str(&text);
                    continue;
                }
            }
            out.push(Node::Text { text, marks });
        } else {
            out.push(node);
        }
    }
    out
}

pub(crate) fn char_slice(text: &str, from: usize, to: usize) -> &str {
    let start = byte_offset(text, from);
    let end = byte_offset(text, to);
    &text[start..end.max(start)]
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(index, _)| index)
        .unwrap_or(text.len())
}

/// Character offsets of every literal occurrence of `needle`, overlapping
/// matches included.
pub fn find_occurrences(haystack: &str, needle: &str) -> Vec<usize> {
    if needle.is_empty() {
        return Vec::new();
    }
    let mut found = Vec::new();
    for (char_index, (byte_index, _)) in haystack.char_indices().enumerate() {
        if haystack[byte_index..].starts_with(needle) {
            found.push(char_index);
        }
    }
    found
}
