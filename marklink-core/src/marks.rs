use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::{EditorId, LinkId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkType {
    Strong,
    Em,
    Code,
    BidirectionalLink,
    HighlightSync,
}

impl MarkType {
    pub fn name(&self) -> &'static str {
        match self {
            MarkType::Strong => "strong",
            MarkType::Em => "em",
            MarkType::Code => "code",
            MarkType::BidirectionalLink => "bidirectional_link",
            MarkType::HighlightSync => "highlight_sync",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "strong" => Some(MarkType::Strong),
            "em" => Some(MarkType::Em),
            "code" => Some(MarkType::Code),
            "bidirectional_link" => Some(MarkType::BidirectionalLink),
            "highlight_sync" => Some(MarkType::HighlightSync),
            _ => None,
        }
    }
}

impl fmt::Display for MarkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Attributes of one end of a bidirectional link.
///
/// Every attribute serializes explicitly, so an unresolved link persists as
/// `{"id": "...", "partnerId": null, "targetEditorId": null}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkAttrs {
    pub id: Option<LinkId>,
    pub partner_id: Option<LinkId>,
    pub target_editor_id: Option<EditorId>,
}

impl LinkAttrs {
    pub fn unresolved(id: LinkId) -> Self {
        Self {
            id: Some(id),
            partner_id: None,
            target_editor_id: None,
        }
    }

    pub fn resolved(id: LinkId, partner_id: LinkId, target_editor_id: EditorId) -> Self {
        Self {
            id: Some(id),
            partner_id: Some(partner_id),
            target_editor_id: Some(target_editor_id),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.id.is_some()
    }

    pub fn is_resolved(&self) -> bool {
        self.partner_id.is_some() && self.target_editor_id.is_some()
    }

    /// True when `self` and `other` reference each other by id.
    pub fn is_partner_of(&self, other: &LinkAttrs) -> bool {
        self.id.is_some()
            && other.id.is_some()
            && self.id == other.partner_id
            && self.partner_id == other.id
    }

    /// Unparseable or missing attributes fall back to `null`.
    pub fn from_value(value: &Value) -> Self {
        Self {
            id: uuid_attr(value, "id"),
            partner_id: uuid_attr(value, "partnerId"),
            target_editor_id: uuid_attr(value, "targetEditorId"),
        }
    }
}

fn uuid_attr(value: &Value, key: &str) -> Option<Uuid> {
    value
        .get(key)
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct HighlightAttrs {
    pub content: String,
    pub color: CssColor,
}

impl HighlightAttrs {
    pub fn new(content: impl Into<String>, color: CssColor) -> Self {
        Self {
            content: content.into(),
            color,
        }
    }

    pub fn from_value(value: &Value) -> Self {
        let content = value
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let color = value
            .get("color")
            .and_then(Value::as_str)
            .map(CssColor::new)
            .unwrap_or_default();
        Self { content, color }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CssColor(String);

impl CssColor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_rgba(rgba: Rgba) -> Self {
        Self(rgba.to_string())
    }

    /// Parses the `rgba(r, g, b, a)` / `rgb(r, g, b)` forms emitted by the allocator.
    pub fn to_rgba(&self) -> Option<Rgba> {
        let raw = self.0.trim();
        let (inner, has_alpha) = if let Some(rest) = raw.strip_prefix("rgba(") {
            (rest.strip_suffix(')')?, true)
        } else if let Some(rest) = raw.strip_prefix("rgb(") {
            (rest.strip_suffix(')')?, false)
        } else {
            return None;
        };
        let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
        let expected = if has_alpha { 4 } else { 3 };
        if parts.len() != expected {
            return None;
        }
        let r = parts[0].parse::<u8>().ok()?;
        let g = parts[1].parse::<u8>().ok()?;
        let b = parts[2].parse::<u8>().ok()?;
        let alpha = if has_alpha {
            parts[3].parse::<f32>().ok()?.clamp(0.0, 1.0)
        } else {
            1.0
        };
        Some(Rgba { r, g, b, alpha })
    }
}

impl fmt::Display for CssColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub alpha: f32,
}

impl Rgba {
    pub fn with_alpha(self, alpha: f32) -> Self {
        Self { alpha, ..self }
    }
}

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rgba({}, {}, {}, {})",
            self.r, self.g, self.b, self.alpha
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "RawMark")]
pub enum Mark {
    Strong,
    Em,
    Code,
    Link(LinkAttrs),
    Highlight(HighlightAttrs),
}

impl Mark {
    pub fn mark_type(&self) -> MarkType {
        match self {
            Mark::Strong => MarkType::Strong,
            Mark::Em => MarkType::Em,
            Mark::Code => MarkType::Code,
            Mark::Link(_) => MarkType::BidirectionalLink,
            Mark::Highlight(_) => MarkType::HighlightSync,
        }
    }

    pub fn as_link(&self) -> Option<&LinkAttrs> {
        match self {
            Mark::Link(attrs) => Some(attrs),
            _ => None,
        }
    }

    pub fn as_highlight(&self) -> Option<&HighlightAttrs> {
        match self {
            Mark::Highlight(attrs) => Some(attrs),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct RawMark {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    attrs: Value,
}

impl TryFrom<RawMark> for Mark {
    type Error = String;

    fn try_from(raw: RawMark) -> Result<Self, Self::Error> {
        let kind = MarkType::from_name(&raw.kind)
            .ok_or_else(|| format!("unknown mark type `{}`", raw.kind))?;
        Ok(match kind {
            MarkType::Strong => Mark::Strong,
            MarkType::Em => Mark::Em,
            MarkType::Code => Mark::Code,
            MarkType::BidirectionalLink => Mark::Link(LinkAttrs::from_value(&raw.attrs)),
            MarkType::HighlightSync => Mark::Highlight(HighlightAttrs::from_value(&raw.attrs)),
        })
    }
}

impl Serialize for Mark {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let has_attrs = matches!(self, Mark::Link(_) | Mark::Highlight(_));
        let mut map = serializer.serialize_map(Some(if has_attrs { 2 } else { 1 }))?;
        map.serialize_entry("type", self.mark_type().name())?;
        match self {
            Mark::Link(attrs) => map.serialize_entry("attrs", attrs)?,
            Mark::Highlight(attrs) => map.serialize_entry("attrs", attrs)?,
            _ => {}
        }
        map.end()
    }
}

/// Adds `mark` to a rank-ordered mark set, replacing any mark of the same type.
pub fn add_to_set(set: &mut Vec<Mark>, mark: Mark) {
    let kind = mark.mark_type();
    set.retain(|existing| existing.mark_type() != kind);
    let index = set
        .iter()
        .position(|existing| existing.mark_type() > kind)
        .unwrap_or(set.len());
    set.insert(index, mark);
}

pub fn remove_from_set(set: &mut Vec<Mark>, kind: MarkType) {
    set.retain(|existing| existing.mark_type() != kind);
}

/// The mark vocabulary a document accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    marks: BTreeSet<MarkType>,
}

pub static STANDARD_SCHEMA: Lazy<Arc<Schema>> = Lazy::new(|| Arc::new(Schema::standard()));

impl Schema {
    pub fn standard() -> Self {
        Self::with_marks([
            MarkType::Strong,
            MarkType::Em,
            MarkType::Code,
            MarkType::BidirectionalLink,
            MarkType::HighlightSync,
        ])
    }

    pub fn with_marks(marks: impl IntoIterator<Item = MarkType>) -> Self {
        Self {
            marks: marks.into_iter().collect(),
        }
    }

    pub fn without(mut self, mark: MarkType) -> Self {
        self.marks.remove(&mark);
        self
    }

    pub fn supports(&self, mark: MarkType) -> bool {
        self.marks.contains(&mark)
    }

    pub fn require(&self, mark: MarkType) -> CoreResult<()> {
        if self.supports(mark) {
            Ok(())
        } else {
            Err(CoreError::Schema { mark })
        }
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_link_serializes_explicit_nulls() {
        let id = Uuid::parse_str("6f1c5a1e-0b7e-4c55-9a39-0c3c1f0c2b11").unwrap();
        let json = serde_json::to_string(&Mark::Link(LinkAttrs::unresolved(id))).unwrap();
        insta::assert_snapshot!(json, @r#"{"type":"bidirectional_link","attrs":{"id":"6f1c5a1e-0b7e-4c55-9a39-0c3c1f0c2b11","partnerId":null,"targetEditorId":null}}"#);
    }

    #[test]
    fn missing_and_malformed_attributes_use_defaults() {
        let mark: Mark =
            serde_json::from_str(r#"{"type":"bidirectional_link","attrs":{"id":"not-a-uuid"}}"#)
                .unwrap();
        assert_eq!(mark, Mark::Link(LinkAttrs::default()));
        assert!(!mark.as_link().unwrap().is_valid());

        let mark: Mark = serde_json::from_str(r#"{"type":"highlight_sync"}"#).unwrap();
        assert_eq!(mark, Mark::Highlight(HighlightAttrs::default()));

        let mark: Mark = serde_json::from_str(r#"{"type":"strong"}"#).unwrap();
        assert_eq!(mark, Mark::Strong);
    }

    #[test]
    fn unknown_mark_type_is_rejected() {
        let result = serde_json::from_str::<Mark>(r#"{"type":"underline"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn partner_relation_is_mutual() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let editor = Uuid::new_v4();
        let first = LinkAttrs::resolved(a, b, editor);
        let second = LinkAttrs::resolved(b, a, editor);
        assert!(first.is_partner_of(&second));
        assert!(second.is_partner_of(&first));
        assert!(!first.is_partner_of(&LinkAttrs::unresolved(b)));
        assert!(first.is_resolved());
        assert!(!LinkAttrs::unresolved(a).is_resolved());
    }

    #[test]
    fn css_color_parses_allocator_output() {
        let color = CssColor::new("rgba(12, 200, 7, 0.35)");
        let rgba = color.to_rgba().unwrap();
        assert_eq!((rgba.r, rgba.g, rgba.b), (12, 200, 7));
        assert!((rgba.alpha - 0.35).abs() < f32::EPSILON);
        assert_eq!(
            CssColor::from_rgba(rgba.with_alpha(0.4)).as_str(),
            "rgba(12, 200, 7, 0.4)"
        );
        assert!(CssColor::new("#ff0000").to_rgba().is_none());
    }

    #[test]
    fn mark_sets_keep_one_mark_per_type_in_rank_order() {
        let mut set = vec![Mark::Code];
        add_to_set(&mut set, Mark::Strong);
        add_to_set(&mut set, Mark::Highlight(HighlightAttrs::new("a", CssColor::new("x"))));
        add_to_set(&mut set, Mark::Highlight(HighlightAttrs::new("b", CssColor::new("y"))));
        assert_eq!(set.len(), 3);
        assert_eq!(set[0], Mark::Strong);
        assert_eq!(set[2].as_highlight().unwrap().content, "b");
        remove_from_set(&mut set, MarkType::HighlightSync);
        assert_eq!(set, vec![Mark::Strong, Mark::Code]);
    }

    #[test]
    fn schema_reports_missing_mark_type() {
        let schema = Schema::standard().without(MarkType::BidirectionalLink);
        assert_eq!(
            schema.require(MarkType::BidirectionalLink),
            Err(CoreError::Schema {
                mark: MarkType::BidirectionalLink
            })
        );
        assert!(schema.require(MarkType::HighlightSync).is_ok());
    }
}
