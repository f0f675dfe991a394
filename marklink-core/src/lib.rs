use uuid::Uuid;

pub mod bus;
pub mod color;
pub mod config;
pub mod document;
pub mod editor;
pub mod error;
pub mod highlight;
pub mod marks;
pub mod navigator;
pub mod pairing;
pub mod store;
pub mod workspace;

pub type EditorId = Uuid;
pub type LinkId = Uuid;

pub use bus::{Message, MessageBus};
pub use color::{ColorRegistry, Theme};
pub use config::Config;
pub use document::{BlockKind, Document, MarkSpan, Node, Transaction};
pub use editor::{editor_id_for_name, Editor, Motion, Selection};
pub use error::{CoreError, CoreResult};
pub use highlight::{HighlightOutcome, HighlightSynchronizer};
pub use marks::{CssColor, HighlightAttrs, LinkAttrs, Mark, MarkType, Schema};
pub use navigator::{Activation, Coords, CrossDocumentNavigator, LayoutEngine, Viewport};
pub use pairing::{LinkPairingCoordinator, MutationResult, PairingState};
pub use store::{FileStateStore, MemoryStateStore, PersistedEditor, StateStore};
pub use workspace::{Command, Workspace, WorkspaceEvent};
