use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::bus::{Message, MessageBus};
use crate::color::{ColorRegistry, Theme};
use crate::config::Config;
use crate::document::Document;
use crate::editor::{editor_id_for_name, Editor, Motion};
use crate::error::{CoreError, CoreResult};
use crate::highlight::{HighlightOutcome, HighlightSynchronizer};
use crate::marks::{MarkType, Schema, STANDARD_SCHEMA};
use crate::navigator::{Activation, CrossDocumentNavigator, FlatLayout, LayoutEngine};
use crate::pairing::{LinkPairingCoordinator, MutationResult, PairingState};
use crate::store::{PersistedEditor, StateStore};
use crate::{EditorId, LinkId};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    MoveCursor {
        motion: Motion,
        count: usize,
        extend: bool,
    },
    SelectWord,
    InsertText {
        text: String,
    },
    DeleteBackward,
    SplitBlock,
    BeginOrCompleteLink,
    CancelPairing,
    ActivateLink,
    HighlightSelection,
    ToggleTheme,
    NewEditor {
        title: String,
    },
    SwitchEditor {
        index: usize,
    },
    NextEditor {
        count: usize,
    },
    CloseEditor {
        index: usize,
    },
    Resize {
        width: u16,
        height: u16,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkspaceEvent {
    EditorOpened(EditorId),
    EditorClosed(EditorId),
    ActiveEditorChanged(EditorId),
    RedrawNeeded(EditorId),
    /// The host should raise this editor; reveals run after the next
    /// `render_completed`.
    FocusRequested(EditorId),
    PairingStarted {
        editor_id: EditorId,
        link_id: LinkId,
    },
    PairingCompleted {
        editor_id: EditorId,
        link_id: LinkId,
    },
    ThemeChanged(Theme),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingReveal {
    editor_id: EditorId,
    link_id: LinkId,
}

/// All open editors plus the shared annotation machinery.
pub struct Workspace {
    editors: Vec<Editor>,
    active: usize,
    store: Arc<dyn StateStore>,
    events: Arc<Mutex<Vec<WorkspaceEvent>>>,
    bus: MessageBus,
    pairing: Arc<LinkPairingCoordinator>,
    registry: Arc<Mutex<ColorRegistry>>,
    highlights: HighlightSynchronizer,
    navigator: CrossDocumentNavigator,
    layout: Arc<dyn LayoutEngine>,
    schema: Arc<Schema>,
    pending_reveals: Vec<PendingReveal>,
    theme: Theme,
    config: Config,
}

impl Workspace {
    pub fn new(config: Config, store: Arc<dyn StateStore>) -> Self {
        let theme = config.initial_theme();
        let registry = Arc::new(Mutex::new(ColorRegistry::new(config.color.clone())));
        Self {
            editors: Vec::new(),
            active: 0,
            store,
            events: Arc::new(Mutex::new(Vec::new())),
            bus: MessageBus::new(),
            pairing: Arc::new(LinkPairingCoordinator::new(&config.pairing)),
            highlights: HighlightSynchronizer::new(Arc::clone(&registry), &config.highlight, theme),
            registry,
            navigator: CrossDocumentNavigator::new(config.navigation.clone()),
            layout: Arc::new(FlatLayout),
            schema: STANDARD_SCHEMA.clone(),
            pending_reveals: Vec::new(),
            theme,
            config,
        }
    }

    pub fn with_layout(mut self, layout: Arc<dyn LayoutEngine>) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_schema(mut self, schema: Arc<Schema>) -> Self {
        self.schema = schema;
        self
    }

    pub fn events(&self) -> Arc<Mutex<Vec<WorkspaceEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn drain_events(&self) -> Vec<WorkspaceEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn registry(&self) -> Arc<Mutex<ColorRegistry>> {
        Arc::clone(&self.registry)
    }

    pub fn pairing_state(&self) -> PairingState {
        self.pairing.state()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn theme(&self) -> Theme {
        self.theme
    }

    pub fn layout(&self) -> &dyn LayoutEngine {
        self.layout.as_ref()
    }

    pub fn editors(&self) -> &[Editor] {
        &self.editors
    }

    pub fn active(&self) -> Option<&Editor> {
        self.editors.get(self.active)
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn editor(&self, id: EditorId) -> Option<&Editor> {
        self.editors.iter().find(|editor| editor.id() == id)
    }

    pub fn editor_mut(&mut self, id: EditorId) -> Option<&mut Editor> {
        self.editors.iter_mut().find(|editor| editor.id() == id)
    }

    fn index_of(&self, id: EditorId) -> Option<usize> {
        self.editors.iter().position(|editor| editor.id() == id)
    }

    fn emit(&self, event: WorkspaceEvent) {
        self.events.lock().push(event);
    }

    #[instrument(skip(self, doc))]
    pub fn open_document(&mut self, title: &str, doc: Document) -> EditorId {
        let id = editor_id_for_name(title);
        if let Some(index) = self.index_of(id) {
            self.activate(index);
            return id;
        }
        let editor = Editor::new(id, doc, Arc::clone(&self.schema)).with_title(title);
        self.push_editor(editor)
    }

    /// Reopens an editor from the store, or an empty one when nothing is saved.
    #[instrument(skip(self))]
    pub fn open_named(&mut self, title: &str) -> Result<EditorId> {
        let id = editor_id_for_name(title);
        if let Some(index) = self.index_of(id) {
            self.activate(index);
            return Ok(id);
        }
        let doc = match self.store.load(id)? {
            Some(persisted) => persisted.document(),
            None => Document::empty(),
        };
        let editor = Editor::new(id, doc, Arc::clone(&self.schema)).with_title(title);
        Ok(self.push_editor(editor))
    }

    /// Opens every stored editor that is not already open.
    pub fn restore_all(&mut self) -> Result<usize> {
        let mut restored = 0;
        for persisted in self.store.list()? {
            if self.index_of(persisted.id).is_some() {
                continue;
            }
            let title = if persisted.title.is_empty() {
                persisted.id.to_string()
            } else {
                persisted.title.clone()
            };
            let editor =
                Editor::new(persisted.id, persisted.document(), Arc::clone(&self.schema))
                    .with_title(title);
            self.push_editor(editor);
            restored += 1;
        }
        Ok(restored)
    }

    fn push_editor(&mut self, mut editor: Editor) -> EditorId {
        let id = editor.id();
        if let Some(viewport) = self.active().map(|active| active.viewport.clone()) {
            editor.viewport.resize(viewport.width, viewport.height);
        }
        if editor.doc().has_mark_type(MarkType::HighlightSync) {
            let adopted = self.highlights.adopt_existing(&editor);
            debug!(editor = %id, adopted, "adopted stored highlight colors");
            if let Err(err) = self.highlights.on_theme_changed(&mut editor, self.theme) {
                warn!(editor = %id, error = %err, "could not apply theme to opened editor");
            }
        }
        self.editors.push(editor);
        self.active = self.editors.len() - 1;
        self.emit(WorkspaceEvent::EditorOpened(id));
        self.emit(WorkspaceEvent::ActiveEditorChanged(id));
        info!(editor = %id, "editor opened");
        id
    }

    fn activate(&mut self, index: usize) {
        if index < self.editors.len() {
            self.active = index;
            let id = self.editors[index].id();
            self.emit(WorkspaceEvent::ActiveEditorChanged(id));
        }
    }

    #[instrument(skip(self))]
    pub fn close_editor(&mut self, index: usize) -> Result<()> {
        if index >= self.editors.len() {
            return Ok(());
        }
        let editor = &self.editors[index];
        let id = editor.id();
        if editor.doc().is_empty() {
            self.store.remove(id)?;
        } else {
            self.store.save(&PersistedEditor::from_editor(editor)?)?;
        }
        self.editors.remove(index);
        if self.config.pairing.cancel_on_close {
            self.pairing.cancel_if_waiting_on(id);
        }
        self.pending_reveals.retain(|reveal| reveal.editor_id != id);
        self.emit(WorkspaceEvent::EditorClosed(id));

        let highlights_remain = self
            .editors
            .iter()
            .any(|editor| editor.doc().has_mark_type(MarkType::HighlightSync));
        if !highlights_remain && self.registry.lock().allocations() > 0 {
            self.highlights.reset();
            info!("last highlighted editor closed, color registry cleared");
        }

        if self.editors.is_empty() {
            self.active = 0;
        } else if self.active >= index {
            self.active = self.active.saturating_sub(1).min(self.editors.len() - 1);
            let id = self.editors[self.active].id();
            self.emit(WorkspaceEvent::ActiveEditorChanged(id));
        }
        Ok(())
    }

    pub fn apply(&mut self, command: Command, now: Instant) -> Result<()> {
        match command {
            Command::NewEditor { title } => {
                self.open_named(&title)?;
            }
            Command::SwitchEditor { index } => self.activate(index),
            Command::NextEditor { count } => {
                if !self.editors.is_empty() {
                    let next = (self.active + count) % self.editors.len();
                    self.activate(next);
                }
            }
            Command::CloseEditor { index } => self.close_editor(index)?,
            Command::Resize { width, height } => {
                for editor in &mut self.editors {
                    editor.viewport.resize(width, height);
                }
                if let Some(id) = self.active().map(Editor::id) {
                    self.emit(WorkspaceEvent::RedrawNeeded(id));
                }
            }
            Command::ToggleTheme => self.set_theme(!self.theme.is_dark()),
            Command::CancelPairing => {
                self.pairing.cancel();
            }
            command => {
                let id = self
                    .active()
                    .map(Editor::id)
                    .ok_or_else(|| anyhow!("no editor is open"))?;
                self.apply_to_editor(id, command, now)?;
                self.pump();
            }
        }
        Ok(())
    }

    fn apply_to_editor(&mut self, id: EditorId, command: Command, now: Instant) -> Result<()> {
        let editor = self.editor_mut(id).ok_or(CoreError::UnknownEditor(id))?;
        match command {
            Command::MoveCursor {
                motion,
                count,
                extend,
            } => editor.move_cursor(motion, count, extend),
            Command::SelectWord => {
                editor.select_word();
            }
            Command::InsertText { text } => editor.insert_text(&text, now)?,
            Command::DeleteBackward => {
                editor.delete_backward(now)?;
            }
            Command::SplitBlock => editor.split_block(now)?,
            Command::BeginOrCompleteLink => {
                let selection = editor.selection();
                self.begin_or_complete_link(id, selection.from(), selection.to())?;
            }
            Command::ActivateLink => {
                let head = editor.selection().head;
                self.activate_link(id, head, now)?;
            }
            Command::HighlightSelection => {
                if editor.selection().is_empty() {
                    editor.select_word();
                }
                let selection = editor.selection();
                self.highlight(id, selection.from(), selection.to())?;
            }
            _ => {}
        }
        self.emit(WorkspaceEvent::RedrawNeeded(id));
        Ok(())
    }

    /// First or second leg of a pairing over `from..to` in `editor_id`.
    #[instrument(skip(self))]
    pub fn begin_or_complete_link(
        &mut self,
        editor_id: EditorId,
        from: usize,
        to: usize,
    ) -> CoreResult<MutationResult> {
        let pairing = Arc::clone(&self.pairing);
        let editor = self
            .editor_mut(editor_id)
            .ok_or(CoreError::UnknownEditor(editor_id))?;
        let result = pairing.begin_or_complete_link(editor, from, to)?;
        match &result {
            MutationResult::Local { link_id, .. } => {
                self.emit(WorkspaceEvent::PairingStarted {
                    editor_id,
                    link_id: *link_id,
                });
            }
            MutationResult::Completed {
                link_id, pending, ..
            } => {
                self.bus.defer(pending.clone());
                self.emit(WorkspaceEvent::PairingCompleted {
                    editor_id,
                    link_id: *link_id,
                });
            }
        }
        self.emit(WorkspaceEvent::RedrawNeeded(editor_id));
        Ok(result)
    }

    /// Follows the link under `at`. Same-document partners are revealed at
    /// once; cross-document jumps go through the bus.
    #[instrument(skip(self, now))]
    pub fn activate_link(
        &mut self,
        editor_id: EditorId,
        at: usize,
        now: Instant,
    ) -> CoreResult<Activation> {
        let editor = self
            .editor(editor_id)
            .ok_or(CoreError::UnknownEditor(editor_id))?;
        let Some(span) = editor.link_at(at) else {
            return Ok(Activation::NoPartner);
        };
        let Some(attrs) = span.mark.as_link() else {
            return Ok(Activation::NoPartner);
        };
        let activation = self.navigator.on_link_activated(editor, attrs, span.from);
        match &activation {
            Activation::CrossDocument(message) => self.bus.publish(message.clone()),
            Activation::Local(target) => {
                if let Some(index) = self.index_of(target.editor_id) {
                    self.navigator.reveal(
                        &mut self.editors[index],
                        target.from,
                        target.to,
                        self.layout.as_ref(),
                        now,
                    );
                }
                self.emit(WorkspaceEvent::RedrawNeeded(target.editor_id));
            }
            Activation::NoPartner => {}
        }
        Ok(activation)
    }

    /// Highlights `from..to` in `editor_id` and broadcasts it to the others.
    #[instrument(skip(self))]
    pub fn highlight(
        &mut self,
        editor_id: EditorId,
        from: usize,
        to: usize,
    ) -> CoreResult<HighlightOutcome> {
        let index = self
            .index_of(editor_id)
            .ok_or(CoreError::UnknownEditor(editor_id))?;
        let outcome = self
            .highlights
            .on_highlight_created(&mut self.editors[index], from, to)?;
        self.bus.publish(outcome.broadcast.clone());
        self.emit(WorkspaceEvent::RedrawNeeded(editor_id));
        Ok(outcome)
    }

    pub fn set_theme(&mut self, is_dark_mode: bool) {
        let theme = Theme::from_dark_mode(is_dark_mode);
        if theme == self.theme {
            return;
        }
        self.theme = theme;
        self.emit(WorkspaceEvent::ThemeChanged(theme));
        self.bus.publish(Message::ThemeChanged { is_dark_mode });
        self.pump();
    }

    /// Delivers every ready bus message; returns how many were handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Some(message) = self.bus.next() {
            self.dispatch(message);
            handled += 1;
        }
        handled
    }

    fn dispatch(&mut self, message: Message) {
        match message {
            Message::NavigateToLink {
                to_editor_id,
                partner_id,
                ..
            } => match self.index_of(to_editor_id) {
                Some(index) => {
                    self.activate(index);
                    self.emit(WorkspaceEvent::FocusRequested(to_editor_id));
                    self.pending_reveals.push(PendingReveal {
                        editor_id: to_editor_id,
                        link_id: partner_id,
                    });
                }
                None => warn!(editor = %to_editor_id, "navigation target is not open"),
            },
            Message::UpdateFirstLink {
                editor_id,
                link_id,
                partner_id,
                target_editor_id,
            } => {
                let Some(editor) = self.editor_mut(editor_id) else {
                    warn!(editor = %editor_id, link = %link_id, "pairing source editor is gone");
                    return;
                };
                match editor.update_link_partner(link_id, partner_id, target_editor_id) {
                    Ok(true) => self.emit(WorkspaceEvent::RedrawNeeded(editor_id)),
                    Ok(false) => {}
                    Err(err) => warn!(editor = %editor_id, error = %err, "link update rejected"),
                }
            }
            Message::SyncHighlight {
                content,
                color,
                origin,
            } => {
                let mut touched = Vec::new();
                for editor in self
                    .editors
                    .iter_mut()
                    .filter(|editor| Some(editor.id()) != origin)
                {
                    match self
                        .highlights
                        .on_highlight_broadcast(editor, &content, &color)
                    {
                        Ok(0) => {}
                        Ok(_) => touched.push(editor.id()),
                        Err(err) => {
                            warn!(editor = %editor.id(), error = %err, "highlight broadcast rejected")
                        }
                    }
                }
                for id in touched {
                    self.emit(WorkspaceEvent::RedrawNeeded(id));
                }
            }
            Message::ThemeChanged { is_dark_mode } => {
                let theme = Theme::from_dark_mode(is_dark_mode);
                self.highlights.set_theme(theme);
                let mut touched = Vec::new();
                for editor in &mut self.editors {
                    match self.highlights.on_theme_changed(editor, theme) {
                        Ok(0) => {}
                        Ok(_) => touched.push(editor.id()),
                        Err(err) => warn!(editor = %editor.id(), error = %err, "theme pass failed"),
                    }
                }
                for id in touched {
                    self.emit(WorkspaceEvent::RedrawNeeded(id));
                }
            }
        }
    }

    /// Second phase: the host has rendered the last mutation. Runs deferred
    /// link updates and pending reveals.
    pub fn render_completed(&mut self, now: Instant) -> usize {
        let reveals = std::mem::take(&mut self.pending_reveals);
        let mut done = 0;
        for reveal in reveals {
            let Some(index) = self.index_of(reveal.editor_id) else {
                continue;
            };
            let Some(target) = self.navigator.locate(&self.editors[index], reveal.link_id) else {
                debug!(link = %reveal.link_id, "link to reveal not found");
                continue;
            };
            let revealed = self.navigator.reveal(
                &mut self.editors[index],
                target.from,
                target.to,
                self.layout.as_ref(),
                now,
            );
            if revealed {
                self.emit(WorkspaceEvent::RedrawNeeded(reveal.editor_id));
                done += 1;
            }
        }
        if self.bus.release_deferred() > 0 {
            done += self.pump();
        }
        done
    }

    /// Advances animations and runs due passive highlight passes. Returns
    /// true when the active editor needs another frame.
    pub fn tick(&mut self, now: Instant) -> bool {
        let active = self.active().map(Editor::id);
        let mut redraw = Vec::new();
        let mut needs_frame = false;
        for editor in &mut self.editors {
            if self.highlights.is_due(editor, now) {
                editor.take_last_edit();
                match self.highlights.passive_pass(editor) {
                    Ok(0) => {}
                    Ok(_) => redraw.push(editor.id()),
                    Err(err) => warn!(editor = %editor.id(), error = %err, "passive pass failed"),
                }
            }
            if editor.viewport.is_animating() {
                let animating = editor.viewport.tick(now);
                needs_frame |= animating && Some(editor.id()) == active;
                redraw.push(editor.id());
            }
        }
        for id in redraw {
            self.emit(WorkspaceEvent::RedrawNeeded(id));
        }
        needs_frame
    }

    pub fn persist(&self) -> Result<()> {
        for editor in &self.editors {
            if editor.doc().is_empty() {
                continue;
            }
            self.store.save(&PersistedEditor::from_editor(editor)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marks::LinkAttrs;
    use crate::store::MemoryStateStore;
    use std::time::Duration;

    fn workspace() -> (Workspace, Arc<MemoryStateStore>) {
        let mut config = Config::default();
        config.color.seed = Some(17);
        let store = Arc::new(MemoryStateStore::new());
        (Workspace::new(config, store.clone()), store)
    }

    fn link(workspace: &Workspace, editor: EditorId) -> LinkAttrs {
        workspace.editor(editor).unwrap().links()[0]
            .mark
            .as_link()
            .cloned()
            .unwrap()
    }

    #[test]
    fn cross_document_pairing_resolves_after_render() {
        let (mut ws, _) = workspace();
        let e1 = ws.open_document("e1", Document::from_paragraphs(["x"]));
        let e2 = ws.open_document("e2", Document::from_paragraphs(["y"]));

        let l1 = ws.begin_or_complete_link(e1, 1, 2).unwrap().link_id();
        assert_eq!(ws.pairing_state().waiting_editor_id, Some(e1));
        let l2 = ws.begin_or_complete_link(e2, 1, 2).unwrap().link_id();
        assert!(!ws.pairing_state().is_waiting());

        // the first link is untouched until the host confirms the render
        assert_eq!(link(&ws, e1), LinkAttrs::unresolved(l1));
        assert_eq!(ws.bus().deferred(), 1);
        ws.render_completed(Instant::now());

        let first = link(&ws, e1);
        let second = link(&ws, e2);
        assert_eq!(first, LinkAttrs::resolved(l1, l2, e2));
        assert_eq!(second, LinkAttrs::resolved(l2, l1, e1));
        assert!(first.is_partner_of(&second));
    }

    #[test]
    fn activating_a_cross_document_link_focuses_and_reveals_partner() {
        let (mut ws, _) = workspace();
        let e1 = ws.open_document("e1", Document::from_paragraphs(["x"]));
        let e2 = ws.open_document("e2", Document::from_paragraphs(["y"]));
        ws.begin_or_complete_link(e1, 1, 2).unwrap();
        let l2 = ws.begin_or_complete_link(e2, 1, 2).unwrap().link_id();
        let now = Instant::now();
        ws.render_completed(now);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ws.bus().subscribe(move |message| sink.lock().push(message.clone()));

        let activation = ws.activate_link(e1, 1, now).unwrap();
        let Activation::CrossDocument(Message::NavigateToLink {
            to_editor_id,
            partner_id,
            ..
        }) = activation
        else {
            panic!("expected navigation request");
        };
        assert_eq!((to_editor_id, partner_id), (e2, l2));

        ws.drain_events();
        ws.pump();
        assert!(matches!(seen.lock()[0], Message::NavigateToLink { .. }));
        assert_eq!(ws.active().unwrap().id(), e2);
        assert!(ws.drain_events().contains(&WorkspaceEvent::FocusRequested(e2)));
        assert!(ws.editor(e2).unwrap().viewport.pulse.is_none());

        ws.render_completed(now);
        let pulse = ws.editor(e2).unwrap().viewport.pulse.unwrap();
        assert_eq!((pulse.from, pulse.to), (1, 2));
        assert!(!ws.tick(now + Duration::from_secs(2)));
        assert!(ws.editor(e2).unwrap().viewport.pulse.is_none());
    }

    #[test]
    fn same_document_pair_reveals_without_switching() {
        let (mut ws, _) = workspace();
        let e1 = ws.open_document("solo", Document::from_paragraphs(["a", "b"]));
        ws.begin_or_complete_link(e1, 1, 2).unwrap();
        ws.begin_or_complete_link(e1, 4, 5).unwrap();
        ws.render_completed(Instant::now());

        match ws.activate_link(e1, 1, Instant::now()).unwrap() {
            Activation::Local(target) => assert_eq!((target.from, target.to), (4, 5)),
            other => panic!("unexpected activation {other:?}"),
        }
        assert_eq!(ws.editor(e1).unwrap().viewport.pulse.unwrap().from, 4);
    }

    #[test]
    fn highlight_fans_out_to_other_editors() {
        let (mut ws, _) = workspace();
        let e1 = ws.open_document("e1", Document::from_paragraphs(["foo"]));
        let e2 = ws.open_document("e2", Document::from_paragraphs(["foo bar foo"]));

        let outcome = ws.highlight(e1, 1, 4).unwrap();
        assert_eq!(ws.pump(), 1);

        let spans = ws.editor(e2).unwrap().highlights();
        assert_eq!(spans.len(), 2);
        assert!(spans
            .iter()
            .all(|span| span.mark.as_highlight().unwrap().color == outcome.color));

        ws.bus().publish(outcome.broadcast.clone());
        let before = ws.editor(e2).unwrap().doc().clone();
        ws.pump();
        assert_eq!(ws.editor(e2).unwrap().doc(), &before);
    }

    #[test]
    fn schema_errors_abort_without_mutation() {
        let (ws, _) = workspace();
        let mut ws = ws.with_schema(Arc::new(
            Schema::standard().without(MarkType::BidirectionalLink),
        ));
        let e1 = ws.open_document("plain", Document::from_paragraphs(["text"]));
        let err = ws.begin_or_complete_link(e1, 1, 2).unwrap_err();
        assert_eq!(
            err,
            CoreError::Schema {
                mark: MarkType::BidirectionalLink
            }
        );
        assert_eq!(ws.editor(e1).unwrap().doc().plain_text(), "text");
        assert!(!ws.pairing_state().is_waiting());
    }

    #[test]
    fn stale_pairing_source_is_a_no_op() {
        let (mut ws, _) = workspace();
        let e1 = ws.open_document("e1", Document::from_paragraphs(["x"]));
        let e2 = ws.open_document("e2", Document::from_paragraphs(["y"]));
        ws.begin_or_complete_link(e1, 1, 2).unwrap();
        ws.close_editor(0).unwrap();

        let result = ws.begin_or_complete_link(e2, 1, 2).unwrap();
        assert!(matches!(result, MutationResult::Completed { .. }));
        ws.render_completed(Instant::now());
        assert_eq!(link(&ws, e2).target_editor_id, Some(e1));
    }

    #[test]
    fn cancel_on_close_drops_half_formed_pairing() {
        let mut config = Config::default();
        config.pairing.cancel_on_close = true;
        let mut ws = Workspace::new(config, Arc::new(MemoryStateStore::new()));
        let e1 = ws.open_document("e1", Document::from_paragraphs(["x"]));
        ws.begin_or_complete_link(e1, 1, 2).unwrap();
        ws.close_editor(0).unwrap();
        assert!(!ws.pairing_state().is_waiting());
    }

    #[test]
    fn closing_last_highlighted_editor_clears_registry() {
        let (mut ws, _) = workspace();
        let e1 = ws.open_document("e1", Document::from_paragraphs(["foo"]));
        ws.open_document("e2", Document::from_paragraphs(["bar"]));
        ws.highlight(e1, 1, 4).unwrap();
        ws.pump();
        assert_eq!(ws.registry().lock().allocations(), 1);

        ws.close_editor(1).unwrap();
        assert_eq!(ws.registry().lock().allocations(), 1);
        ws.close_editor(0).unwrap();
        assert_eq!(ws.registry().lock().allocations(), 0);
    }

    #[test]
    fn closing_persists_only_non_empty_editors() {
        let (mut ws, store) = workspace();
        let kept = ws.open_document("kept", Document::from_paragraphs(["words"]));
        let dropped = ws.open_document("scratch", Document::empty());
        ws.close_editor(1).unwrap();
        ws.close_editor(0).unwrap();
        assert!(store.load(kept).unwrap().is_some());
        assert!(store.load(dropped).unwrap().is_none());

        let id = ws.open_named("kept").unwrap();
        assert_eq!(id, kept);
        assert_eq!(ws.active().unwrap().doc().plain_text(), "words");
    }

    struct FullDisk;

    impl StateStore for FullDisk {
        fn load(&self, _id: EditorId) -> Result<Option<PersistedEditor>> {
            Ok(None)
        }

        fn save(&self, _editor: &PersistedEditor) -> Result<()> {
            Err(anyhow!("disk full"))
        }

        fn remove(&self, _id: EditorId) -> Result<()> {
            Ok(())
        }

        fn list(&self) -> Result<Vec<PersistedEditor>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn failed_save_keeps_the_editor_open() {
        let mut ws = Workspace::new(Config::default(), Arc::new(FullDisk));
        let id = ws.open_document("notes", Document::from_paragraphs(["keep me"]));
        let err = ws.close_editor(0).unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(ws.editors().len(), 1);
        assert_eq!(ws.editor(id).unwrap().doc().plain_text(), "keep me");
        assert!(!ws.drain_events().contains(&WorkspaceEvent::EditorClosed(id)));
    }

    #[test]
    fn reopened_highlights_keep_their_color_for_new_highlights() {
        let (mut ws, store) = workspace();
        let first = ws.open_document("first", Document::from_paragraphs(["shared"]));
        let color = ws.highlight(first, 1, 7).unwrap().color;
        ws.pump();
        ws.close_editor(0).unwrap();
        assert_eq!(ws.registry().lock().allocations(), 0);
        assert!(store.load(first).unwrap().is_some());

        ws.open_named("first").unwrap();
        assert_eq!(ws.registry().lock().allocations(), 1);
        let second = ws.open_document("second", Document::from_paragraphs(["shared"]));
        assert_eq!(ws.highlight(second, 1, 7).unwrap().color, color);
        assert_eq!(ws.registry().lock().allocations(), 1);
    }

    #[test]
    fn theme_toggle_recolors_open_highlights() {
        let (mut ws, _) = workspace();
        let e1 = ws.open_document("e1", Document::from_paragraphs(["foo"]));
        ws.highlight(e1, 1, 4).unwrap();
        ws.pump();
        ws.apply(Command::ToggleTheme, Instant::now()).unwrap();
        assert_eq!(ws.theme(), Theme::Light);
        let color = ws.editor(e1).unwrap().highlights()[0]
            .mark
            .as_highlight()
            .unwrap()
            .color
            .to_rgba()
            .unwrap();
        assert!((color.alpha - 0.35).abs() < f32::EPSILON);
    }

    #[test]
    fn typed_duplicates_are_highlighted_after_the_debounce() {
        let (mut ws, _) = workspace();
        let e1 = ws.open_document("e1", Document::from_paragraphs(["foo "]));
        ws.highlight(e1, 1, 4).unwrap();
        let start = Instant::now();
        ws.apply(
            Command::MoveCursor {
                motion: Motion::LineEnd,
                count: 1,
                extend: false,
            },
            start,
        )
        .unwrap();
        ws.apply(Command::InsertText { text: "foo".into() }, start)
            .unwrap();
        ws.tick(start + Duration::from_millis(200));
        assert_eq!(ws.editor(e1).unwrap().highlights().len(), 1);
        ws.tick(start + Duration::from_millis(1600));
        assert_eq!(ws.editor(e1).unwrap().highlights().len(), 2);
    }

    #[test]
    fn keyboard_commands_drive_pairing_on_the_active_editor() {
        let (mut ws, _) = workspace();
        let e1 = ws.open_document("e1", Document::from_paragraphs(["x"]));
        let now = Instant::now();
        ws.apply(Command::BeginOrCompleteLink, now).unwrap();
        assert_eq!(ws.pairing_state().waiting_editor_id, Some(e1));
        ws.apply(Command::CancelPairing, now).unwrap();
        assert!(!ws.pairing_state().is_waiting());
        assert_eq!(ws.editor(e1).unwrap().doc().plain_text(), "🔗x");
    }
}
