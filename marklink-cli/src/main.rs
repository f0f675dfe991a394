use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use crossterm::cursor;
use crossterm::event;
use crossterm::style::{Attribute, SetAttribute};
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use marklink_core::marks::{HighlightAttrs, LinkAttrs};
use marklink_core::{
    Command, Config, FileStateStore, Mark, MarkSpan, MarkType, PersistedEditor, StateStore,
    Workspace, WorkspaceEvent,
};
use marklink_render::{render_frame, WrapLayout};
use marklink_tty::{write_status_line, EventMapper, InputMode, TerminalWriter, UiEvent, STATUS_ROWS};
use serde::Serialize;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

const IDLE_POLL: Duration = Duration::from_millis(100);
const FRAME_POLL: Duration = Duration::from_millis(16);
const SCRATCH_TITLE: &str = "scratch";

#[derive(Debug, Parser)]
#[command(
    name = "marklink",
    version,
    about = "terminal notes with cross-document links and shared highlights",
    args_conflicts_with_subcommands = true
)]
struct Args {
    /// Configuration file (defaults to config.toml in the platform config dir)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Directory holding saved editors
    #[arg(long = "state-dir", global = true)]
    state_dir: Option<PathBuf>,

    /// Directory for log files
    #[arg(long = "log-dir", global = true)]
    log_dir: Option<PathBuf>,

    /// Reopen every saved editor besides the named ones
    #[arg(short = 'r', long = "restore")]
    restore: bool,

    #[command(subcommand)]
    command: Option<Action>,

    /// Names of editors to open
    names: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Print the links and highlights of saved editors as JSON
    Inspect {
        /// Only the editor with this name
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(
            stdout,
            terminal::LeaveAlternateScreen,
            cursor::Show
        );
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "marklink", "marklink")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let log_dir = args
        .log_dir
        .clone()
        .unwrap_or_else(|| project_dirs.data_local_dir().join("logs"));
    let _log_guard = init_logging(&log_dir, args.command.is_some())?;

    let config = Config::load_or_default(args.config.as_deref(), Some(&project_dirs))?;
    let state_dir = args
        .state_dir
        .clone()
        .unwrap_or_else(|| project_dirs.data_local_dir().join("state"));

    match args.command {
        Some(Action::Inspect { ref name }) => {
            let store = FileStateStore::new(state_dir)?;
            inspect(&store, name.as_deref(), &mut io::stdout())
        }
        Some(Action::Config) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        None => {
            let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(state_dir)?);
            run(&args, config, store)
        }
    }
}

fn run(args: &Args, config: Config, store: Arc<dyn StateStore>) -> Result<()> {
    let layout = WrapLayout::new();
    let mut workspace = Workspace::new(config, store).with_layout(Arc::new(layout));
    if args.restore || args.names.is_empty() {
        let restored = workspace.restore_all()?;
        info!(restored, "restored saved editors");
    }
    for name in &args.names {
        workspace
            .open_named(name)
            .with_context(|| format!("failed to open editor {name:?}"))?;
    }
    if workspace.editors().is_empty() {
        workspace.open_named(SCRATCH_TITLE)?;
    }

    let (columns, rows) = terminal::size()?;
    workspace.apply(
        Command::Resize {
            width: columns,
            height: rows.saturating_sub(STATUS_ROWS),
        },
        Instant::now(),
    )?;

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, terminal::EnterAlternateScreen, cursor::Hide)?;
    let mut writer = TerminalWriter::new(stdout);
    writer.clear_all()?;
    let mut event_mapper = EventMapper::new();
    let mut message: Option<String> = None;
    let mut dirty = true;

    loop {
        let animating = workspace.tick(Instant::now());
        if absorb_events(&workspace, &mut message) {
            dirty = true;
        }

        if dirty || animating {
            redraw(
                &mut writer,
                &workspace,
                &layout,
                &event_mapper,
                message.as_deref(),
            )?;
            dirty = false;
            if workspace.render_completed(Instant::now()) > 0 {
                dirty = true;
            }
        }

        let timeout = if animating || dirty {
            FRAME_POLL
        } else {
            IDLE_POLL
        };
        if event::poll(timeout)? {
            let ui_event = event_mapper.map_event(event::read()?);
            match handle_event(ui_event, &mut workspace, &mut message)? {
                LoopAction::ContinueRedraw => dirty = true,
                LoopAction::Continue => {}
                LoopAction::Quit => break,
            }
        }
    }

    writer.clear_all()?;
    workspace.persist()?;
    Ok(())
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

fn handle_event(
    event: UiEvent,
    workspace: &mut Workspace,
    message: &mut Option<String>,
) -> Result<LoopAction> {
    let command = match event {
        UiEvent::Quit => return Ok(LoopAction::Quit),
        UiEvent::None => return Ok(LoopAction::Continue),
        UiEvent::ModeChanged(_)
        | UiEvent::BeginPrompt
        | UiEvent::PromptChanged { .. }
        | UiEvent::PromptCancel => return Ok(LoopAction::ContinueRedraw),
        UiEvent::CloseActive => Command::CloseEditor {
            index: workspace.active_index(),
        },
        UiEvent::Command(command) => command,
    };

    let closing = matches!(command, Command::CloseEditor { .. });
    *message = None;
    if let Err(err) = workspace.apply(command, Instant::now()) {
        warn!(error = %format!("{err:#}"), "command failed");
        *message = Some(format!("{err:#}"));
        return Ok(LoopAction::ContinueRedraw);
    }
    if closing && workspace.editors().is_empty() {
        return Ok(LoopAction::Quit);
    }
    Ok(LoopAction::ContinueRedraw)
}

/// Drains workspace notifications into the status message. Returns true
/// when anything arrived.
fn absorb_events(workspace: &Workspace, message: &mut Option<String>) -> bool {
    let events = workspace.drain_events();
    for event in &events {
        match event {
            WorkspaceEvent::PairingStarted { .. } => {
                *message = Some("link started, select the partner range and press C-k".into());
            }
            WorkspaceEvent::PairingCompleted { .. } => {
                *message = Some("link completed".into());
            }
            WorkspaceEvent::ThemeChanged(theme) => {
                *message = Some(format!("{} theme", if theme.is_dark() { "dark" } else { "light" }));
            }
            _ => {}
        }
    }
    !events.is_empty()
}

fn redraw(
    writer: &mut TerminalWriter<io::Stdout>,
    workspace: &Workspace,
    layout: &WrapLayout,
    mapper: &EventMapper,
    message: Option<&str>,
) -> Result<()> {
    let Some(editor) = workspace.active() else {
        return Ok(());
    };
    let frame = render_frame(editor, layout, workspace.theme(), Instant::now());
    writer.begin_sync_update()?;
    writer.draw(&frame, editor.viewport.height)?;
    let status = combine_status(
        workspace_status(workspace, mapper.mode()),
        mapper.pending_input().as_deref(),
        message,
    );
    draw_status_line(writer, editor.viewport.height, &status, editor.viewport.width)?;
    if let Some((column, row)) = frame.cursor {
        crossterm::queue!(writer.writer(), cursor::MoveTo(column, row), cursor::Show)?;
    }
    writer.end_sync_update()?;
    Ok(())
}

fn workspace_status(workspace: &Workspace, mode: InputMode) -> String {
    let title = workspace.active().map(|editor| editor.title()).unwrap_or("");
    let mut status = format!(
        "[{}/{}] {} | {}",
        workspace.active_index() + 1,
        workspace.editors().len(),
        title,
        mode.label()
    );
    let pairing = workspace.pairing_state();
    if pairing.is_waiting() {
        let source = pairing
            .waiting_editor_id
            .and_then(|id| workspace.editor(id))
            .map(|editor| editor.title().to_string())
            .unwrap_or_else(|| "closed editor".to_string());
        status.push_str(&format!(" | linking from {source}"));
    }
    status
}

fn combine_status(base: String, pending_input: Option<&str>, message: Option<&str>) -> String {
    let mut status = base;
    for part in [pending_input, message].into_iter().flatten() {
        if !part.is_empty() {
            status.push_str(" | ");
            status.push_str(part);
        }
    }
    status
}

fn draw_status_line(
    writer: &mut TerminalWriter<io::Stdout>,
    row: u16,
    status: &str,
    width: u16,
) -> Result<()> {
    let out = writer.writer();
    crossterm::queue!(
        out,
        cursor::MoveTo(0, row),
        Clear(ClearType::CurrentLine),
        SetAttribute(Attribute::Reverse)
    )?;
    write_status_line(out, &fit_to_width(status, usize::from(width)))?;
    crossterm::queue!(out, SetAttribute(Attribute::Reset))?;
    Ok(())
}

fn fit_to_width(text: &str, width: usize) -> String {
    let mut text: String = text.to_string();
    let length = text.chars().count();
    if length > width {
        if width <= 3 {
            text = text.chars().take(width).collect();
        } else {
            let mut truncated = text.chars().take(width - 3).collect::<String>();
            truncated.push_str("...");
            text = truncated;
        }
    } else {
        text.push_str(&" ".repeat(width - length));
    }
    text
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EditorReport {
    id: String,
    title: String,
    timestamp: u64,
    links: Vec<LinkReport>,
    highlights: Vec<HighlightReport>,
}

#[derive(Debug, Serialize)]
struct LinkReport {
    from: usize,
    to: usize,
    #[serde(flatten)]
    attrs: LinkAttrs,
}

#[derive(Debug, Serialize)]
struct HighlightReport {
    from: usize,
    to: usize,
    #[serde(flatten)]
    attrs: HighlightAttrs,
}

impl EditorReport {
    fn from_persisted(persisted: &PersistedEditor) -> Self {
        let doc = persisted.document();
        let links = doc
            .mark_spans(MarkType::BidirectionalLink)
            .into_iter()
            .filter_map(|span| match span {
                MarkSpan {
                    from,
                    to,
                    mark: Mark::Link(attrs),
                } => Some(LinkReport { from, to, attrs }),
                _ => None,
            })
            .collect();
        let highlights = doc
            .mark_spans(MarkType::HighlightSync)
            .into_iter()
            .filter_map(|span| match span {
                MarkSpan {
                    from,
                    to,
                    mark: Mark::Highlight(attrs),
                } => Some(HighlightReport { from, to, attrs }),
                _ => None,
            })
            .collect();
        Self {
            id: persisted.id.to_string(),
            title: persisted.title.clone(),
            timestamp: persisted.timestamp,
            links,
            highlights,
        }
    }
}

fn inspect<W: Write>(store: &dyn StateStore, name: Option<&str>, out: &mut W) -> Result<()> {
    let wanted = name.map(marklink_core::editor_id_for_name);
    let reports: Vec<EditorReport> = store
        .list()?
        .iter()
        .filter(|persisted| wanted.map_or(true, |id| persisted.id == id))
        .map(EditorReport::from_persisted)
        .collect();
    if let (Some(name), true) = (name, reports.is_empty()) {
        return Err(anyhow!("no saved editor named {name:?}"));
    }
    serde_json::to_writer_pretty(&mut *out, &reports)?;
    writeln!(out)?;
    Ok(())
}

fn init_logging(log_dir: &Path, console: bool) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::never(log_dir, "marklink.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = console.then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
