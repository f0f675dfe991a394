use std::io::{self, Write};

use anyhow::Result;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    queue,
    style::{Attribute, Color, Print, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor},
    terminal::{Clear, ClearType},
};
use marklink_core::{Command, Motion};
use marklink_render::{Frame, Rgb, Style};

/// Rows kept free below the document for the status line.
pub const STATUS_ROWS: u16 = 1;

pub struct TerminalWriter<W: Write> {
    writer: W,
}

impl<W: Write> TerminalWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Paints `frame` into the top `height` rows and parks the cursor.
    pub fn draw(&mut self, frame: &Frame, height: u16) -> Result<()> {
        queue!(self.writer, cursor::Hide)?;
        let background = to_color(frame.palette.background);
        for row in 0..height {
            queue!(
                self.writer,
                cursor::MoveTo(0, row),
                SetBackgroundColor(background),
                Clear(ClearType::CurrentLine)
            )?;
            let Some(line) = frame.lines.get(usize::from(row)) else {
                continue;
            };
            for span in &line.spans {
                self.apply_style(&span.style, background)?;
                queue!(self.writer, Print(&span.text))?;
            }
            queue!(self.writer, SetAttribute(Attribute::Reset))?;
        }
        queue!(self.writer, ResetColor)?;
        if let Some((column, row)) = frame.cursor {
            queue!(self.writer, cursor::MoveTo(column, row), cursor::Show)?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn apply_style(&mut self, style: &Style, background: Color) -> Result<()> {
        queue!(
            self.writer,
            SetAttribute(Attribute::Reset),
            SetBackgroundColor(style.bg.map(to_color).unwrap_or(background))
        )?;
        if let Some(fg) = style.fg {
            queue!(self.writer, SetForegroundColor(to_color(fg)))?;
        }
        if style.bold {
            queue!(self.writer, SetAttribute(Attribute::Bold))?;
        }
        if style.italic {
            queue!(self.writer, SetAttribute(Attribute::Italic))?;
        }
        if style.underline {
            queue!(self.writer, SetAttribute(Attribute::Underlined))?;
        }
        if style.reverse {
            queue!(self.writer, SetAttribute(Attribute::Reverse))?;
        }
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            ResetColor,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

fn to_color(rgb: Rgb) -> Color {
    Color::Rgb {
        r: rgb.r,
        g: rgb.g,
        b: rgb.b,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Command(Command),
    /// Close whichever editor is active; the host knows its index.
    CloseActive,
    ModeChanged(InputMode),
    BeginPrompt,
    PromptChanged { input: String },
    PromptCancel,
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    Visual,
    Insert,
    /// Collecting the title of a new editor.
    Prompt,
}

impl InputMode {
    pub fn label(&self) -> &'static str {
        match self {
            InputMode::Normal => "NORMAL",
            InputMode::Visual => "VISUAL",
            InputMode::Insert => "INSERT",
            InputMode::Prompt => "NEW",
        }
    }
}

/// Turns terminal events into workspace commands, keeping numeric prefixes
/// between keystrokes.
#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
    prompt_buffer: String,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.prompt_buffer.clear();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(KeyEvent {
                kind: KeyEventKind::Release,
                ..
            }) => UiEvent::None,
            Event::Key(KeyEvent {
                code: KeyCode::Char('c'),
                modifiers,
                ..
            }) if modifiers.contains(KeyModifiers::CONTROL) => UiEvent::Quit,
            Event::Resize(width, height) => UiEvent::Command(Command::Resize {
                width,
                height: height.saturating_sub(STATUS_ROWS),
            }),
            Event::Key(key) => match self.mode {
                InputMode::Normal | InputMode::Visual => self.map_key_normal(key),
                InputMode::Insert => self.map_key_insert(key),
                InputMode::Prompt => self.map_key_prompt(key),
            },
            _ => UiEvent::None,
        }
    }

    fn map_key_normal(&mut self, key: KeyEvent) -> UiEvent {
        let KeyEvent {
            code, modifiers, ..
        } = key;
        let visual = self.mode == InputMode::Visual;
        match (code, modifiers) {
            (KeyCode::Char('0'), KeyModifiers::NONE) if self.pending_count.is_none() => {
                self.motion(Motion::LineStart, false)
            }
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('q' | 'k' | 'p'), m)
                if m.contains(KeyModifiers::CONTROL) =>
            {
                self.finish_visual();
                self.reset_count();
                UiEvent::Command(Command::BeginOrCompleteLink)
            }
            (KeyCode::Char('g'), m) if m.contains(KeyModifiers::CONTROL) => {
                self.reset_count();
                UiEvent::Command(Command::CancelPairing)
            }
            (KeyCode::Esc, _) => {
                self.reset_count();
                if visual {
                    self.set_mode(InputMode::Normal);
                    UiEvent::ModeChanged(InputMode::Normal)
                } else {
                    UiEvent::Command(Command::CancelPairing)
                }
            }
            (KeyCode::Left, m) => self.motion(Motion::Left, m.contains(KeyModifiers::SHIFT)),
            (KeyCode::Right, m) => self.motion(Motion::Right, m.contains(KeyModifiers::SHIFT)),
            (KeyCode::Up, m) => self.motion(Motion::Up, m.contains(KeyModifiers::SHIFT)),
            (KeyCode::Down, m) => self.motion(Motion::Down, m.contains(KeyModifiers::SHIFT)),
            (KeyCode::Char('h'), KeyModifiers::NONE) => self.motion(Motion::Left, false),
            (KeyCode::Char('l'), KeyModifiers::NONE) => self.motion(Motion::Right, false),
            (KeyCode::Char('k'), KeyModifiers::NONE) => self.motion(Motion::Up, false),
            (KeyCode::Char('j'), KeyModifiers::NONE) => self.motion(Motion::Down, false),
            (KeyCode::Char('H'), _) => self.motion(Motion::Left, true),
            (KeyCode::Char('L'), _) => self.motion(Motion::Right, true),
            (KeyCode::Char('K'), _) => self.motion(Motion::Up, true),
            (KeyCode::Char('J'), _) => self.motion(Motion::Down, true),
            (KeyCode::Home, _) => self.motion(Motion::LineStart, false),
            (KeyCode::Char('$'), _) | (KeyCode::End, _) => self.motion(Motion::LineEnd, false),
            (KeyCode::Char('g'), KeyModifiers::NONE) => self.motion(Motion::DocStart, false),
            (KeyCode::Char('G'), _) => self.motion(Motion::DocEnd, false),
            (KeyCode::Char('v'), KeyModifiers::NONE) => {
                let next = if visual {
                    InputMode::Normal
                } else {
                    InputMode::Visual
                };
                self.set_mode(next);
                UiEvent::ModeChanged(next)
            }
            (KeyCode::Char('i'), KeyModifiers::NONE) => {
                self.set_mode(InputMode::Insert);
                UiEvent::ModeChanged(InputMode::Insert)
            }
            (KeyCode::Char('w'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Command(Command::SelectWord)
            }
            (KeyCode::Char('*'), _) => {
                self.finish_visual();
                self.reset_count();
                UiEvent::Command(Command::HighlightSelection)
            }
            (KeyCode::Enter, _) => {
                self.reset_count();
                UiEvent::Command(Command::ActivateLink)
            }
            (KeyCode::Char('d'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Command(Command::ToggleTheme)
            }
            (KeyCode::Tab, _) => {
                let count = self.take_count();
                UiEvent::Command(Command::NextEditor { count })
            }
            (KeyCode::Char('e'), KeyModifiers::NONE) => match self.pending_count.take() {
                Some(number) if number > 0 => {
                    self.reset_count();
                    UiEvent::Command(Command::SwitchEditor { index: number - 1 })
                }
                _ => {
                    self.reset_count();
                    UiEvent::None
                }
            },
            (KeyCode::Char('n'), KeyModifiers::NONE) => {
                self.set_mode(InputMode::Prompt);
                UiEvent::BeginPrompt
            }
            (KeyCode::Char('x'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::CloseActive
            }
            (KeyCode::Char('q'), _) => {
                self.reset_count();
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn map_key_insert(&mut self, key: KeyEvent) -> UiEvent {
        let KeyEvent {
            code, modifiers, ..
        } = key;
        match (code, modifiers) {
            (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::ModeChanged(InputMode::Normal)
            }
            (KeyCode::Char('q' | 'k' | 'p'), m)
                if m.contains(KeyModifiers::CONTROL) =>
            {
                UiEvent::Command(Command::BeginOrCompleteLink)
            }
            (KeyCode::Enter, _) => UiEvent::Command(Command::SplitBlock),
            (KeyCode::Backspace, _) => UiEvent::Command(Command::DeleteBackward),
            (KeyCode::Left, m) => self.motion(Motion::Left, m.contains(KeyModifiers::SHIFT)),
            (KeyCode::Right, m) => self.motion(Motion::Right, m.contains(KeyModifiers::SHIFT)),
            (KeyCode::Up, m) => self.motion(Motion::Up, m.contains(KeyModifiers::SHIFT)),
            (KeyCode::Down, m) => self.motion(Motion::Down, m.contains(KeyModifiers::SHIFT)),
            (KeyCode::Char(c), m) if m.is_empty() || m == KeyModifiers::SHIFT => {
                UiEvent::Command(Command::InsertText {
                    text: c.to_string(),
                })
            }
            _ => UiEvent::None,
        }
    }

    fn map_key_prompt(&mut self, key: KeyEvent) -> UiEvent {
        let KeyEvent {
            code, modifiers, ..
        } = key;
        match (code, modifiers) {
            (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::PromptCancel
            }
            (KeyCode::Enter, _) => {
                let title = self.prompt_buffer.trim().to_string();
                self.set_mode(InputMode::Normal);
                if title.is_empty() {
                    UiEvent::PromptCancel
                } else {
                    UiEvent::Command(Command::NewEditor { title })
                }
            }
            (KeyCode::Backspace, _) => {
                self.prompt_buffer.pop();
                UiEvent::PromptChanged {
                    input: self.prompt_buffer.clone(),
                }
            }
            (KeyCode::Char(c), m) if m.is_empty() || m == KeyModifiers::SHIFT => {
                self.prompt_buffer.push(c);
                UiEvent::PromptChanged {
                    input: self.prompt_buffer.clone(),
                }
            }
            _ => UiEvent::None,
        }
    }

    fn motion(&mut self, motion: Motion, extend: bool) -> UiEvent {
        let count = self.take_count();
        UiEvent::Command(Command::MoveCursor {
            motion,
            count,
            extend: extend || self.mode == InputMode::Visual,
        })
    }

    fn finish_visual(&mut self) {
        if self.mode == InputMode::Visual {
            self.set_mode(InputMode::Normal);
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        let next = current.saturating_mul(10).saturating_add(digit);
        self.pending_count = Some(next);
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    pub fn pending_input(&self) -> Option<String> {
        if self.mode == InputMode::Prompt {
            return Some(format!("new: {}", self.prompt_buffer));
        }
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}
