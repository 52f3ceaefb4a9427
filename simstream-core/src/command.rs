//! Stdin command grammar and reader.
//!
//! Commands arrive as newline-terminated text on standard input:
//!
//! ```text
//! rotate <rotation>
//! touch <phase> x1,y1 [x2,y2 ...]     phase: began | moved | ended
//! button <name>,<direction>           name: home | lock | side
//! key <code>,<direction>              code: USB HID key code
//! fps true|false
//! shutdown
//! ```
//!
//! Lines are whitespace-trimmed and empty lines ignored. Anything that
//! does not parse becomes [`Command::Unknown`], logged at WARN and
//! otherwise dropped; a malformed line is never fatal. The touch phase
//! also accepts `down` / `move` / `up`, the spellings the production
//! orchestrator emits.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// ── Command types ────────────────────────────────────────────────

/// Touch gesture phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchPhase {
    Began,
    Moved,
    Ended,
}

impl TouchPhase {
    /// Parse a phase token, accepting both spelling families.
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "began" | "down" => Some(TouchPhase::Began),
            "moved" | "move" => Some(TouchPhase::Moved),
            "ended" | "up" => Some(TouchPhase::Ended),
            _ => None,
        }
    }
}

/// One normalized touch location, both axes in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchPoint {
    pub x: f64,
    pub y: f64,
}

impl TouchPoint {
    /// Parse `x,y` (no interior spaces), clamping into the unit square.
    fn parse(token: &str) -> Option<Self> {
        let (x, y) = token.split_once(',')?;
        let x: f64 = x.parse().ok()?;
        let y: f64 = y.parse().ok()?;
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        Some(Self {
            x: x.clamp(0.0, 1.0),
            y: y.clamp(0.0, 1.0),
        })
    }
}

/// Hardware button selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonName {
    Home,
    Lock,
    Side,
}

impl ButtonName {
    fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "home" => Some(ButtonName::Home),
            "lock" => Some(ButtonName::Lock),
            "side" => Some(ButtonName::Side),
            _ => None,
        }
    }
}

/// Press direction for buttons and keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Down,
    Up,
}

impl Direction {
    fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "down" => Some(Direction::Down),
            "up" => Some(Direction::Up),
            _ => None,
        }
    }
}

/// A parsed stdin command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Orientation change request. Accepted and logged only.
    Rotate(String),
    /// Touch event with one or more points.
    Touch {
        phase: TouchPhase,
        points: Vec<TouchPoint>,
    },
    /// Hardware button press or release.
    Button {
        name: ButtonName,
        direction: Direction,
    },
    /// Keyboard event by USB HID code.
    Key { code: u32, direction: Direction },
    /// Toggle periodic `fps_report` output.
    Fps(bool),
    /// Orderly process termination.
    Shutdown,
    /// Anything that failed to parse; carries the offending line.
    Unknown(String),
}

// ── Parsing ──────────────────────────────────────────────────────

/// Parse one input line. Returns `None` for blank lines.
pub fn parse_line(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    let parsed = match head {
        "rotate" if !rest.is_empty() => Some(Command::Rotate(rest.to_string())),
        "touch" => parse_touch(rest),
        "button" => parse_button(rest),
        "key" => parse_key(rest),
        "fps" => match rest {
            "true" => Some(Command::Fps(true)),
            "false" => Some(Command::Fps(false)),
            _ => None,
        },
        "shutdown" if rest.is_empty() => Some(Command::Shutdown),
        _ => None,
    };

    Some(parsed.unwrap_or_else(|| {
        warn!("{}", crate::error::ServerError::CommandParse(line.to_string()));
        Command::Unknown(line.to_string())
    }))
}

fn parse_touch(rest: &str) -> Option<Command> {
    let mut tokens = rest.split_whitespace();
    let phase = TouchPhase::parse(tokens.next()?)?;
    let points: Vec<TouchPoint> = tokens.map(TouchPoint::parse).collect::<Option<_>>()?;
    if points.is_empty() {
        return None;
    }
    Some(Command::Touch { phase, points })
}

fn parse_button(rest: &str) -> Option<Command> {
    let (name, direction) = rest.split_once(',')?;
    Some(Command::Button {
        name: ButtonName::parse(name)?,
        direction: Direction::parse(direction)?,
    })
}

fn parse_key(rest: &str) -> Option<Command> {
    let (code, direction) = rest.split_once(',')?;
    Some(Command::Key {
        code: code.parse().ok()?,
        direction: Direction::parse(direction)?,
    })
}

// ── Reader ───────────────────────────────────────────────────────

/// Line reader that feeds parsed commands into a channel.
pub struct CommandReader;

impl CommandReader {
    /// Spawn the reader over any async byte source (stdin in
    /// production, an in-memory pipe in tests).
    ///
    /// EOF ends the task without shutting the process down; only an
    /// explicit `shutdown` command or a signal terminates the server.
    pub fn spawn<R>(input: R, tx: mpsc::Sender<Command>) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(input).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(command) = parse_line(&line) {
                            if tx.send(command).await.is_err() {
                                debug!("command channel closed; reader exiting");
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("stdin closed; command reader exiting");
                        break;
                    }
                    Err(e) => {
                        warn!("stdin read error: {e}");
                        break;
                    }
                }
            }
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
