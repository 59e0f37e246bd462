use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use thiserror::Error;

use crate::recorder::unquote_bytes;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to read keystrokes.log: {0}")]
    ReadKeystrokes(#[source] std::io::Error),

    #[error("failed to write commands.log: {0}")]
    WriteCommands(#[source] std::io::Error),
}

/// A committed command line recovered from the keystroke stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Milliseconds since session start of the chunk that committed the line.
    pub at_ms: u64,
    pub text: String,
}

/// Extract shell command lines from `keystrokes.log` into `commands.log`.
///
/// Replays the recorded input through a minimal line-editor model: printable
/// ASCII accumulates, CR/LF commits the line, BS/DEL erases one character,
/// Ctrl-C and Ctrl-U erase the line. The output file gets one
/// `<ms> <text>` line per committed command and is demoted to owner
/// read-only when done.
pub fn extract_commands(session_dir: &Path) -> Result<usize, ExtractError> {
    let keystrokes =
        std::fs::read_to_string(session_dir.join("keystrokes.log")).map_err(ExtractError::ReadKeystrokes)?;

    let commands = replay_keystrokes(&keystrokes);

    let commands_path = session_dir.join("commands.log");
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(&commands_path).map_err(ExtractError::WriteCommands)?;
    for command in &commands {
        writeln!(file, "{} {}", command.at_ms, command.text).map_err(ExtractError::WriteCommands)?;
    }
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&commands_path, std::fs::Permissions::from_mode(0o400))
        {
            tracing::warn!(error = %e, "could not demote commands.log permissions");
        }
    }

    tracing::info!(count = commands.len(), "extracted commands from keystroke log");
    Ok(commands.len())
}

/// Replay a `keystrokes.log` body through the line-editor model.
///
/// Malformed lines are skipped; the log may legitimately end mid-line after
/// a crash.
pub fn replay_keystrokes(keystrokes: &str) -> Vec<Command> {
    let mut commands = Vec::new();
    let mut buffer = String::new();

    for line in keystrokes.lines() {
        let Some((ms, chunk)) = parse_keystroke_line(line) else {
            continue;
        };
        for byte in chunk {
            match byte {
                b'\r' | b'\n' => {
                    if !buffer.is_empty() {
                        commands.push(Command {
                            at_ms: ms,
                            text: std::mem::take(&mut buffer),
                        });
                    }
                }
                // Backspace and DEL erase one character.
                0x08 | 0x7f => {
                    buffer.pop();
                }
                // Ctrl-C and Ctrl-U abandon the line.
                0x03 | 0x15 => buffer.clear(),
                0x20..=0x7e => buffer.push(byte as char),
                _ => {}
            }
        }
    }

    commands
}

/// Parse one `<ms> <quoted_bytes>` keystroke line.
fn parse_keystroke_line(line: &str) -> Option<(u64, Vec<u8>)> {
    let (ms, quoted) = line.split_once(' ')?;
    let ms = ms.parse().ok()?;
    let bytes = unquote_bytes(quoted)?;
    Some((ms, bytes))
}
