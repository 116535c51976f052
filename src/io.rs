//! Trace files: a line-per-command script replayed against a [`VMManager`].
//!
//! ```text
//! # comment
//! map 0x00 10 rw
//! write 0x000100 0xaa
//! read 0x000100
//! translate 0x000100 w
//! unmap 0x00
//! stats
//! reset
//! ```

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use log::debug;

use crate::error::{Access, TraceError, VmError};
use crate::page_table::PteFlags;
use crate::stats::Statistics;
use crate::vm_manager::VMManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Map {
        vpage: usize,
        frame: usize,
        flags: PteFlags,
    },
    Unmap {
        vpage: usize,
    },
    Write {
        va: u32,
        value: u8,
    },
    Read {
        va: u32,
    },
    Translate {
        va: u32,
        access: Access,
    },
    Stats,
    Reset,
}

/// What a single command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Done,
    Value(u8),
    Physical(usize),
    Stats(Statistics),
    Failed(VmError),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Done => f.write_str("ok"),
            Outcome::Value(value) => write!(f, "{value:#04x}"),
            Outcome::Physical(pa) => write!(f, "{pa:#07x}"),
            Outcome::Stats(stats) => write!(
                f,
                "faults={} reads={} writes={} fails={} frames={}/{}",
                stats.page_faults,
                stats.reads,
                stats.writes,
                stats.translation_failures,
                stats.frames_used,
                stats.frames_total
            ),
            Outcome::Failed(err) => write!(f, "error: {}", err.kind()),
        }
    }
}

#[derive(Debug, Default)]
pub struct Trace {
    /// Commands with the 1-based line they came from.
    pub commands: Vec<(usize, Command)>,
}

impl Trace {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TraceError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|source| TraceError::Read {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, TraceError> {
        let mut commands = Vec::new();
        for (idx, raw) in content.lines().enumerate() {
            let line = idx + 1;
            let text = raw.split('#').next().unwrap_or_default().trim();
            if text.is_empty() {
                continue;
            }
            commands.push((line, Self::parse_line(line, text)?));
        }
        Ok(Trace { commands })
    }

    fn parse_line(line: usize, text: &str) -> Result<Command, TraceError> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let (name, args) = tokens
            .split_first()
            .ok_or_else(|| TraceError::parse(line, "empty command"))?;

        let expect = |count: usize| -> Result<(), TraceError> {
            if args.len() != count {
                return Err(TraceError::parse(
                    line,
                    format!("`{name}` takes {count} argument(s), got {}", args.len()),
                ));
            }
            Ok(())
        };

        let command = match name.to_ascii_lowercase().as_str() {
            "map" => {
                expect(3)?;
                Command::Map {
                    vpage: parse_number(line, args[0])?,
                    frame: parse_number(line, args[1])?,
                    flags: parse_flags(line, args[2])?,
                }
            }
            "unmap" => {
                expect(1)?;
                Command::Unmap {
                    vpage: parse_number(line, args[0])?,
                }
            }
            "write" => {
                expect(2)?;
                Command::Write {
                    va: parse_number(line, args[0])?,
                    value: parse_number(line, args[1])?,
                }
            }
            "read" => {
                expect(1)?;
                Command::Read {
                    va: parse_number(line, args[0])?,
                }
            }
            "translate" => {
                let access = match args {
                    [_] => Access::Read,
                    [_, mode] if mode.eq_ignore_ascii_case("w") => Access::Write,
                    [_, mode] if mode.eq_ignore_ascii_case("r") => Access::Read,
                    _ => {
                        return Err(TraceError::parse(
                            line,
                            "usage: translate <vaddr> [r|w]",
                        ));
                    }
                };
                Command::Translate {
                    va: parse_number(line, args[0])?,
                    access,
                }
            }
            "stats" => {
                expect(0)?;
                Command::Stats
            }
            "reset" => {
                expect(0)?;
                Command::Reset
            }
            other => {
                return Err(TraceError::parse(line, format!("unknown command `{other}`")));
            }
        };
        Ok(command)
    }

    /// Run every command in order. A failing command does not stop the replay.
    pub fn replay(&self, vm: &mut VMManager) -> Vec<Outcome> {
        self.commands
            .iter()
            .map(|&(line, command)| {
                let outcome = execute(vm, command);
                if let Outcome::Failed(err) = &outcome {
                    debug!("line {line}: {err}");
                }
                outcome
            })
            .collect()
    }
}

pub fn execute(vm: &mut VMManager, command: Command) -> Outcome {
    let result = match command {
        Command::Map { vpage, frame, flags } => vm.map_page(vpage, frame, flags).map(|_| Outcome::Done),
        Command::Unmap { vpage } => vm.unmap_page(vpage).map(|_| Outcome::Done),
        Command::Write { va, value } => vm.write_vmem(va, value).map(|_| Outcome::Done),
        Command::Read { va } => vm.read_vmem(va).map(Outcome::Value),
        Command::Translate { va, access } => vm.translate(va, access).map(Outcome::Physical),
        Command::Stats => Ok(Outcome::Stats(vm.statistics_snapshot())),
        Command::Reset => {
            vm.init();
            Ok(Outcome::Done)
        }
    };
    result.unwrap_or_else(Outcome::Failed)
}

fn parse_number<T: TryFrom<u64>>(line: usize, token: &str) -> Result<T, TraceError> {
    let parsed = match token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => token.parse::<u64>(),
    };
    parsed
        .ok()
        .and_then(|value| T::try_from(value).ok())
        .ok_or_else(|| TraceError::parse(line, format!("invalid number `{token}`")))
}

fn parse_flags(line: usize, token: &str) -> Result<PteFlags, TraceError> {
    if token == "-" {
        return Ok(PteFlags::empty());
    }
    token
        .chars()
        .try_fold(PteFlags::empty(), |flags, c| match c.to_ascii_lowercase() {
            'r' => Ok(flags | PteFlags::READ),
            'w' => Ok(flags | PteFlags::WRITE),
            _ => Err(TraceError::parse(
                line,
                format!("invalid permissions `{token}` (expected r, w, rw or -)"),
            )),
        })
}

/// Write one outcome per line to `path`, or to stdout when `path` is `None`.
pub fn write_results<P: AsRef<Path>>(path: Option<P>, results: &[Outcome]) -> Result<(), TraceError> {
    let mut content = String::new();
    for outcome in results {
        content.push_str(&outcome.to_string());
        content.push('\n');
    }
    match path {
        Some(path) => fs::write(path.as_ref(), content)?,
        None => std::io::stdout().lock().write_all(content.as_bytes())?,
    }
    Ok(())
}
