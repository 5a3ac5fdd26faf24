//! Parser for active-phase command lines.

use crate::filter::{self, Expr, FilterError};

use thiserror::Error;

/// Command parse failures. A command whose embedded filter fails regex
/// compilation is reported separately so the connection can classify it as a
/// regex violation rather than a malformed command.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("malformed command")]
    Malformed,

    #[error("malformed regex in command")]
    Regex,
}

impl From<FilterError> for CommandError {
    fn from(err: FilterError) -> Self {
        match err {
            FilterError::InvalidFormat => CommandError::Malformed,
            FilterError::InvalidRegex { .. } => CommandError::Regex,
        }
    }
}

/// One parsed command. Sizes and identifiers are already validated; embedded
/// filters are parsed (and their regexes compiled) eagerly.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Subscribe { expr: Expr },
    Unsubscribe { n: usize },
    Trigger { evt: String, expr: Option<Expr> },
    TriggerBinary { size: usize, evt: String, expr: Option<Expr> },
    TriggerEmpty { evt: String, expr: Option<Expr> },
    TriggerCached { evt: String, expr_id: usize },
    TriggerCachedBinary { size: usize, evt: String, expr_id: usize },
    TriggerCachedEmpty { evt: String, expr_id: usize },
    TriggerCachedCachedData { evt: String, expr_id: usize, data_id: usize },
    Pause,
    Resume,
    Alive,
    KillMe,
    Echo { state: Option<bool> },
    Execute { line: String },
    ExecuteScript { size: usize },
    ExecuteCached { id: usize },
    Store { line: Vec<u8> },
    StoreBinary { size: usize },
    Release { id: usize },
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn identifier(token: &str) -> Result<String, CommandError> {
    if is_identifier(token) {
        Ok(token.to_string())
    } else {
        Err(CommandError::Malformed)
    }
}

fn number(token: &str) -> Result<usize, CommandError> {
    token.parse().map_err(|_| CommandError::Malformed)
}

fn no_args(rest: &str) -> Result<(), CommandError> {
    if rest.trim().is_empty() {
        Ok(())
    } else {
        Err(CommandError::Malformed)
    }
}

// `<evt> [expr]` argument shape shared by the plain trigger commands.
fn evt_and_filter(rest: &str) -> Result<(String, Option<Expr>), CommandError> {
    let (evt, rest) = split_word(rest);
    let evt = identifier(evt)?;
    let expr = if rest.trim().is_empty() {
        None
    } else {
        Some(filter::parse(rest)?)
    };
    Ok((evt, expr))
}

// `<evt> <id>` argument shape shared by the cached trigger commands.
fn evt_and_id(rest: &str) -> Result<(String, usize), CommandError> {
    let (evt, rest) = split_word(rest);
    let evt = identifier(evt)?;
    let (id, rest) = split_word(rest);
    no_args(rest)?;
    Ok((evt, number(id)?))
}

// Remainder-of-line payload for `store` and `execute` (leading whitespace
// already skipped by split_word; must be non-empty).
fn remainder(rest: &str) -> Result<&str, CommandError> {
    if rest.is_empty() {
        Err(CommandError::Malformed)
    } else {
        Ok(rest)
    }
}

/// Parses a single command line.
///
/// Dispatch is on the first whitespace-delimited word, so short aliases never
/// shadow longer command names (`r` is `resume`, `release` is `release`).
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let (word, rest) = split_word(line);
    match word {
        "subscribe" | "subs" | "s10n" | "s" => Ok(Command::Subscribe {
            expr: filter::parse(remainder(rest)?)?,
        }),
        "unsubscribe" | "unsubs" | "usubs" | "us10n" | "us" => {
            let (n, rest) = split_word(rest);
            no_args(rest)?;
            Ok(Command::Unsubscribe { n: number(n)? })
        }
        "trigger" | "trig" | "t" => {
            let (evt, expr) = evt_and_filter(rest)?;
            Ok(Command::Trigger { evt, expr })
        }
        "triggerb" | "trigb" | "tb" => {
            let (size, rest) = split_word(rest);
            let (evt, expr) = evt_and_filter(rest)?;
            Ok(Command::TriggerBinary {
                size: number(size)?,
                evt,
                expr,
            })
        }
        "triggere" | "trige" | "te" | "notify" | "notif" | "n" => {
            let (evt, expr) = evt_and_filter(rest)?;
            Ok(Command::TriggerEmpty { evt, expr })
        }
        "triggerc" | "trigc" | "tc" => {
            let (evt, expr_id) = evt_and_id(rest)?;
            Ok(Command::TriggerCached { evt, expr_id })
        }
        "triggercb" | "trigcb" | "tcb" => {
            let (size, rest) = split_word(rest);
            let (evt, expr_id) = evt_and_id(rest)?;
            Ok(Command::TriggerCachedBinary {
                size: number(size)?,
                evt,
                expr_id,
            })
        }
        "triggerce" | "trigce" | "tce" => {
            let (evt, expr_id) = evt_and_id(rest)?;
            Ok(Command::TriggerCachedEmpty { evt, expr_id })
        }
        "triggerccd" | "trigccd" | "tccd" => {
            let (evt, rest) = split_word(rest);
            let evt = identifier(evt)?;
            let (expr_id, rest) = split_word(rest);
            let (data_id, rest) = split_word(rest);
            no_args(rest)?;
            Ok(Command::TriggerCachedCachedData {
                evt,
                expr_id: number(expr_id)?,
                data_id: number(data_id)?,
            })
        }
        "pause" | "p" => {
            no_args(rest)?;
            Ok(Command::Pause)
        }
        "resume" | "r" => {
            no_args(rest)?;
            Ok(Command::Resume)
        }
        "alive" | "idle" | "a" | "i" => {
            no_args(rest)?;
            Ok(Command::Alive)
        }
        "kill-me" | "k" => {
            no_args(rest)?;
            Ok(Command::KillMe)
        }
        "echo" | "e" => {
            let (state, rest) = split_word(rest);
            no_args(rest)?;
            let state = match state {
                "" => None,
                "true" => Some(true),
                "false" => Some(false),
                _ => return Err(CommandError::Malformed),
            };
            Ok(Command::Echo { state })
        }
        "execute" | "exec" | "x" => Ok(Command::Execute {
            line: remainder(rest)?.to_string(),
        }),
        "script" | "sc" => {
            let (size, rest) = split_word(rest);
            no_args(rest)?;
            Ok(Command::ExecuteScript { size: number(size)? })
        }
        "executec" | "execc" | "xc" => {
            let (id, rest) = split_word(rest);
            no_args(rest)?;
            Ok(Command::ExecuteCached { id: number(id)? })
        }
        "store" | "st" => Ok(Command::Store {
            line: remainder(rest)?.as_bytes().to_vec(),
        }),
        "storeb" | "stb" => {
            let (size, rest) = split_word(rest);
            no_args(rest)?;
            Ok(Command::StoreBinary { size: number(size)? })
        }
        "release" | "rl" => {
            let (id, rest) = split_word(rest);
            no_args(rest)?;
            Ok(Command::Release { id: number(id)? })
        }
        _ => Err(CommandError::Malformed),
    }
}
