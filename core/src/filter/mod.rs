//! The Simple Filter Expression (SFE) mini-language.
//!
//! An SFE constrains which events a subscription selects, over three string
//! dimensions: the event name, the sender name, and the sender's groups. It is
//! a regex-of-regexes language with two precedence layers. Inside a matcher,
//! single-symbol operators (`~ ^ & |`, strongest first) combine regexes that
//! all test the matcher's dimension. Outside, the compound operators
//! (`! ^^ && ||`, same ordering, single-symbol spellings accepted) combine
//! matcher expressions, and adjacent terms are implicitly AND-ed:
//!
//! ```text
//! subscribe $dev1 & %EVT_.*      events named EVT_* sent by dev1
//! subscribe #sensors & ~'EVT_RAW'  anything but EVT_RAW from the sensors group
//! ```
//!
//! A regex is a bare token free of reserved characters or a single-quoted
//! literal (no escaping; a single quote is not expressible). Every regex node
//! keeps its source text alongside the compiled, anchored form.

pub mod ast;
#[allow(clippy::upper_case_acronyms)]
mod parser;

use thiserror::Error;

pub use ast::{Expr, Matcher, Op, RegexNode};

/// Errors produced when parsing a filter expression. Grammar failures and
/// regex-compilation failures are distinguishable at the caller, which maps
/// them to different wire error codes.
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("invalid filter syntax")]
    InvalidFormat,

    #[error("invalid regex in filter")]
    InvalidRegex {
        #[from]
        source: regex::Error,
    },
}

/// Parses a filter expression string.
pub fn parse(input: &str) -> Result<Expr, FilterError> {
    parser::parse(input)
}
