use std::fmt;

use regex::Regex;

/// Binary operators shared by both precedence layers. Negation is kept
/// separate since it is the only unary operator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Op {
    And,
    Or,
    Xor,
}

/// Binds the enclosed regexes to one of the three string dimensions of an
/// event: the event name (`%`, or no prefix), the sender name (`$`), or the
/// sender's group list (`#`, true iff at least one group matches).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Matcher {
    Event,
    Sender,
    Group,
}

impl Matcher {
    fn symbol(&self) -> char {
        match self {
            Matcher::Event => '%',
            Matcher::Sender => '$',
            Matcher::Group => '#',
        }
    }
}

/// A regex leaf. Carries both the source text and the compiled form; the
/// compiled regex is anchored so that evaluation is a full-string match.
#[derive(Debug, Clone)]
pub struct RegexNode {
    pub src: String,
    pub re: Regex,
}

impl RegexNode {
    pub fn new(src: &str) -> Result<Self, regex::Error> {
        let re = Regex::new(&format!("^(?:{})$", src))?;
        Ok(RegexNode {
            src: src.to_string(),
            re,
        })
    }
}

// Two nodes are the same filter iff they were written the same way.
impl PartialEq for RegexNode {
    fn eq(&self, other: &Self) -> bool {
        self.src == other.src
    }
}

impl Eq for RegexNode {}

/// A parsed filter expression.
///
/// `Group` keeps the shape produced by the parser: a head expression followed
/// by (operator, operand) pairs, evaluated left to right. Precedence is
/// resolved at parse time, so a group never mixes operators of different
/// binding strength.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Expr {
    /// The absent filter; matches everything.
    #[default]
    Nil,
    Regex(RegexNode),
    Not(Box<Expr>),
    Match(Matcher, Box<Expr>),
    Group {
        first: Box<Expr>,
        rest: Vec<(Op, Expr)>,
    },
}

/// The strings an expression is evaluated against. `sender` is `None` in the
/// two-argument form, where sender-name matchers are vacuously true.
struct Scope<'a> {
    subject: &'a str,
    sender: Option<&'a str>,
    groups: &'a [String],
}

impl Expr {
    /// Evaluates the expression over an event name, a sender name, and the
    /// sender's groups. Used to test a subscription against an event.
    pub fn matches(&self, event: &str, sender: &str, groups: &[String]) -> bool {
        self.eval(
            &Scope {
                subject: event,
                sender: Some(sender),
                groups,
            },
            Matcher::Event,
        )
    }

    /// The two-argument form: evaluates over a recipient's name and groups
    /// only. Used to test an event's embedded filter against a recipient;
    /// sender-name matchers always hold here.
    pub fn matches_target(&self, name: &str, groups: &[String]) -> bool {
        self.eval(
            &Scope {
                subject: name,
                sender: None,
                groups,
            },
            Matcher::Event,
        )
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Expr::Nil)
    }

    fn eval(&self, scope: &Scope, matcher: Matcher) -> bool {
        match self {
            Expr::Nil => true,
            Expr::Regex(node) => match matcher {
                Matcher::Event => node.re.is_match(scope.subject),
                Matcher::Sender => scope.sender.map_or(true, |s| node.re.is_match(s)),
                Matcher::Group => scope.groups.iter().any(|g| node.re.is_match(g)),
            },
            Expr::Not(inner) => !inner.eval(scope, matcher),
            Expr::Match(m, inner) => inner.eval(scope, *m),
            Expr::Group { first, rest } => {
                let mut result = first.eval(scope, matcher);
                for (op, operand) in rest {
                    let next = operand.eval(scope, matcher);
                    result = match op {
                        Op::And => result && next,
                        Op::Or => result || next,
                        Op::Xor => result != next,
                    };
                }
                result
            }
        }
    }

    fn fmt_layer(&self, f: &mut fmt::Formatter<'_>, inside_matcher: bool) -> fmt::Result {
        match self {
            Expr::Nil => write!(f, "<NIL>"),
            Expr::Regex(node) => write!(f, "'{}'", node.src),
            Expr::Not(inner) => {
                write!(f, "{}", if inside_matcher { '~' } else { '!' })?;
                inner.fmt_layer(f, inside_matcher)
            }
            Expr::Match(m, inner) => {
                write!(f, "{}", m.symbol())?;
                inner.fmt_layer(f, true)
            }
            Expr::Group { first, rest } => {
                if rest.is_empty() {
                    return first.fmt_layer(f, inside_matcher);
                }
                write!(f, "(")?;
                first.fmt_layer(f, inside_matcher)?;
                for (op, operand) in rest {
                    let sym = match (op, inside_matcher) {
                        (Op::And, true) => "&",
                        (Op::Or, true) => "|",
                        (Op::Xor, true) => "^",
                        (Op::And, false) => "&&",
                        (Op::Or, false) => "||",
                        (Op::Xor, false) => "^^",
                    };
                    write!(f, "{}", sym)?;
                    operand.fmt_layer(f, inside_matcher)?;
                }
                write!(f, ")")
            }
        }
    }
}

// The printed form of any parsed expression reparses to an equivalent AST.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_layer(f, false)
    }
}
