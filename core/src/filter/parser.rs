use super::ast::{Expr, Matcher, Op, RegexNode};
use super::FilterError;

use pest::iterators::Pair;
use pest::Parser;

#[derive(Parser)]
#[grammar = "filter/grammar.pest"]
pub struct FilterParser;

/// Parses a filter expression into its AST, compiling every regex leaf.
///
/// Grammar violations map to [`FilterError::InvalidFormat`]; a syntactically
/// valid expression containing an unparseable regex maps to
/// [`FilterError::InvalidRegex`]. Callers rely on the distinction.
pub(crate) fn parse(input: &str) -> Result<Expr, FilterError> {
    let mut pairs =
        FilterParser::parse(Rule::filter, input).map_err(|_| FilterError::InvalidFormat)?;
    let filter = pairs.next().ok_or(FilterError::InvalidFormat)?;
    let expr = filter
        .into_inner()
        .next()
        .ok_or(FilterError::InvalidFormat)?;
    build_expr(expr)
}

fn build_expr(pair: Pair<Rule>) -> Result<Expr, FilterError> {
    let inner = pair.into_inner().next().ok_or(FilterError::InvalidFormat)?;
    build_group(inner)
}

// All six group rules share the same shape: a head operand followed by
// (operator, operand) pairs. A missing operator pair is the compound layer's
// implicit AND.
fn build_group(pair: Pair<Rule>) -> Result<Expr, FilterError> {
    let mut inner = pair.into_inner();
    let first = build_operand(inner.next().ok_or(FilterError::InvalidFormat)?)?;
    let mut rest = Vec::new();
    let mut pending = None;
    for p in inner {
        match p.as_rule() {
            Rule::or_op | Rule::srp_or_op => pending = Some(Op::Or),
            Rule::and_op | Rule::srp_and_op => pending = Some(Op::And),
            Rule::xor_op | Rule::srp_xor_op => pending = Some(Op::Xor),
            _ => rest.push((pending.take().unwrap_or(Op::And), build_operand(p)?)),
        }
    }
    if rest.is_empty() {
        Ok(first)
    } else {
        Ok(Expr::Group {
            first: Box::new(first),
            rest,
        })
    }
}

fn build_operand(pair: Pair<Rule>) -> Result<Expr, FilterError> {
    match pair.as_rule() {
        Rule::and_group | Rule::xor_group | Rule::srp_and | Rule::srp_xor | Rule::srp_or => {
            build_group(pair)
        }
        Rule::primary | Rule::srp_primary => build_primary(pair),
        _ => Err(FilterError::InvalidFormat),
    }
}

fn build_primary(pair: Pair<Rule>) -> Result<Expr, FilterError> {
    let mut inner = pair.into_inner();
    let first = inner.next().ok_or(FilterError::InvalidFormat)?;
    match first.as_rule() {
        // parenthesized sub-expression of either layer
        Rule::expr => build_expr(first),
        Rule::srp_or => build_group(first),
        Rule::not_op | Rule::srp_not_op => {
            let operand = inner.next().ok_or(FilterError::InvalidFormat)?;
            Ok(Expr::Not(Box::new(build_primary(operand)?)))
        }
        Rule::prefixed => build_prefixed(first),
        Rule::regex => build_regex(first),
        _ => Err(FilterError::InvalidFormat),
    }
}

fn build_prefixed(pair: Pair<Rule>) -> Result<Expr, FilterError> {
    let mut inner = pair.into_inner();
    let first = inner.next().ok_or(FilterError::InvalidFormat)?;
    let (matcher, body) = match first.as_rule() {
        Rule::matcher_sym => {
            let matcher = match first.as_str() {
                "$" => Matcher::Sender,
                "#" => Matcher::Group,
                _ => Matcher::Event,
            };
            (matcher, inner.next().ok_or(FilterError::InvalidFormat)?)
        }
        _ => (Matcher::Event, first),
    };
    Ok(Expr::Match(matcher, Box::new(build_group(body)?)))
}

fn build_regex(pair: Pair<Rule>) -> Result<Expr, FilterError> {
    let token = pair.into_inner().next().ok_or(FilterError::InvalidFormat)?;
    let src = match token.as_rule() {
        Rule::quoted => {
            let s = token.as_str();
            &s[1..s.len() - 1]
        }
        _ => token.as_str(),
    };
    Ok(Expr::Regex(RegexNode::new(src)?))
}
