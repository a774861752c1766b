//! Attribute path extraction.
//!
//! Implements the subset of Kubernetes JSONPath used by pool selectors, e.g.
//! `{.spec.providerID}`, `{.metadata.labels.node\.kubernetes\.io/role}` or
//! `{.status.conditions[?(@.type=="Ready")].status}`.
//! Paths are parsed once when templates are loaded; extraction against a
//! node's JSON form never fails, missing members simply yield no values.

use crate::error::PathSyntaxError;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// Object member
    Field(String),
    /// Array element, negative values count from the end
    Index(i64),
    /// Every member of an object or element of an array
    Wildcard,
    /// Array elements from `start` up to `end` (exclusive), every `step`
    Slice {
        start: Option<i64>,
        end: Option<i64>,
        step: usize,
    },
    /// Several names or indices, `['a','b']` or `[0,2]`
    Union(Vec<Segment>),
    /// Array elements for which the filter holds
    Filter(Filter),
}

/// `?(@.path)` or `?(<operand> <op> <operand>)`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Filter {
    left: Operand,
    comparison: Option<(Comparison, Operand)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operand {
    /// Path relative to the element under test (`@`)
    Current(Vec<Segment>),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

// Two character operators first so `<=` is not read as `<`.
const COMPARISONS: [(&str, Comparison); 6] = [
    ("==", Comparison::Eq),
    ("!=", Comparison::Ne),
    ("<=", Comparison::Le),
    (">=", Comparison::Ge),
    ("<", Comparison::Lt),
    (">", Comparison::Gt),
];

/// Compiled attribute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    source: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parses a path expression.
    ///
    /// Accepts an optional single `{ ... }` wrapper and an optional leading
    /// `$`, followed by `.field`, `.*`, `[N]`, `[*]`, `['key']`, slices
    /// `[start:end:step]`, unions `['a','b']` / `[0,2]` and filters
    /// `[?(@.field)]` / `[?(@.field == 'value')]` with `==`, `!=`, `<`, `<=`,
    /// `>` and `>=`. A backslash escapes the next character inside a field
    /// name.
    ///
    /// # Errors
    ///
    /// Returns [`PathSyntaxError`] for unbalanced braces, text outside the
    /// expression, empty field names, unterminated brackets or quotes,
    /// invalid indices, slices or filters and recursive descent (`..`).
    pub fn parse(expr: &str) -> Result<Self, PathSyntaxError> {
        let inner = unwrap_braces(expr)?;
        let segments = parse_segments(expr, inner)?;
        Ok(Self {
            source: expr.to_string(),
            segments,
        })
    }

    /// Path expression as written in the configuration.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Resolves the path against `root`.
    ///
    /// Returns every value reached by the path. Missing members, type
    /// mismatches and out-of-range indices contribute nothing; `null`
    /// values are treated as missing.
    #[must_use]
    pub fn extract<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut values = select(&self.segments, root);
        values.retain(|value| !value.is_null());
        values
    }
}

impl FromStr for JsonPath {
    type Err = PathSyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn select<'a>(segments: &[Segment], root: &'a Value) -> Vec<&'a Value> {
    let mut current = vec![root];

    for segment in segments {
        let mut next = Vec::new();
        for value in current {
            apply(segment, value, &mut next);
        }
        if next.is_empty() {
            return next;
        }
        current = next;
    }

    current
}

fn apply<'a>(segment: &Segment, value: &'a Value, out: &mut Vec<&'a Value>) {
    match (segment, value) {
        (Segment::Field(name), Value::Object(map)) => out.extend(map.get(name)),
        (Segment::Index(index), Value::Array(items)) => {
            out.extend(resolve_index(*index, items.len()).and_then(|i| items.get(i)));
        }
        (Segment::Wildcard, Value::Object(map)) => out.extend(map.values()),
        (Segment::Wildcard, Value::Array(items)) => out.extend(items.iter()),
        (Segment::Slice { start, end, step }, Value::Array(items)) => {
            let (from, to) = slice_bounds(*start, *end, items.len());
            out.extend(items.iter().take(to).skip(from).step_by(*step));
        }
        (Segment::Union(members), _) => {
            for member in members {
                apply(member, value, out);
            }
        }
        (Segment::Filter(filter), Value::Array(items)) => {
            out.extend(items.iter().filter(|item| filter.holds(item)));
        }
        _ => {}
    }
}

impl Filter {
    fn holds(&self, item: &Value) -> bool {
        let lefts = self.left.resolve(item);
        match &self.comparison {
            None => !lefts.is_empty(),
            Some((comparison, right)) => {
                let rights = right.resolve(item);
                lefts
                    .iter()
                    .any(|left| rights.iter().any(|right| comparison.holds(left, right)))
            }
        }
    }
}

impl Operand {
    fn resolve<'a>(&'a self, item: &'a Value) -> Vec<&'a Value> {
        match self {
            Self::Current(segments) => {
                let mut values = select(segments, item);
                values.retain(|value| !value.is_null());
                values
            }
            Self::Literal(value) => vec![value],
        }
    }
}

impl Comparison {
    fn holds(self, left: &Value, right: &Value) -> bool {
        let ordering = match (left, right) {
            (Value::Number(a), Value::Number(b)) => a
                .as_f64()
                .zip(b.as_f64())
                .and_then(|(a, b)| a.partial_cmp(&b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (a, b) => (a == b).then_some(Ordering::Equal),
        };
        match self {
            Self::Eq => ordering == Some(Ordering::Equal),
            Self::Ne => ordering != Some(Ordering::Equal),
            Self::Lt => ordering == Some(Ordering::Less),
            Self::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            Self::Gt => ordering == Some(Ordering::Greater),
            Self::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        }
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    if index >= 0 {
        usize::try_from(index).ok()
    } else {
        len.checked_sub(usize::try_from(index.unsigned_abs()).ok()?)
    }
}

/// Clamps slice bounds into `0..=len`; negative bounds count from the end.
fn slice_bounds(start: Option<i64>, end: Option<i64>, len: usize) -> (usize, usize) {
    let clamp = |bound: i64| {
        if bound < 0 {
            len.saturating_sub(usize::try_from(bound.unsigned_abs()).unwrap_or(usize::MAX))
        } else {
            usize::try_from(bound).map_or(len, |bound| bound.min(len))
        }
    };
    (start.map_or(0, clamp), end.map_or(len, clamp))
}

fn unwrap_braces(expr: &str) -> Result<&str, PathSyntaxError> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(PathSyntaxError::new(expr, "path is empty"));
    }

    let inner = match trimmed.strip_prefix('{') {
        Some(rest) => rest.strip_suffix('}').ok_or_else(|| {
            PathSyntaxError::new(expr, "unbalanced braces or text outside the expression")
        })?,
        None => trimmed,
    };

    if inner.contains(['{', '}']) {
        return Err(PathSyntaxError::new(
            expr,
            "only a single {...} expression is supported",
        ));
    }

    Ok(inner)
}

fn parse_segments(expr: &str, inner: &str) -> Result<Vec<Segment>, PathSyntaxError> {
    let body = inner.trim();
    if body.is_empty() {
        return Err(PathSyntaxError::new(expr, "expression is empty"));
    }

    let body = body.strip_prefix('$').unwrap_or(body);
    if body.is_empty() || body == "." {
        return Ok(Vec::new());
    }

    let chars: Vec<char> = body.chars().collect();
    parse_chain(expr, &chars)
}

fn parse_chain(expr: &str, chars: &[char]) -> Result<Vec<Segment>, PathSyntaxError> {
    let mut segments = Vec::new();
    let mut pos = 0;

    while let Some(&c) = chars.get(pos) {
        match c {
            '.' => {
                pos += 1;
                if chars.get(pos) == Some(&'.') {
                    return Err(PathSyntaxError::new(
                        expr,
                        "recursive descent '..' is not supported",
                    ));
                }
                let (name, next) = read_field(expr, chars, pos)?;
                if name.is_empty() {
                    return Err(PathSyntaxError::new(
                        expr,
                        format!("empty field name at offset {pos}"),
                    ));
                }
                // An unescaped lone `*` selects everything
                let wildcard = name == "*" && next == pos + 1;
                segments.push(if wildcard {
                    Segment::Wildcard
                } else {
                    Segment::Field(name)
                });
                pos = next;
            }
            '[' => {
                let (segment, next) = read_bracket(expr, chars, pos + 1)?;
                segments.push(segment);
                pos = next;
            }
            other => {
                return Err(PathSyntaxError::new(
                    expr,
                    format!("unexpected character {other:?} at offset {pos}, expected '.' or '['"),
                ));
            }
        }
    }

    Ok(segments)
}

fn read_field(expr: &str, chars: &[char], start: usize) -> Result<(String, usize), PathSyntaxError> {
    let mut name = String::new();
    let mut pos = start;

    while let Some(&c) = chars.get(pos) {
        match c {
            '\\' => {
                let escaped = chars.get(pos + 1).ok_or_else(|| {
                    PathSyntaxError::new(expr, "dangling escape at end of path")
                })?;
                name.push(*escaped);
                pos += 2;
            }
            '.' | '[' => break,
            _ => {
                name.push(c);
                pos += 1;
            }
        }
    }

    Ok((name, pos))
}

fn read_bracket(expr: &str, chars: &[char], start: usize) -> Result<(Segment, usize), PathSyntaxError> {
    let close = find_close(chars, start).ok_or_else(|| PathSyntaxError::new(expr, "unterminated '['"))?;
    let content: String = chars.get(start..close).unwrap_or_default().iter().collect();
    Ok((parse_bracket(expr, content.trim())?, close + 1))
}

/// Position of the `]` closing a bracket, skipping quoted text and parentheses.
fn find_close(chars: &[char], start: usize) -> Option<usize> {
    let mut quote = None;
    let mut depth = 0usize;
    let mut pos = start;

    while let Some(&c) = chars.get(pos) {
        match (quote, c) {
            (Some(_), '\\') => pos += 1,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ']') if depth == 0 => return Some(pos),
            (None, _) => {}
        }
        pos += 1;
    }

    None
}

fn parse_bracket(expr: &str, content: &str) -> Result<Segment, PathSyntaxError> {
    if let Some(filter) = content.strip_prefix('?') {
        return parse_filter(expr, filter).map(Segment::Filter);
    }

    let members = split_unquoted(content, ',');
    if members.len() > 1 {
        return members
            .into_iter()
            .map(|member| parse_member(expr, member.trim()))
            .collect::<Result<Vec<_>, _>>()
            .map(Segment::Union);
    }

    parse_member(expr, content)
}

fn parse_member(expr: &str, text: &str) -> Result<Segment, PathSyntaxError> {
    if text == "*" {
        Ok(Segment::Wildcard)
    } else if text.starts_with(['\'', '"']) {
        unquote(expr, text).map(Segment::Field)
    } else if text.contains(':') {
        parse_slice(expr, text)
    } else {
        text.parse::<i64>()
            .map(Segment::Index)
            .map_err(|e| PathSyntaxError::new(expr, format!("invalid index {text:?}: {e}")))
    }
}

fn parse_slice(expr: &str, text: &str) -> Result<Segment, PathSyntaxError> {
    let parts: Vec<&str> = text.split(':').map(str::trim).collect();
    if parts.len() > 3 {
        return Err(PathSyntaxError::new(expr, format!("invalid slice {text:?}")));
    }

    let bound = |part: &str| -> Result<Option<i64>, PathSyntaxError> {
        if part.is_empty() {
            return Ok(None);
        }
        part.parse()
            .map(Some)
            .map_err(|e| PathSyntaxError::new(expr, format!("invalid slice bound {part:?}: {e}")))
    };
    let part = |i: usize| parts.get(i).copied().unwrap_or_default();

    let step = match bound(part(2))? {
        None => 1,
        Some(step) => usize::try_from(step)
            .ok()
            .filter(|step| *step > 0)
            .ok_or_else(|| PathSyntaxError::new(expr, format!("slice step must be positive in {text:?}")))?,
    };

    Ok(Segment::Slice {
        start: bound(part(0))?,
        end: bound(part(1))?,
        step,
    })
}

fn parse_filter(expr: &str, text: &str) -> Result<Filter, PathSyntaxError> {
    let body = text
        .trim()
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| PathSyntaxError::new(expr, "filter must be written as [?(...)]"))?;

    if let Some((left, comparison, right)) = split_comparison(body) {
        return Ok(Filter {
            left: parse_operand(expr, left)?,
            comparison: Some((comparison, parse_operand(expr, right)?)),
        });
    }

    match parse_operand(expr, body)? {
        left @ Operand::Current(_) => Ok(Filter {
            left,
            comparison: None,
        }),
        Operand::Literal(_) => Err(PathSyntaxError::new(
            expr,
            format!("filter {body:?} needs an @ path or a comparison"),
        )),
    }
}

fn split_comparison(body: &str) -> Option<(&str, Comparison, &str)> {
    let mut quote = None;
    let mut escaped = false;

    for (i, c) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (_, '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, _) => {
                let rest = body.get(i..)?;
                for (token, comparison) in COMPARISONS {
                    if let Some(right) = rest.strip_prefix(token) {
                        return Some((body.get(..i)?, comparison, right));
                    }
                }
            }
        }
    }

    None
}

fn parse_operand(expr: &str, text: &str) -> Result<Operand, PathSyntaxError> {
    let text = text.trim();

    if let Some(rest) = text.strip_prefix('@') {
        let chars: Vec<char> = rest.chars().collect();
        return parse_chain(expr, &chars).map(Operand::Current);
    }
    if text.starts_with(['\'', '"']) {
        return unquote(expr, text).map(|s| Operand::Literal(Value::String(s)));
    }

    let literal = match text {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if let Ok(integer) = text.parse::<i64>() {
                Value::from(integer)
            } else {
                text.parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| {
                        PathSyntaxError::new(expr, format!("invalid filter operand {text:?}"))
                    })?
            }
        }
    };
    Ok(Operand::Literal(literal))
}

/// Strips matching quotes from `text`; a backslash escapes the next character.
fn unquote(expr: &str, text: &str) -> Result<String, PathSyntaxError> {
    let mut chars = text.chars();
    let quote = chars
        .next()
        .ok_or_else(|| PathSyntaxError::new(expr, "unterminated quoted name"))?;
    let mut value = String::new();

    while let Some(c) = chars.next() {
        match c {
            '\\' => value.push(
                chars
                    .next()
                    .ok_or_else(|| PathSyntaxError::new(expr, "unterminated quoted name"))?,
            ),
            c if c == quote => {
                if chars.as_str().trim().is_empty() {
                    return Ok(value);
                }
                return Err(PathSyntaxError::new(
                    expr,
                    format!("unexpected text after quoted name {text:?}"),
                ));
            }
            c => value.push(c),
        }
    }

    Err(PathSyntaxError::new(expr, "unterminated quoted name"))
}

/// Splits on `separator` outside quoted text.
fn split_unquoted(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote = None;
    let mut escaped = false;
    let mut from = 0;

    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some(_), '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, c) if c == separator => {
                parts.push(text.get(from..i).unwrap_or_default());
                from = i + c.len_utf8();
            }
            (None, _) => {}
        }
    }
    parts.push(text.get(from..).unwrap_or_default());

    parts
}
