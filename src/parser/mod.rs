//! Pipeline DSL parser.
//!
//! Turns pipeline text into a list of spanned steps: SOURCE, LOAD,
//! CREATE TABLE AS, EXPORT, SET, IF/ELSE, INCLUDE. `--` comments run to end
//! of line. Statements terminate with `;` outside quotes and braces.
//! Parse errors are collected in bulk; a single failing statement does not
//! hide diagnostics for the rest of the file.

use std::collections::VecDeque;

use chrono::Duration;

use crate::errors::{Result, Span, SqlFlowError};

pub mod loader;

/// Write semantics for a transform (`CREATE TABLE ... MODE ...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformMode {
    Replace,
    Append,
    Upsert {
        keys: Vec<String>,
    },
    Incremental {
        time_column: String,
        lookback: Option<Duration>,
    },
}

/// Write semantics for `LOAD ... MODE ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadMode {
    Replace,
    Append,
    Merge { keys: Vec<String> },
}

/// Write semantics for `EXPORT ... MODE ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportMode {
    Replace,
    Append,
    Upsert { keys: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceDef {
    pub name: String,
    pub connector_type: String,
    /// Raw `{ ... }` blob; substituted in JSON context and parsed at plan
    /// time, so `${var}` may appear anywhere inside.
    pub params_raw: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadStmt {
    pub target_table: String,
    pub source_name: String,
    pub columns: Option<Vec<String>>,
    pub mode: LoadMode,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlBlock {
    pub table_name: String,
    pub query: String,
    pub is_replace: bool,
    pub mode: TransformMode,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportStmt {
    pub query: String,
    pub destination_uri: String,
    pub connector_type: String,
    pub options_raw: Option<String>,
    pub mode: ExportMode,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetVar {
    pub name: String,
    pub value: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfBranch {
    pub condition: String,
    pub then_steps: Vec<Step>,
    pub else_steps: Vec<Step>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    pub path: String,
    pub span: Span,
}

/// One parsed pipeline step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Source(SourceDef),
    Load(LoadStmt),
    Sql(SqlBlock),
    Export(ExportStmt),
    Set(SetVar),
    If(IfBranch),
    Include(Include),
}

impl Step {
    pub fn span(&self) -> Span {
        match self {
            Step::Source(s) => s.span,
            Step::Load(s) => s.span,
            Step::Sql(s) => s.span,
            Step::Export(s) => s.span,
            Step::Set(s) => s.span,
            Step::If(s) => s.span,
            Step::Include(s) => s.span,
        }
    }
}

// ---------------------------------------------------------------------------
// statement chunking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Chunk {
    text: String,
    span: Span,
}

/// Splits pipeline text into `;`-terminated statements, tracking spans and
/// ignoring `--` comments, quoted strings and brace/paren nesting.
fn chunk_statements(input: &str) -> Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_span: Option<Span> = None;

    let mut line = 1usize;
    let mut col = 0usize;
    let mut in_squote = false;
    let mut in_dquote = false;
    let mut in_comment = false;
    let mut brace_depth = 0i32;

    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\n' {
            line += 1;
            col = 0;
            in_comment = false;
            if current_span.is_some() {
                current.push(' ');
            }
            continue;
        }
        col += 1;

        if in_comment {
            continue;
        }

        match c {
            '-' if !in_squote && !in_dquote && chars.peek() == Some(&'-') => {
                chars.next();
                col += 1;
                in_comment = true;
                continue;
            }
            '\'' if !in_dquote => in_squote = !in_squote,
            '"' if !in_squote => in_dquote = !in_dquote,
            '{' if !in_squote && !in_dquote => brace_depth += 1,
            '}' if !in_squote && !in_dquote => brace_depth -= 1,
            ';' if !in_squote && !in_dquote && brace_depth == 0 => {
                if let Some(span) = current_span.take() {
                    let text = current.trim().to_string();
                    if !text.is_empty() {
                        chunks.push(Chunk { text, span });
                    }
                }
                current.clear();
                continue;
            }
            _ => {}
        }

        if current_span.is_none() {
            if c.is_whitespace() {
                continue;
            }
            current_span = Some(Span::new(line, col));
        }
        current.push(c);
    }

    if in_squote || in_dquote {
        return Err(SqlFlowError::Parse {
            message: "unterminated string literal".into(),
            span: current_span.unwrap_or_default(),
        });
    }
    if let Some(span) = current_span {
        let text = current.trim().to_string();
        if !text.is_empty() {
            return Err(SqlFlowError::Parse {
                message: format!("statement is missing its ';' terminator: {}", head(&text)),
                span,
            });
        }
    }

    Ok(chunks)
}

fn head(text: &str) -> String {
    let t: String = text.chars().take(40).collect();
    if t.len() < text.len() {
        format!("{t}...")
    } else {
        t
    }
}

// ---------------------------------------------------------------------------
// tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct Token {
    text: String,
    /// Byte offset into the statement text.
    start: usize,
    end: usize,
}

impl Token {
    fn is_kw(&self, kw: &str) -> bool {
        self.text.eq_ignore_ascii_case(kw)
    }
    fn unquoted(&self) -> &str {
        let b = self.text.as_bytes();
        if b.len() >= 2 {
            let (f, l) = (b[0], b[b.len() - 1]);
            if f == l && (f == b'"' || f == b'\'') {
                return &self.text[1..self.text.len() - 1];
            }
        }
        &self.text
    }
}

/// Word tokenizer: quoted strings and balanced `{...}` / `(...)` blobs are
/// single tokens; `=` and `,` are their own tokens.
fn tokenize(text: &str) -> Vec<Token> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if (c as char).is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        match c {
            b'\'' | b'"' => {
                let quote = c;
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i = (i + 1).min(bytes.len());
            }
            b'{' | b'(' => {
                let (open, close) = if c == b'{' { (b'{', b'}') } else { (b'(', b')') };
                let mut depth = 0i32;
                let mut in_q: Option<u8> = None;
                while i < bytes.len() {
                    let b = bytes[i];
                    match in_q {
                        Some(q) => {
                            if b == q {
                                in_q = None;
                            }
                        }
                        None => {
                            if b == b'\'' || b == b'"' {
                                in_q = Some(b);
                            } else if b == open {
                                depth += 1;
                            } else if b == close {
                                depth -= 1;
                                if depth == 0 {
                                    i += 1;
                                    break;
                                }
                            }
                        }
                    }
                    i += 1;
                }
            }
            b'=' | b',' => {
                i += 1;
            }
            _ => {
                while i < bytes.len() {
                    let b = bytes[i];
                    if (b as char).is_whitespace() || matches!(b, b'=' | b',' | b'(' | b'{') {
                        break;
                    }
                    i += 1;
                }
            }
        }
        tokens.push(Token {
            text: text[start..i].to_string(),
            start,
            end: i,
        });
    }
    tokens
}

/// `(a, b, c)` into a list of identifiers.
fn parse_ident_list(blob: &str, span: Span) -> Result<Vec<String>> {
    let inner = blob
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| SqlFlowError::Parse {
            message: format!("expected a parenthesized column list, got '{blob}'"),
            span,
        })?;
    let cols: Vec<String> = inner
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if cols.is_empty() {
        return Err(SqlFlowError::Parse {
            message: "empty column list".into(),
            span,
        });
    }
    Ok(cols)
}

/// `'1 day'`, `'12 hours'`, `'30 minutes'` into a duration.
pub fn parse_lookback(raw: &str, span: Span) -> Result<Duration> {
    let trimmed = raw.trim_matches(|c| c == '\'' || c == '"');
    let mut parts = trimmed.split_whitespace();
    let (amount, unit) = match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(u), None) => (a, u),
        _ => {
            return Err(SqlFlowError::Parse {
                message: format!("invalid LOOKBACK duration '{trimmed}'"),
                span,
            })
        }
    };
    let n: i64 = amount.parse().map_err(|_| SqlFlowError::Parse {
        message: format!("invalid LOOKBACK amount '{amount}'"),
        span,
    })?;
    let unit = unit.to_ascii_lowercase();
    let dur = match unit.trim_end_matches('s') {
        "second" => Duration::seconds(n),
        "minute" => Duration::minutes(n),
        "hour" => Duration::hours(n),
        "day" => Duration::days(n),
        "week" => Duration::weeks(n),
        _ => {
            return Err(SqlFlowError::Parse {
                message: format!("unknown LOOKBACK unit '{unit}'"),
                span,
            })
        }
    };
    Ok(dur)
}

// ---------------------------------------------------------------------------
// statement parsers
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
    span: Span,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [Token], span: Span) -> Self {
        Self {
            tokens,
            pos: 0,
            span,
        }
    }
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }
    fn next(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }
    fn expect_kw(&mut self, kw: &str) -> Result<&Token> {
        let span = self.span;
        match self.next() {
            Some(t) if t.is_kw(kw) => Ok(t),
            Some(t) => Err(SqlFlowError::Parse {
                message: format!("expected '{kw}', found '{}'", t.text),
                span,
            }),
            None => Err(SqlFlowError::Parse {
                message: format!("expected '{kw}', found end of statement"),
                span,
            }),
        }
    }
    fn expect_ident(&mut self, what: &str) -> Result<String> {
        match self.next() {
            Some(t) if !t.text.is_empty() => Ok(t.unquoted().to_string()),
            _ => Err(SqlFlowError::Parse {
                message: format!("expected {what}, found end of statement"),
                span: self.span,
            }),
        }
    }
    fn next_is(&self, kw: &str) -> bool {
        self.peek().map(|t| t.is_kw(kw)).unwrap_or(false)
    }
}

fn parse_source(chunk: &Chunk) -> Result<Step> {
    let tokens = tokenize(&chunk.text);
    let mut c = Cursor::new(&tokens, chunk.span);
    c.expect_kw("SOURCE")?;
    let name = c.expect_ident("source name")?;
    c.expect_kw("TYPE")?;
    let connector_type = c.expect_ident("connector type")?.to_ascii_lowercase();
    c.expect_kw("PARAMS")?;
    let params = c.expect_ident("PARAMS { ... } block")?;
    if !params.starts_with('{') {
        return Err(SqlFlowError::Parse {
            message: "PARAMS must be a { ... } JSON block".into(),
            span: chunk.span,
        });
    }
    Ok(Step::Source(SourceDef {
        name,
        connector_type,
        params_raw: params,
        span: chunk.span,
    }))
}

fn parse_load(chunk: &Chunk) -> Result<Step> {
    let tokens = tokenize(&chunk.text);
    let mut c = Cursor::new(&tokens, chunk.span);
    c.expect_kw("LOAD")?;
    let target_table = c.expect_ident("target table")?;

    let mut columns = None;
    let has_list = c.peek().map(|t| t.text.starts_with('(')).unwrap_or(false);
    if has_list {
        let blob = c.next().expect("peeked").text.clone();
        columns = Some(parse_ident_list(&blob, chunk.span)?);
    }

    c.expect_kw("FROM")?;
    let source_name = c.expect_ident("source name")?;

    let mode = if c.next_is("MODE") {
        c.next();
        match c.next() {
            Some(t) if t.is_kw("REPLACE") => LoadMode::Replace,
            Some(t) if t.is_kw("APPEND") => LoadMode::Append,
            Some(t) if t.is_kw("MERGE") => {
                c.expect_kw("KEY")?;
                let blob = c.expect_ident("KEY (columns)")?;
                LoadMode::Merge {
                    keys: parse_ident_list(&blob, chunk.span)?,
                }
            }
            other => {
                return Err(SqlFlowError::Parse {
                    message: format!(
                        "unknown LOAD mode '{}'",
                        other.map(|t| t.text.as_str()).unwrap_or("<none>")
                    ),
                    span: chunk.span,
                })
            }
        }
    } else {
        LoadMode::Replace
    };

    Ok(Step::Load(LoadStmt {
        target_table,
        source_name,
        columns,
        mode,
        span: chunk.span,
    }))
}

fn parse_transform_mode(c: &mut Cursor<'_>, table: &str, span: Span) -> Result<TransformMode> {
    match c.next() {
        Some(t) if t.is_kw("REPLACE") => Ok(TransformMode::Replace),
        Some(t) if t.is_kw("APPEND") => Ok(TransformMode::Append),
        Some(t) if t.is_kw("UPSERT") || t.is_kw("MERGE") => {
            let mode_name = t.text.to_ascii_uppercase();
            if !c.next_is("KEY") {
                return Err(SqlFlowError::MergeWithoutKeys {
                    table: table.to_string(),
                    mode: mode_name,
                    span,
                });
            }
            c.next();
            let blob = c.expect_ident("KEY (columns)")?;
            Ok(TransformMode::Upsert {
                keys: parse_ident_list(&blob, span)?,
            })
        }
        Some(t) if t.is_kw("INCREMENTAL") => {
            if !c.next_is("BY") {
                return Err(SqlFlowError::MissingCursorField {
                    table: table.to_string(),
                    span,
                });
            }
            c.next();
            let time_column = c.expect_ident("cursor column")?;
            let lookback = if c.next_is("LOOKBACK") {
                c.next();
                let raw = c.expect_ident("LOOKBACK duration")?;
                Some(parse_lookback(&raw, span)?)
            } else {
                None
            };
            Ok(TransformMode::Incremental {
                time_column,
                lookback,
            })
        }
        other => Err(SqlFlowError::Parse {
            message: format!(
                "unknown transform mode '{}'",
                other.map(|t| t.text.as_str()).unwrap_or("<none>")
            ),
            span,
        }),
    }
}

fn parse_create(chunk: &Chunk) -> Result<Step> {
    let tokens = tokenize(&chunk.text);
    let mut c = Cursor::new(&tokens, chunk.span);
    c.expect_kw("CREATE")?;

    let mut is_replace = false;
    if c.next_is("OR") {
        c.next();
        c.expect_kw("REPLACE")?;
        is_replace = true;
    }
    c.expect_kw("TABLE")?;
    let table_name = c.expect_ident("table name")?;

    let mut mode = TransformMode::Replace;
    if c.next_is("MODE") {
        c.next();
        mode = parse_transform_mode(&mut c, &table_name, chunk.span)?;
        // An explicit MODE REPLACE is the same declaration as OR REPLACE.
        if matches!(mode, TransformMode::Replace) {
            is_replace = true;
        }
    }

    let as_token = c.next().ok_or_else(|| SqlFlowError::Parse {
        message: "expected AS <query>".into(),
        span: chunk.span,
    })?;
    if !as_token.is_kw("AS") {
        return Err(SqlFlowError::Parse {
            message: format!("expected AS, found '{}'", as_token.text),
            span: chunk.span,
        });
    }
    let query_start = as_token.end;
    let query = chunk.text[query_start..].trim().to_string();
    if query.is_empty() {
        return Err(SqlFlowError::Parse {
            message: "CREATE TABLE has an empty query".into(),
            span: chunk.span,
        });
    }

    Ok(Step::Sql(SqlBlock {
        table_name,
        query,
        is_replace,
        mode,
        span: chunk.span,
    }))
}

fn parse_export(chunk: &Chunk) -> Result<Step> {
    let tokens = tokenize(&chunk.text);
    // Locate the top-level `TO "<uri>" TYPE <conn>` triple; everything
    // between EXPORT and TO is the query text.
    let mut to_idx = None;
    for (i, t) in tokens.iter().enumerate() {
        if t.is_kw("TO")
            && tokens
                .get(i + 1)
                .map(|u| u.text.starts_with('"') || u.text.starts_with('\''))
                .unwrap_or(false)
            && tokens.get(i + 2).map(|u| u.is_kw("TYPE")).unwrap_or(false)
        {
            to_idx = Some(i);
        }
    }
    let to_idx = to_idx.ok_or_else(|| SqlFlowError::Parse {
        message: "EXPORT requires TO \"<uri>\" TYPE <connector>".into(),
        span: chunk.span,
    })?;

    let export_kw = &tokens[0];
    if !export_kw.is_kw("EXPORT") {
        return Err(SqlFlowError::Parse {
            message: "expected EXPORT".into(),
            span: chunk.span,
        });
    }
    let query = chunk.text[export_kw.end..tokens[to_idx].start]
        .trim()
        .to_string();
    if query.is_empty() {
        return Err(SqlFlowError::Parse {
            message: "EXPORT has an empty query".into(),
            span: chunk.span,
        });
    }

    let destination_uri = tokens[to_idx + 1].unquoted().to_string();
    let mut c = Cursor::new(&tokens, chunk.span);
    c.pos = to_idx + 2;
    c.expect_kw("TYPE")?;
    let connector_type = c.expect_ident("connector type")?.to_ascii_lowercase();

    let mut options_raw = None;
    if c.next_is("OPTIONS") {
        c.next();
        let blob = c.expect_ident("OPTIONS { ... } block")?;
        options_raw = Some(blob);
    }

    let mode = if c.next_is("MODE") {
        c.next();
        match c.next() {
            Some(t) if t.is_kw("REPLACE") => ExportMode::Replace,
            Some(t) if t.is_kw("APPEND") => ExportMode::Append,
            Some(t) if t.is_kw("UPSERT") => {
                c.expect_kw("KEY")?;
                let blob = c.expect_ident("KEY (columns)")?;
                ExportMode::Upsert {
                    keys: parse_ident_list(&blob, chunk.span)?,
                }
            }
            other => {
                return Err(SqlFlowError::Parse {
                    message: format!(
                        "unknown EXPORT mode '{}'",
                        other.map(|t| t.text.as_str()).unwrap_or("<none>")
                    ),
                    span: chunk.span,
                })
            }
        }
    } else {
        ExportMode::Replace
    };

    Ok(Step::Export(ExportStmt {
        query,
        destination_uri,
        connector_type,
        options_raw,
        mode,
        span: chunk.span,
    }))
}

fn parse_set(chunk: &Chunk) -> Result<Step> {
    let tokens = tokenize(&chunk.text);
    let mut c = Cursor::new(&tokens, chunk.span);
    c.expect_kw("SET")?;
    let name = c.expect_ident("variable name")?;
    match c.next() {
        Some(t) if t.text == "=" => {}
        _ => {
            return Err(SqlFlowError::Parse {
                message: "SET requires '='".into(),
                span: chunk.span,
            })
        }
    }
    let value = c.expect_ident("value")?;
    Ok(Step::Set(SetVar {
        name,
        value,
        span: chunk.span,
    }))
}

fn parse_include(chunk: &Chunk) -> Result<Step> {
    let tokens = tokenize(&chunk.text);
    let mut c = Cursor::new(&tokens, chunk.span);
    c.expect_kw("INCLUDE")?;
    let path = c.expect_ident("include path")?;
    Ok(Step::Include(Include {
        path,
        span: chunk.span,
    }))
}

// ---------------------------------------------------------------------------
// IF/ELSE assembly
// ---------------------------------------------------------------------------

/// Computes the span of `suffix` within a chunk whose text starts at `base`.
fn advance_span(base: Span, consumed: &str) -> Span {
    let mut line = base.line;
    let mut col = base.column;
    for c in consumed.chars() {
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    Span::new(line, col)
}

enum BlockEnd {
    Else,
    EndIf,
    Eof,
}

fn parse_block(
    queue: &mut VecDeque<Chunk>,
    inside_if: bool,
    errors: &mut Vec<SqlFlowError>,
) -> (Vec<Step>, BlockEnd) {
    let mut steps = Vec::new();

    while let Some(chunk) = queue.pop_front() {
        let first = chunk
            .text
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();

        match first.as_str() {
            "ELSE" if inside_if => {
                let rest = chunk.text["ELSE".len()..].trim_start().to_string();
                if !rest.is_empty() {
                    let consumed_len = chunk.text.len() - rest.len();
                    queue.push_front(Chunk {
                        span: advance_span(chunk.span, &chunk.text[..consumed_len]),
                        text: rest,
                    });
                }
                return (steps, BlockEnd::Else);
            }
            "END" if inside_if => {
                // `END IF` is its own chunk once the terminator is stripped.
                let rest: Vec<&str> = chunk.text.split_whitespace().collect();
                if rest.len() == 2 && rest[1].eq_ignore_ascii_case("IF") {
                    return (steps, BlockEnd::EndIf);
                }
                errors.push(SqlFlowError::Parse {
                    message: format!("unexpected statement '{}'", head(&chunk.text)),
                    span: chunk.span,
                });
            }
            "IF" => match parse_if(chunk, queue, errors) {
                Some(step) => steps.push(step),
                None => {}
            },
            "SOURCE" => collect(parse_source(&chunk), &mut steps, errors),
            "LOAD" => collect(parse_load(&chunk), &mut steps, errors),
            "CREATE" => collect(parse_create(&chunk), &mut steps, errors),
            "EXPORT" => collect(parse_export(&chunk), &mut steps, errors),
            "SET" => collect(parse_set(&chunk), &mut steps, errors),
            "INCLUDE" => collect(parse_include(&chunk), &mut steps, errors),
            _ => errors.push(SqlFlowError::Parse {
                message: format!("unknown statement '{}'", head(&chunk.text)),
                span: chunk.span,
            }),
        }
    }

    (steps, BlockEnd::Eof)
}

fn collect(result: Result<Step>, steps: &mut Vec<Step>, errors: &mut Vec<SqlFlowError>) {
    match result {
        Ok(step) => steps.push(step),
        Err(e) => errors.push(e),
    }
}

fn parse_if(
    chunk: Chunk,
    queue: &mut VecDeque<Chunk>,
    errors: &mut Vec<SqlFlowError>,
) -> Option<Step> {
    // The chunk is `IF <cond> THEN <first inner statement>`; the inner
    // remainder goes back on the queue.
    let upper = chunk.text.to_ascii_uppercase();
    let then_pos = match upper.find(" THEN") {
        Some(p) => p,
        None => {
            errors.push(SqlFlowError::Parse {
                message: "IF requires THEN".into(),
                span: chunk.span,
            });
            return None;
        }
    };
    let condition = chunk.text[2..then_pos].trim().to_string();
    if condition.is_empty() {
        errors.push(SqlFlowError::Parse {
            message: "IF has an empty condition".into(),
            span: chunk.span,
        });
        return None;
    }

    let after_then = then_pos + " THEN".len();
    let rest = chunk.text[after_then..].trim_start().to_string();
    if !rest.is_empty() {
        let consumed_len = chunk.text.len() - rest.len();
        queue.push_front(Chunk {
            span: advance_span(chunk.span, &chunk.text[..consumed_len]),
            text: rest,
        });
    }

    let (then_steps, end) = parse_block(queue, true, errors);
    let else_steps = match end {
        BlockEnd::Else => {
            let (else_steps, end) = parse_block(queue, true, errors);
            if matches!(end, BlockEnd::Eof) {
                errors.push(SqlFlowError::Parse {
                    message: "IF without END IF".into(),
                    span: chunk.span,
                });
            }
            else_steps
        }
        BlockEnd::EndIf => Vec::new(),
        BlockEnd::Eof => {
            errors.push(SqlFlowError::Parse {
                message: "IF without END IF".into(),
                span: chunk.span,
            });
            Vec::new()
        }
    };

    Some(Step::If(IfBranch {
        condition,
        then_steps,
        else_steps,
        span: chunk.span,
    }))
}

/// Parses pipeline text into steps. All statement-level diagnostics are
/// collected; the parse fails with the full batch.
pub fn parse_pipeline(input: &str) -> Result<Vec<Step>> {
    let chunks = chunk_statements(input)?;
    let mut queue: VecDeque<Chunk> = chunks.into();
    let mut errors = Vec::new();
    let (steps, _) = parse_block(&mut queue, false, &mut errors);
    if errors.is_empty() {
        Ok(steps)
    } else {
        Err(SqlFlowError::from_batch(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunking_skips_comments() {
        let steps = parse_pipeline("-- a comment\nSET x = \"1\"; -- trailing\n").unwrap();
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn test_semicolon_inside_params_blob() {
        let steps =
            parse_pipeline(r#"SOURCE s TYPE http PARAMS { "url": "http://x/y;z" };"#).unwrap();
        match &steps[0] {
            Step::Source(s) => assert!(s.params_raw.contains(";z")),
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_create_mode_upsert() {
        let steps =
            parse_pipeline("CREATE TABLE t MODE UPSERT KEY (id, region) AS SELECT 1;").unwrap();
        match &steps[0] {
            Step::Sql(sql) => {
                assert_eq!(sql.table_name, "t");
                assert_eq!(
                    sql.mode,
                    TransformMode::Upsert {
                        keys: vec!["id".into(), "region".into()]
                    }
                );
                assert_eq!(sql.query, "SELECT 1");
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_upsert_without_keys_is_error() {
        let err = parse_pipeline("CREATE TABLE t MODE UPSERT AS SELECT 1;").unwrap_err();
        assert!(matches!(err, SqlFlowError::MergeWithoutKeys { .. }));
    }

    #[test]
    fn test_incremental_lookback() {
        let steps = parse_pipeline(
            "CREATE TABLE d MODE INCREMENTAL BY ts LOOKBACK '1 day' AS SELECT * FROM o;",
        )
        .unwrap();
        match &steps[0] {
            Step::Sql(sql) => match &sql.mode {
                TransformMode::Incremental {
                    time_column,
                    lookback,
                } => {
                    assert_eq!(time_column, "ts");
                    assert_eq!(*lookback, Some(Duration::days(1)));
                }
                other => panic!("unexpected mode {other:?}"),
            },
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_if_else_blocks() {
        let text = r#"
IF ${env} == 'prod' THEN
  CREATE TABLE a AS SELECT 1;
  CREATE TABLE b AS SELECT 2;
ELSE
  CREATE TABLE a AS SELECT 3;
END IF;
"#;
        let steps = parse_pipeline(text).unwrap();
        assert_eq!(steps.len(), 1);
        match &steps[0] {
            Step::If(branch) => {
                assert_eq!(branch.condition, "${env} == 'prod'");
                assert_eq!(branch.then_steps.len(), 2);
                assert_eq!(branch.else_steps.len(), 1);
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_export_statement() {
        let steps = parse_pipeline(
            r#"EXPORT SELECT * FROM t TO "out/data.csv" TYPE file OPTIONS { "header": "true" } MODE APPEND;"#,
        )
        .unwrap();
        match &steps[0] {
            Step::Export(e) => {
                assert_eq!(e.query, "SELECT * FROM t");
                assert_eq!(e.destination_uri, "out/data.csv");
                assert_eq!(e.connector_type, "file");
                assert_eq!(e.mode, ExportMode::Append);
                assert!(e.options_raw.as_deref().unwrap().contains("header"));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_bulk_errors() {
        let err = parse_pipeline("FROB x; SET a; LOAD t FROM s;").unwrap_err();
        match err {
            SqlFlowError::Multiple { errors } => assert_eq!(errors.len(), 2),
            other => panic!("expected batch, got {other}"),
        }
    }

    #[test]
    fn test_spans_are_tracked() {
        let steps = parse_pipeline("\n\n  SET a = \"1\";").unwrap();
        assert_eq!(steps[0].span(), Span::new(3, 3));
    }
}
