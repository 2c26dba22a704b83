use std::collections::HashMap;

use regex::Regex;

use confab_core::{Error, Result};

use crate::model::{Exchange, FileReference, HeaderValue, Line, TextSpan, Transcript};

/// Line prefixes the parser keys on. All of them are matched at column
/// 1 only; anything else on a line is content.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub separator: String,
    pub user_prefix: String,
    pub assistant_prefix: String,
    pub summary_prefix: String,
    pub reasoning_prefix: String,
    pub local_prefix: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            separator: "---".to_string(),
            user_prefix: ">>> ".to_string(),
            assistant_prefix: "<<< ".to_string(),
            summary_prefix: "==> ".to_string(),
            reasoning_prefix: "--> ".to_string(),
            local_prefix: "%% ".to_string(),
        }
    }
}

impl ParserConfig {
    /// Turn markers accept both the bare prefix (`>>>`) and the prefix
    /// followed by a label (`>>> user`).
    fn is_marker(line: &str, prefix: &str) -> bool {
        line.starts_with(prefix) || line.trim_end() == prefix.trim_end()
    }

    fn is_user_marker(&self, line: &str) -> bool {
        Self::is_marker(line, &self.user_prefix)
    }

    fn is_assistant_marker(&self, line: &str) -> bool {
        Self::is_marker(line, &self.assistant_prefix)
    }

    /// Metadata markers likewise accept the bare prefix: a summary line
    /// whose trailing space an editor stripped still reads as an empty
    /// summary, not as answer content.
    fn strip_meta<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
        line.strip_prefix(prefix)
            .or_else(|| (line.trim_end() == prefix.trim_end()).then_some(""))
    }
}

/// Lines reserved for dispatch rather than stored under a `config_`
/// prefix.
const RESERVED_KEYS: &[&str] = &["model", "provider"];

/// Index of the first section-separator line, the boundary the caller
/// must hand to [`parse`]. Absence means the document is not a
/// transcript.
pub fn find_separator(lines: &[String], config: &ParserConfig) -> Option<usize> {
    lines.iter().position(|l| l.starts_with(&config.separator))
}

/// Parse a transcript: headers above the separator at `header_end`,
/// exchanges below it.
///
/// The parser never rejects body content. Damaged transcripts (an
/// answer with no question before it, doubled markers) are repaired by
/// synthesizing empty spans rather than erroring, so recoverable text
/// is never discarded.
pub fn parse(lines: &[String], header_end: usize, config: &ParserConfig) -> Result<Transcript> {
    if header_end >= lines.len() || !lines[header_end].starts_with(&config.separator) {
        return Err(Error::malformed_header(format!(
            "no section separator ({}) at line {}",
            config.separator,
            header_end + 1
        )));
    }

    let headers = parse_headers(&lines[..header_end]);
    let exchanges = parse_body(lines, header_end, config);

    Ok(Transcript { headers, exchanges })
}

fn parse_headers(lines: &[String]) -> HashMap<String, HeaderValue> {
    let mut headers = HashMap::new();

    if let Some(topic) = lines.first().and_then(|l| l.strip_prefix("# ")) {
        let topic = topic.trim();
        if !topic.is_empty() {
            headers.insert("topic".to_string(), HeaderValue::Text(topic.to_string()));
        }
    }

    for line in lines {
        let Some(rest) = line.strip_prefix("- ") else {
            continue;
        };
        let Some((key, value)) = rest.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        let stored = if RESERVED_KEYS.contains(&key) {
            key.to_string()
        } else {
            format!("config_{key}")
        };
        headers.insert(stored, coerce_header_value(value));
    }

    headers
}

fn coerce_header_value(value: &str) -> HeaderValue {
    if let Ok(n) = value.parse::<i64>() {
        return HeaderValue::Integer(n);
    }
    if let Ok(f) = value.parse::<f64>() {
        return HeaderValue::Float(f);
    }
    match value {
        "true" => return HeaderValue::Bool(true),
        "false" => return HeaderValue::Bool(false),
        _ => {}
    }
    if value.starts_with('{') || value.starts_with('[') {
        if let Ok(json) = serde_json::from_str(value) {
            return HeaderValue::Json(json);
        }
    }
    HeaderValue::Text(value.to_string())
}

/// Accumulates one span. `start`/`last` track the covered line range
/// (leading and trailing blank lines fall outside it); `text_lines`
/// collects only the lines the context builder may send.
struct SpanBuilder {
    anchor: usize,
    start: Option<usize>,
    last: usize,
    text_lines: Vec<String>,
    refs: Vec<FileReference>,
}

impl SpanBuilder {
    fn new(anchor: usize) -> Self {
        Self {
            anchor,
            start: None,
            last: 0,
            text_lines: Vec::new(),
            refs: Vec::new(),
        }
    }

    fn push_content(&mut self, index: usize, line: &str) {
        let blank = line.trim().is_empty();
        if self.start.is_none() {
            if blank {
                return;
            }
            self.start = Some(index);
        }
        if !blank {
            self.last = index;
        }
        self.text_lines.push(line.to_string());
    }

    fn push_reference(&mut self, index: usize, line: &str, path: String) {
        if self.start.is_none() {
            self.start = Some(index);
        }
        self.last = index;
        self.refs.push(FileReference {
            raw_directive: line.to_string(),
            path,
            line: index,
            resolved_content: None,
        });
    }

    /// Local lines stay inside the span range but never reach `text`.
    fn push_hidden(&mut self, index: usize) {
        if self.start.is_none() {
            self.start = Some(index);
        }
        self.last = index;
    }

    fn finish(mut self, lines: &[String]) -> TextSpan {
        let Some(start) = self.start else {
            return TextSpan::empty(self.anchor);
        };
        let end = self.last.max(start);
        while self
            .text_lines
            .last()
            .is_some_and(|l| l.trim().is_empty())
        {
            self.text_lines.pop();
        }
        TextSpan {
            start_line: start,
            end_line: end,
            content: lines[start..=end].join("\n"),
            text: self.text_lines.join("\n"),
            file_references: self.refs,
        }
    }
}

enum State {
    Idle,
    Question(SpanBuilder),
    Answer {
        question: TextSpan,
        answer: SpanBuilder,
        summary: Option<Line>,
        reasoning: Option<Line>,
    },
}

impl State {
    fn close_into(self, lines: &[String], exchanges: &mut Vec<Exchange>) {
        match self {
            State::Idle => {}
            State::Question(builder) => exchanges.push(Exchange {
                question: builder.finish(lines),
                answer: None,
                summary: None,
                reasoning: None,
            }),
            State::Answer {
                question,
                answer,
                summary,
                reasoning,
            } => exchanges.push(Exchange {
                question,
                answer: Some(answer.finish(lines)),
                summary,
                reasoning,
            }),
        }
    }
}

fn parse_body(lines: &[String], header_end: usize, config: &ParserConfig) -> Vec<Exchange> {
    // A directive line is a path wrapped in angle brackets and nothing
    // else. A leading slash is rejected so closing tags (`</div>`)
    // pasted at column 1 are never mistaken for directives; absolute
    // paths are written with `~` or `$VAR` instead.
    let file_ref = Regex::new(r"^<([^<>\s/][^<>]*)>\s*$").unwrap();

    let body_anchor = header_end + 1;
    let mut exchanges = Vec::new();
    let mut state = State::Idle;
    let mut in_fence = false;

    for (index, line) in lines.iter().enumerate().skip(body_anchor) {
        if config.is_user_marker(line) {
            let prev = std::mem::replace(&mut state, State::Question(SpanBuilder::new(index + 1)));
            prev.close_into(lines, &mut exchanges);
            in_fence = false;
            continue;
        }

        if config.is_assistant_marker(line) {
            state = match std::mem::replace(&mut state, State::Idle) {
                State::Idle => State::Answer {
                    question: TextSpan::empty(body_anchor),
                    answer: SpanBuilder::new(index + 1),
                    summary: None,
                    reasoning: None,
                },
                State::Question(builder) => State::Answer {
                    question: builder.finish(lines),
                    answer: SpanBuilder::new(index + 1),
                    summary: None,
                    reasoning: None,
                },
                finished @ State::Answer { .. } => {
                    finished.close_into(lines, &mut exchanges);
                    State::Answer {
                        question: TextSpan::empty(index + 1),
                        answer: SpanBuilder::new(index + 1),
                        summary: None,
                        reasoning: None,
                    }
                }
            };
            in_fence = false;
            continue;
        }

        if let State::Answer {
            summary, reasoning, ..
        } = &mut state
        {
            if let Some(rest) = ParserConfig::strip_meta(line, &config.summary_prefix) {
                *summary = Some(Line {
                    index,
                    text: rest.trim().to_string(),
                });
                continue;
            }
            if let Some(rest) = ParserConfig::strip_meta(line, &config.reasoning_prefix) {
                *reasoning = Some(Line {
                    index,
                    text: rest.trim().to_string(),
                });
                continue;
            }
        }

        match &mut state {
            State::Idle => {}
            State::Question(builder) => {
                if line.starts_with(&config.local_prefix) {
                    builder.push_hidden(index);
                } else if line.starts_with("```") {
                    in_fence = !in_fence;
                    builder.push_content(index, line);
                } else {
                    let directive = if in_fence { None } else { file_ref.captures(line) };
                    match directive {
                        Some(caps) => {
                            let path = caps[1].trim().to_string();
                            builder.push_reference(index, line, path);
                        }
                        None => builder.push_content(index, line),
                    }
                }
            }
            State::Answer { answer, .. } => {
                if line.starts_with(&config.local_prefix) {
                    answer.push_hidden(index);
                } else {
                    if line.starts_with("```") {
                        in_fence = !in_fence;
                    }
                    answer.push_content(index, line);
                }
            }
        }
    }

    state.close_into(lines, &mut exchanges);
    exchanges
}

/// First fenced code block in a stretch of text, without its fence
/// lines. Raw-mode requests ship this as the payload body.
pub fn extract_fenced_block(text: &str) -> Option<String> {
    let mut in_fence = false;
    let mut collected: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            if in_fence {
                return Some(collected.join("\n"));
            }
            in_fence = true;
            continue;
        }
        if in_fence {
            collected.push(line);
        }
    }
    None
}
