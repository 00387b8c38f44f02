//! Build recipe parser.
//!
//! Parses a Stratafile (Dockerfile syntax) into an ordered list of steps.
//! Supports line continuations (`\`), comments, quoted operands and both
//! shell and JSON (exec) forms for CMD/ENTRYPOINT/RUN.

use serde::Serialize;
use std::collections::HashMap;

use strata_core::error::{Result, StrataError};

use crate::image::PortSpec;

const FROM_GRAMMAR: &str = "FROM <image>[:<tag>] [AS <name>]";
const ENV_GRAMMAR: &str = "ENV <key>=<value> ... | ENV <key> <value>";
const RUN_GRAMMAR: &str = "RUN [--no-cache] <command> | RUN [\"executable\", \"param\", ...]";
const COPY_GRAMMAR: &str = "COPY [--chown=<user>[:<group>]] <src>... <dest>";
const WORKDIR_GRAMMAR: &str = "WORKDIR <path>";
const USER_GRAMMAR: &str = "USER <user>[:<group>]";
const CMD_GRAMMAR: &str = "CMD [\"executable\", \"param\", ...] | CMD <command>";
const ENTRYPOINT_GRAMMAR: &str =
    "ENTRYPOINT [\"executable\", \"param\", ...] | ENTRYPOINT <command>";
const EXPOSE_GRAMMAR: &str = "EXPOSE <port>[/<protocol>]...";
const LABEL_GRAMMAR: &str = "LABEL <key>=<value> ...";
const ARG_GRAMMAR: &str = "ARG <name>[=<default>]";

/// A single recipe instruction.
///
/// The serialized form is what the layer cache hashes, so field names and
/// variant tags are part of the cache key format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Instruction {
    /// `FROM <image>[:<tag>] [AS <alias>]`
    From {
        reference: String,
        alias: Option<String>,
    },
    /// `ENV <key>=<value> ...`
    Env { vars: Vec<(String, String)> },
    /// `RUN [--no-cache] <command>`
    Run { command: String, no_cache: bool },
    /// `COPY [--chown=..] <src>... <dest>`
    Copy {
        sources: Vec<String>,
        dest: String,
        chown: Option<String>,
    },
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `USER <user>[:<group>]`
    User { user: String },
    /// `CMD ["exec", "form"]` or `CMD command`
    Cmd { exec: Vec<String> },
    /// `EXPOSE <port>[/<proto>] ...`
    Expose { ports: Vec<PortSpec> },
    /// `ENTRYPOINT ["exec", "form"]` or `ENTRYPOINT command`
    Entrypoint { exec: Vec<String> },
    /// `LABEL <key>=<value> ...`
    Label { labels: Vec<(String, String)> },
    /// `ARG <name>[=<default>]`
    Arg {
        name: String,
        default: Option<String>,
    },
}

impl Instruction {
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Env { .. } => "ENV",
            Instruction::Run { .. } => "RUN",
            Instruction::Copy { .. } => "COPY",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::User { .. } => "USER",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::Label { .. } => "LABEL",
            Instruction::Arg { .. } => "ARG",
        }
    }

    /// Whether the instruction only touches image metadata.
    pub fn is_metadata_only(&self) -> bool {
        !matches!(
            self,
            Instruction::From { .. } | Instruction::Run { .. } | Instruction::Copy { .. }
        )
    }

    /// Substitute `${NAME}` / `$NAME` build arguments into operands.
    ///
    /// RUN, CMD and ENTRYPOINT are left alone: the shell sees declared
    /// arguments as environment variables instead.
    pub fn expand(&self, args: &HashMap<String, String>) -> Instruction {
        if args.is_empty() {
            return self.clone();
        }
        let x = |s: &str| expand_vars(s, args);
        let pairs = |v: &[(String, String)]| -> Vec<(String, String)> {
            v.iter().map(|(k, val)| (k.clone(), x(val))).collect()
        };
        match self {
            Instruction::From { reference, alias } => Instruction::From {
                reference: x(reference),
                alias: alias.clone(),
            },
            Instruction::Env { vars } => Instruction::Env { vars: pairs(vars) },
            Instruction::Copy {
                sources,
                dest,
                chown,
            } => Instruction::Copy {
                sources: sources.iter().map(|s| x(s)).collect(),
                dest: x(dest),
                chown: chown.as_deref().map(x),
            },
            Instruction::Workdir { path } => Instruction::Workdir { path: x(path) },
            Instruction::User { user } => Instruction::User { user: x(user) },
            Instruction::Label { labels } => Instruction::Label {
                labels: pairs(labels),
            },
            Instruction::Arg { name, default } => Instruction::Arg {
                name: name.clone(),
                default: default.as_deref().map(x),
            },
            other => other.clone(),
        }
    }
}

/// Split an image reference into `(name, tag)`; the tag defaults to `latest`.
///
/// A `:` before the last `/` belongs to a registry host, not the tag.
pub fn split_reference(reference: &str) -> (String, String) {
    let name_start = reference.rfind('/').map(|p| p + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(pos) => {
            let split = name_start + pos;
            (
                reference[..split].to_string(),
                reference[split + 1..].to_string(),
            )
        }
        None => (reference.to_string(), "latest".to_string()),
    }
}

/// One instruction with its position in the recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// 1-based position among instructions.
    pub index: usize,
    /// 1-based line the instruction starts on.
    pub line: usize,
    /// The logical source line, continuations joined.
    pub text: String,
    pub instruction: Instruction,
}

/// A parsed recipe.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub steps: Vec<Step>,
}

impl Recipe {
    /// Parse a recipe from its text content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut steps = Vec::new();

        for (line, text) in join_continuation_lines(content) {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let instruction = parse_instruction(trimmed, line)?;
            steps.push(Step {
                index: steps.len() + 1,
                line,
                text: trimmed.to_string(),
                instruction,
            });
        }

        // First non-ARG instruction must be FROM
        match steps
            .iter()
            .find(|s| !matches!(s.instruction, Instruction::Arg { .. }))
        {
            Some(step) if matches!(step.instruction, Instruction::From { .. }) => {}
            Some(step) => {
                return Err(syntax(
                    step.line,
                    format!(
                        "{} before FROM; a recipe must start with FROM (optionally preceded by ARG)",
                        step.instruction.keyword()
                    ),
                    FROM_GRAMMAR,
                ))
            }
            None => {
                return Err(syntax(
                    content.lines().count().max(1),
                    "recipe contains no FROM instruction",
                    FROM_GRAMMAR,
                ))
            }
        }

        Ok(Recipe { steps })
    }

    /// Parse a recipe from a file path.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Other(format!(
                "Failed to read recipe at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Parse recipe text into its ordered steps.
pub fn parse(content: &str) -> Result<Vec<Step>> {
    Recipe::parse(content).map(|r| r.steps)
}

fn syntax(line: usize, message: impl Into<String>, expected: &str) -> StrataError {
    StrataError::Syntax {
        line,
        message: message.into(),
        expected: expected.to_string(),
    }
}

/// Join lines ending with `\` into logical lines, keeping the number of
/// the first physical line. Comment lines inside a continuation are dropped.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (idx, line) in content.lines().enumerate() {
        let line_num = idx + 1;
        if current.is_empty() {
            start = line_num;
        } else if line.trim_start().starts_with('#') {
            continue;
        }

        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped.trim_end());
            current.push(' ');
        } else {
            current.push_str(line);
            logical_lines.push((start, std::mem::take(&mut current)));
        }
    }

    // Trailing continuation without a final line
    if !current.trim().is_empty() {
        logical_lines.push((start, current));
    }

    logical_lines
}

/// Parse a single logical line into an Instruction.
fn parse_instruction(line: &str, line_num: usize) -> Result<Instruction> {
    let (keyword, rest) = split_first_word(line);

    match keyword.to_uppercase().as_str() {
        "FROM" => parse_from(rest, line_num),
        "ENV" => parse_env(rest, line_num),
        "RUN" => parse_run(rest, line_num),
        "COPY" => parse_copy(rest, line_num),
        "WORKDIR" => parse_workdir(rest, line_num),
        "USER" => parse_user(rest, line_num),
        "CMD" => parse_exec_form(rest, line_num, CMD_GRAMMAR).map(|exec| Instruction::Cmd { exec }),
        "ENTRYPOINT" => parse_exec_form(rest, line_num, ENTRYPOINT_GRAMMAR)
            .map(|exec| Instruction::Entrypoint { exec }),
        "EXPOSE" => parse_expose(rest, line_num),
        "LABEL" => parse_label(rest, line_num),
        "ARG" => parse_arg(rest, line_num),
        _ => Err(StrataError::UnknownInstruction {
            line: line_num,
            keyword: keyword.to_string(),
        }),
    }
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

// --- Individual instruction parsers ---

fn parse_from(rest: &str, line_num: usize) -> Result<Instruction> {
    let words = split_words(rest).map_err(|e| syntax(line_num, e, FROM_GRAMMAR))?;
    match words.as_slice() {
        [reference] => Ok(Instruction::From {
            reference: reference.clone(),
            alias: None,
        }),
        [reference, kw, alias] if kw.eq_ignore_ascii_case("AS") => Ok(Instruction::From {
            reference: reference.clone(),
            alias: Some(alias.clone()),
        }),
        [] => Err(syntax(line_num, "FROM requires an image", FROM_GRAMMAR)),
        _ => Err(syntax(
            line_num,
            format!("unexpected operands '{}'", rest),
            FROM_GRAMMAR,
        )),
    }
}

fn parse_env(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(syntax(line_num, "ENV requires a key and value", ENV_GRAMMAR));
    }

    let (first, remainder) = split_first_word(rest);
    if !first.contains('=') {
        // Legacy form: ENV KEY VALUE
        if remainder.is_empty() {
            return Err(syntax(
                line_num,
                format!("ENV '{}' has no value", first),
                ENV_GRAMMAR,
            ));
        }
        return Ok(Instruction::Env {
            vars: vec![(first.to_string(), unquote(remainder))],
        });
    }

    let vars = parse_pairs(rest, line_num, ENV_GRAMMAR)?;
    Ok(Instruction::Env { vars })
}

fn parse_run(rest: &str, line_num: usize) -> Result<Instruction> {
    let (no_cache, rest) = match split_first_word(rest) {
        ("--no-cache", after) => (true, after),
        _ => (false, rest),
    };
    if rest.is_empty() {
        return Err(syntax(line_num, "RUN requires a command", RUN_GRAMMAR));
    }

    // JSON array form is joined into a shell command
    let command = if rest.starts_with('[') {
        parse_json_array(rest, line_num, RUN_GRAMMAR)?.join(" ")
    } else {
        rest.to_string()
    };

    Ok(Instruction::Run { command, no_cache })
}

fn parse_copy(rest: &str, line_num: usize) -> Result<Instruction> {
    let mut words = split_words(rest).map_err(|e| syntax(line_num, e, COPY_GRAMMAR))?;

    let mut chown = None;
    while words.first().map(|w| w.starts_with("--")).unwrap_or(false) {
        let flag = words.remove(0);
        match flag.strip_prefix("--chown=") {
            Some(owner) if !owner.is_empty() => chown = Some(owner.to_string()),
            _ => {
                return Err(syntax(
                    line_num,
                    format!("unsupported COPY flag '{}'", flag),
                    COPY_GRAMMAR,
                ))
            }
        }
    }

    match words.pop() {
        Some(dest) if !words.is_empty() => Ok(Instruction::Copy {
            sources: words,
            dest,
            chown,
        }),
        _ => Err(syntax(
            line_num,
            "COPY requires at least one source and a destination",
            COPY_GRAMMAR,
        )),
    }
}

fn parse_workdir(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(syntax(line_num, "WORKDIR requires a path", WORKDIR_GRAMMAR));
    }
    Ok(Instruction::Workdir {
        path: unquote(rest),
    })
}

fn parse_user(rest: &str, line_num: usize) -> Result<Instruction> {
    let words = split_words(rest).map_err(|e| syntax(line_num, e, USER_GRAMMAR))?;
    match words.as_slice() {
        [user] if !user.starts_with(':') && !user.ends_with(':') => {
            Ok(Instruction::User { user: user.clone() })
        }
        [] => Err(syntax(line_num, "USER requires a user", USER_GRAMMAR)),
        _ => Err(syntax(
            line_num,
            format!("invalid user '{}'", rest),
            USER_GRAMMAR,
        )),
    }
}

fn parse_exec_form(rest: &str, line_num: usize, grammar: &str) -> Result<Vec<String>> {
    if rest.is_empty() {
        return Err(syntax(line_num, "a command is required", grammar));
    }
    if rest.starts_with('[') {
        let exec = parse_json_array(rest, line_num, grammar)?;
        if exec.is_empty() {
            return Err(syntax(line_num, "exec form must not be empty", grammar));
        }
        Ok(exec)
    } else {
        // Shell form: wrap in sh -c
        Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            rest.to_string(),
        ])
    }
}

fn parse_expose(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(syntax(line_num, "EXPOSE requires a port", EXPOSE_GRAMMAR));
    }
    let ports = rest
        .split_whitespace()
        .map(|word| word.parse::<PortSpec>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| syntax(line_num, e, EXPOSE_GRAMMAR))?;
    Ok(Instruction::Expose { ports })
}

fn parse_label(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(syntax(line_num, "LABEL requires key=value", LABEL_GRAMMAR));
    }
    let labels = parse_pairs(rest, line_num, LABEL_GRAMMAR)?;
    Ok(Instruction::Label { labels })
}

fn parse_arg(rest: &str, line_num: usize) -> Result<Instruction> {
    let words = split_words(rest).map_err(|e| syntax(line_num, e, ARG_GRAMMAR))?;
    let word = match words.as_slice() {
        [word] => word,
        [] => return Err(syntax(line_num, "ARG requires a name", ARG_GRAMMAR)),
        _ => {
            return Err(syntax(
                line_num,
                "ARG declares exactly one name",
                ARG_GRAMMAR,
            ))
        }
    };

    let (name, default) = match word.split_once('=') {
        Some((name, default)) => (name.to_string(), Some(default.to_string())),
        None => (word.clone(), None),
    };
    if !is_identifier(&name) {
        return Err(syntax(
            line_num,
            format!("invalid ARG name '{}'", name),
            ARG_GRAMMAR,
        ));
    }
    Ok(Instruction::Arg { name, default })
}

// --- Helpers ---

/// Parse `k=v k2="v 2"` into ordered pairs.
fn parse_pairs(rest: &str, line_num: usize, grammar: &str) -> Result<Vec<(String, String)>> {
    let words = split_words(rest).map_err(|e| syntax(line_num, e, grammar))?;
    words
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(syntax(
                line_num,
                format!("expected key=value, got '{}'", word),
                grammar,
            )),
        })
        .collect()
}

/// Parse a JSON array string like `["a", "b", "c"]` into a Vec<String>.
fn parse_json_array(s: &str, line_num: usize, grammar: &str) -> Result<Vec<String>> {
    serde_json::from_str(s)
        .map_err(|e| syntax(line_num, format!("invalid JSON array '{}': {}", s, e), grammar))
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Whitespace split that keeps quoted runs together and strips the quotes.
/// A backslash inside double quotes escapes the next character.
fn split_words(s: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some('"') if c == '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if let Some(q) = quote {
        return Err(format!("unterminated {} quote", q));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Expand `${NAME}` and `$NAME`; unknown names are left as written.
fn expand_vars(s: &str, args: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(inner) = after.strip_prefix('{') {
            match inner.find('}') {
                Some(end) => (&inner[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match args.get(name) {
            Some(value) if !name.is_empty() => {
                out.push_str(value);
                rest = &after[consumed..];
            }
            _ => {
                out.push('$');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}
