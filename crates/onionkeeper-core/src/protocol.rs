//! Control-protocol codec.
//!
//! The daemon speaks a line-oriented protocol: every reply line starts with a
//! three-digit status code followed by a separator (`-` for a mid-reply line,
//! `+` for a line followed by a dot-terminated data block, space for the final
//! line). Asynchronous events use the same framing with code `650`.
//!
//! ```text
//! 250-net/listeners/socks="127.0.0.1:9050"
//! 250+circuit-status=
//! 7 BUILT $A1~relay,$B2~other PURPOSE=GENERAL
//! .
//! 250 OK
//! 650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=45 TAG=requesting_descriptors
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use zeroize::Zeroizing;

/// Status code of asynchronous event replies.
pub const EVENT_CODE: u16 = 650;

/// Errors from parsing control-protocol traffic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed reply line: {0:?}")]
    MalformedLine(String),

    #[error("status code changed mid-reply: expected {expected}, got {got}")]
    CodeMismatch { expected: u16, got: u16 },

    #[error("unterminated quoted string: {0:?}")]
    UnterminatedQuote(String),
}

// ── Replies ─────────────────────────────────────────────────────────────

/// One logical line of a reply, with its data block if it had one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub text: String,
    pub data: Option<Vec<String>>,
}

/// A complete reply (or event) from the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    /// Whether the daemon accepted the command (2xx).
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Whether this is an asynchronous event rather than a command reply.
    pub fn is_event(&self) -> bool {
        self.code == EVENT_CODE
    }

    /// Text of the final line, which carries the human-readable status.
    pub fn message(&self) -> &str {
        self.lines.last().map(|l| l.text.as_str()).unwrap_or("")
    }
}

/// Incremental reply assembler.
///
/// Feed it one line at a time (with or without the trailing CRLF); it yields a
/// [`Reply`] once the final line has been seen. On error the partial reply is
/// discarded so the stream can resynchronise on the next reply.
#[derive(Debug, Default)]
pub struct ReplyParser {
    code: Option<u16>,
    lines: Vec<ReplyLine>,
    data: Option<(String, Vec<String>)>,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one line. Returns the completed reply, if this line finished one.
    pub fn push_line(&mut self, line: &str) -> Result<Option<Reply>, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some((_, block)) = self.data.as_mut() {
            if line == "." {
                if let Some((text, block)) = self.data.take() {
                    self.lines.push(ReplyLine {
                        text,
                        data: Some(block),
                    });
                }
            } else {
                // Dot-stuffed lines carry an extra leading '.'
                let unstuffed = if line.starts_with("..") { &line[1..] } else { line };
                block.push(unstuffed.to_string());
            }
            return Ok(None);
        }

        let (code, separator, text) = match split_status_line(line) {
            Some(parts) => parts,
            None => {
                *self = Self::default();
                return Err(ProtocolError::MalformedLine(line.to_string()));
            }
        };

        match self.code {
            Some(expected) if expected != code => {
                *self = Self::default();
                return Err(ProtocolError::CodeMismatch {
                    expected,
                    got: code,
                });
            }
            _ => self.code = Some(code),
        }

        match separator {
            '-' => {
                self.lines.push(ReplyLine {
                    text: text.to_string(),
                    data: None,
                });
                Ok(None)
            }
            '+' => {
                self.data = Some((text.to_string(), Vec::new()));
                Ok(None)
            }
            _ => {
                self.lines.push(ReplyLine {
                    text: text.to_string(),
                    data: None,
                });
                let reply = Reply {
                    code,
                    lines: std::mem::take(&mut self.lines),
                };
                self.code = None;
                Ok(Some(reply))
            }
        }
    }
}

fn split_status_line(line: &str) -> Option<(u16, char, &str)> {
    let code_part = line.get(..3)?;
    if !code_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code = code_part.parse().ok()?;
    let separator = line.get(3..4)?.chars().next()?;
    if !matches!(separator, '-' | '+' | ' ') {
        return None;
    }
    Some((code, separator, &line[4..]))
}

// ── Quoting ─────────────────────────────────────────────────────────────

/// Render `value` as a protocol quoted string.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Decode a value that may be a quoted string.
///
/// Unquoted values are returned as-is. For quoted values only the leading
/// quoted string is decoded; anything after its closing quote is ignored.
pub fn unquote(value: &str) -> Result<String, ProtocolError> {
    let Some(rest) = value.strip_prefix('"') else {
        return Ok(value.to_string());
    };

    let mut out = String::with_capacity(rest.len());
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Ok(out),
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => break,
            },
            c => out.push(c),
        }
    }
    Err(ProtocolError::UnterminatedQuote(value.to_string()))
}

// ── Commands ────────────────────────────────────────────────────────────

/// A command sent to the daemon.
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    /// `AUTHENTICATE <hex cookie>`
    Authenticate(Zeroizing<String>),
    /// `RESETCONF <key>...`
    ResetConf(Vec<String>),
    /// `SETCONF <key>="<value>"...` (keys may repeat to form a list)
    SetConf(Vec<(String, String)>),
    /// `GETINFO <key>...`
    GetInfo(Vec<String>),
    /// `SETEVENTS <event>...`
    SetEvents(Vec<String>),
    /// `SIGNAL <name>`
    Signal(String),
    /// `CLOSECIRCUIT <id>`
    CloseCircuit(String),
}

impl Command {
    /// The command keyword, safe to log.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Authenticate(_) => "AUTHENTICATE",
            Command::ResetConf(_) => "RESETCONF",
            Command::SetConf(_) => "SETCONF",
            Command::GetInfo(_) => "GETINFO",
            Command::SetEvents(_) => "SETEVENTS",
            Command::Signal(_) => "SIGNAL",
            Command::CloseCircuit(_) => "CLOSECIRCUIT",
        }
    }

    /// Encode as a single CRLF-terminated wire line.
    pub fn encode(&self) -> Zeroizing<String> {
        let mut line = String::from(self.verb());
        match self {
            Command::Authenticate(cookie) => {
                line.push(' ');
                line.push_str(cookie);
            }
            Command::ResetConf(words) | Command::GetInfo(words) | Command::SetEvents(words) => {
                for word in words {
                    line.push(' ');
                    line.push_str(word);
                }
            }
            Command::SetConf(pairs) => {
                for (key, value) in pairs {
                    line.push(' ');
                    line.push_str(key);
                    line.push('=');
                    line.push_str(&quote(value));
                }
            }
            Command::Signal(word) | Command::CloseCircuit(word) => {
                line.push(' ');
                line.push_str(word);
            }
        }
        line.push_str("\r\n");
        Zeroizing::new(line)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Authenticate(_) => write!(f, "Authenticate([REDACTED])"),
            Command::ResetConf(keys) => f.debug_tuple("ResetConf").field(keys).finish(),
            Command::SetConf(pairs) => f.debug_tuple("SetConf").field(pairs).finish(),
            Command::GetInfo(keys) => f.debug_tuple("GetInfo").field(keys).finish(),
            Command::SetEvents(events) => f.debug_tuple("SetEvents").field(events).finish(),
            Command::Signal(name) => f.debug_tuple("Signal").field(name).finish(),
            Command::CloseCircuit(id) => f.debug_tuple("CloseCircuit").field(id).finish(),
        }
    }
}

// ── GETINFO ─────────────────────────────────────────────────────────────

/// Extract `key=value` pairs from a `GETINFO` reply.
///
/// Values sent as data blocks are joined with `\n`. Quoted values are decoded.
pub fn parse_info(reply: &Reply) -> Result<HashMap<String, String>, ProtocolError> {
    let mut values = HashMap::new();
    for line in &reply.lines {
        let Some((key, value)) = line.text.split_once('=') else {
            continue;
        };
        let value = match &line.data {
            Some(block) => block.join("\n"),
            None => unquote(value)?,
        };
        values.insert(key.to_string(), value);
    }
    Ok(values)
}

// ── Events ──────────────────────────────────────────────────────────────

/// An asynchronous event the client cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Bootstrap progress, 0..=100.
    BootstrapProgress(u8),
    /// Whether the daemon currently has a working circuit.
    CircuitEstablished(bool),
}

/// Parse a `650` reply into an event. Anything unrecognised or malformed
/// yields `None` and is expected to be dropped.
pub fn parse_event(reply: &Reply) -> Option<ControlEvent> {
    if !reply.is_event() {
        return None;
    }
    let text = &reply.lines.first()?.text;
    let mut words = text.split_whitespace();
    if words.next()? != "STATUS_CLIENT" {
        return None;
    }
    let _severity = words.next()?;
    match words.next()? {
        "BOOTSTRAP" => {
            let progress = words
                .find_map(|w| w.strip_prefix("PROGRESS="))?
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= 100)?;
            Some(ControlEvent::BootstrapProgress(progress))
        }
        "CIRCUIT_ESTABLISHED" => Some(ControlEvent::CircuitEstablished(true)),
        "CIRCUIT_NOT_ESTABLISHED" => Some(ControlEvent::CircuitEstablished(false)),
        _ => None,
    }
}

// ── Circuits ────────────────────────────────────────────────────────────

/// Opaque daemon-assigned circuit identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CircuitId(pub String);

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// One entry of the daemon's circuit table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Circuit {
    pub id: CircuitId,
    /// `LAUNCHED`, `BUILT`, `EXTENDED`, `FAILED` or `CLOSED`.
    pub status: String,
    /// Relays as `$FINGERPRINT~nickname`, entry first.
    pub path: Vec<String>,
    pub purpose: Option<String>,
}

/// Parse the body of `GETINFO circuit-status`, one circuit per line.
pub fn parse_circuits(body: &str) -> Result<Vec<Circuit>, ProtocolError> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_circuit_line)
        .collect()
}

fn parse_circuit_line(line: &str) -> Result<Circuit, ProtocolError> {
    let mut words = line.split_whitespace();
    let (Some(id), Some(status)) = (words.next(), words.next()) else {
        return Err(ProtocolError::MalformedLine(line.to_string()));
    };

    let mut path = Vec::new();
    let mut purpose = None;
    for (i, word) in words.enumerate() {
        match word.split_once('=') {
            Some(("PURPOSE", value)) => purpose = Some(value.to_string()),
            Some(_) => {}
            None if i == 0 => path = word.split(',').map(str::to_string).collect(),
            None => {}
        }
    }

    Ok(Circuit {
        id: CircuitId(id.to_string()),
        status: status.to_string(),
        path,
        purpose,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn feed(parser: &mut ReplyParser, lines: &[&str]) -> Vec<Reply> {
        lines
            .iter()
            .filter_map(|l| parser.push_line(l).unwrap())
            .collect()
    }

    #[test]
    fn test_single_line_reply() {
        let mut parser = ReplyParser::new();
        let replies = feed(&mut parser, &["250 OK\r\n"]);
        assert_eq!(replies.len(), 1);
        assert!(replies[0].is_ok());
        assert_eq!(replies[0].message(), "OK");
    }

    #[test]
    fn test_multi_line_reply_with_data_block() {
        let mut parser = ReplyParser::new();
        let replies = feed(
            &mut parser,
            &[
                "250-version=0.4.8.9",
                "250+circuit-status=",
                "1 BUILT $AA~a,$BB~b PURPOSE=GENERAL",
                "..hidden",
                ".",
                "250 OK",
            ],
        );
        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert_eq!(reply.lines.len(), 3);
        assert_eq!(
            reply.lines[1].data.as_deref(),
            Some(
                &[
                    "1 BUILT $AA~a,$BB~b PURPOSE=GENERAL".to_string(),
                    ".hidden".to_string()
                ][..]
            )
        );
    }

    #[test]
    fn test_error_reply() {
        let mut parser = ReplyParser::new();
        let replies = feed(&mut parser, &["552 Unrecognized option: Unknown option 'Foo'"]);
        assert!(!replies[0].is_ok());
        assert_eq!(replies[0].code, 552);
    }

    #[test]
    fn test_malformed_line_resets_parser() {
        let mut parser = ReplyParser::new();
        assert!(parser.push_line("250-partial").unwrap().is_none());
        assert!(matches!(
            parser.push_line("garbage"),
            Err(ProtocolError::MalformedLine(_))
        ));
        let reply = parser.push_line("250 OK").unwrap().unwrap();
        assert_eq!(reply.lines.len(), 1);
    }

    #[test]
    fn test_code_mismatch() {
        let mut parser = ReplyParser::new();
        parser.push_line("250-a=b").unwrap();
        assert_eq!(
            parser.push_line("650 STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED"),
            Err(ProtocolError::CodeMismatch {
                expected: 250,
                got: 650
            })
        );
    }

    #[test]
    fn test_quote_and_unquote() {
        let raw = r#"obfs4 1.2.3.4:443 cert="x\y""#;
        let quoted = quote(raw);
        assert_eq!(quoted, r#""obfs4 1.2.3.4:443 cert=\"x\\y\"""#);
        assert_eq!(unquote(&quoted).unwrap(), raw);
        assert_eq!(unquote("plain").unwrap(), "plain");
        assert_eq!(unquote(r#""first" "second""#).unwrap(), "first");
        assert!(unquote(r#""open"#).is_err());
    }

    #[test]
    fn test_setconf_encoding() {
        let cmd = Command::SetConf(vec![
            ("UseBridges".to_string(), "1".to_string()),
            ("Bridge".to_string(), "obfs4 1.2.3.4:443 FP".to_string()),
        ]);
        assert_eq!(
            cmd.encode().as_str(),
            "SETCONF UseBridges=\"1\" Bridge=\"obfs4 1.2.3.4:443 FP\"\r\n"
        );
    }

    #[test]
    fn test_authenticate_debug_is_redacted() {
        let cmd = Command::Authenticate(Zeroizing::new("DEADBEEF".to_string()));
        assert_eq!(cmd.encode().as_str(), "AUTHENTICATE DEADBEEF\r\n");
        assert!(!format!("{cmd:?}").contains("DEADBEEF"));
    }

    #[test]
    fn test_parse_info() {
        let mut parser = ReplyParser::new();
        let reply = feed(
            &mut parser,
            &[
                "250-net/listeners/socks=\"127.0.0.1:9050\" \"[::1]:9050\"",
                "250-net/listeners/dns=",
                "250 OK",
            ],
        )
        .remove(0);
        let info = parse_info(&reply).unwrap();
        assert_eq!(info["net/listeners/socks"], "127.0.0.1:9050");
        assert_eq!(info["net/listeners/dns"], "");
        assert_eq!(info.len(), 2);
    }

    #[test]
    fn test_parse_bootstrap_event() {
        let mut parser = ReplyParser::new();
        let reply = feed(
            &mut parser,
            &["650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=45 TAG=loading SUMMARY=\"Loading\""],
        )
        .remove(0);
        assert_eq!(
            parse_event(&reply),
            Some(ControlEvent::BootstrapProgress(45))
        );
    }

    #[test]
    fn test_parse_circuit_events() {
        let mut parser = ReplyParser::new();
        let up = feed(&mut parser, &["650 STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED"]).remove(0);
        let down = feed(
            &mut parser,
            &["650 STATUS_CLIENT NOTICE CIRCUIT_NOT_ESTABLISHED REASON=CLOCK_JUMPED"],
        )
        .remove(0);
        assert_eq!(parse_event(&up), Some(ControlEvent::CircuitEstablished(true)));
        assert_eq!(
            parse_event(&down),
            Some(ControlEvent::CircuitEstablished(false))
        );
    }

    #[test]
    fn test_malformed_events_are_dropped() {
        let mut parser = ReplyParser::new();
        for line in [
            "650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=abc",
            "650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=101",
            "650 STATUS_CLIENT NOTICE BOOTSTRAP",
            "650 CIRC 1 BUILT",
            "650 STATUS_GENERAL NOTICE CLOCK_SKEW",
        ] {
            let reply = feed(&mut parser, &[line]).remove(0);
            assert_eq!(parse_event(&reply), None, "{line}");
        }
    }

    #[test]
    fn test_parse_circuits() {
        let body = "7 BUILT $AA~alpha,$BB~beta,$CC~gamma BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL\n\
                    8 LAUNCHED BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL\n";
        let circuits = parse_circuits(body).unwrap();
        assert_eq!(circuits.len(), 2);
        assert_eq!(circuits[0].id, CircuitId("7".to_string()));
        assert_eq!(circuits[0].path.len(), 3);
        assert_eq!(circuits[0].purpose.as_deref(), Some("GENERAL"));
        assert_eq!(circuits[1].status, "LAUNCHED");
        assert!(circuits[1].path.is_empty());
    }

    #[test]
    fn test_parse_circuits_empty() {
        assert!(parse_circuits("").unwrap().is_empty());
        assert!(parse_circuits("onlyid").is_err());
    }
}
