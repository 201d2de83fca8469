//! STOMP 1.2 frame model and text codec for the realtime chat transport.
//!
//! This crate owns the wire representation spoken over both the SockJS and the
//! raw WebSocket transports. Frames are text: a command line, header lines, a
//! blank line, a body, and a NUL terminator. Bare EOLs between frames are
//! heart-beats.
//!
//! The [`Decoder`] is incremental because a single WebSocket message may carry
//! several frames, a heart-beat, or (rarely) half a frame.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Error returned while decoding STOMP text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The command line is not a STOMP 1.2 command.
    #[error("unknown STOMP command: {0}")]
    UnknownCommand(String),
    /// A header line has no `:` separator.
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    /// A header contains an escape sequence STOMP 1.2 does not define.
    #[error("invalid header escape sequence in: {0}")]
    InvalidEscape(String),
    /// `content-length` is not a non-negative integer.
    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),
    /// The byte after a `content-length` body is not NUL.
    #[error("frame body is not NUL-terminated")]
    MissingTerminator,
    /// [`decode_frame`] was given text that does not hold one complete frame.
    #[error("incomplete frame")]
    Incomplete,
    /// [`decode_frame`] was given more than one frame.
    #[error("unexpected trailing data after frame")]
    TrailingData,
    /// A [`Decoder`] buffered more than its limit without completing a frame.
    #[error("frame exceeds {limit} buffered bytes")]
    FrameTooLarge { limit: usize },
}

/// STOMP 1.2 frame commands, client and server side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Wire spelling of the command.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// `CONNECT`, `STOMP` and `CONNECTED` frames carry headers verbatim.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let command = match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(CodecError::UnknownCommand(other.to_owned())),
        };
        Ok(command)
    }
}

/// A single STOMP frame.
///
/// Headers keep their wire order. Repeated header names are allowed; per
/// STOMP 1.2 only the first occurrence is significant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    /// Create a frame with no headers and an empty body.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header, builder style.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body, builder style.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `name`, if present.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// One item produced by the [`Decoder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Item {
    Frame(Frame),
    HeartBeat,
}

/// Encode a frame into STOMP text, including the NUL terminator.
///
/// A `content-length` header is added when the frame has a body and does not
/// already carry one.
#[must_use]
pub fn encode_frame(frame: &Frame) -> String {
    let escape = frame.command.escapes_headers();
    let mut out = String::with_capacity(frame.body.len() + 64);
    out.push_str(frame.command.as_str());
    out.push('\n');
    for (name, value) in &frame.headers {
        push_header_part(&mut out, name, escape);
        out.push(':');
        push_header_part(&mut out, value, escape);
        out.push('\n');
    }
    if !frame.body.is_empty() && frame.header("content-length").is_none() {
        out.push_str("content-length:");
        out.push_str(&frame.body.len().to_string());
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

/// Decode exactly one frame from STOMP text.
///
/// Leading heart-beat EOLs are skipped; trailing EOLs after the NUL are allowed.
///
/// # Errors
///
/// Returns [`CodecError::Incomplete`] when the text ends before the frame does,
/// [`CodecError::TrailingData`] when a second frame follows, and the other
/// variants for malformed frames.
pub fn decode_frame(text: &str) -> Result<Frame, CodecError> {
    let mut decoder = Decoder::new();
    decoder.push(text);
    loop {
        match decoder.next_item() {
            Some(Ok(Item::HeartBeat)) => {}
            Some(Ok(Item::Frame(frame))) => {
                if decoder.buffer.trim_start_matches(['\r', '\n']).is_empty() {
                    return Ok(frame);
                }
                return Err(CodecError::TrailingData);
            }
            Some(Err(error)) => return Err(error),
            None => return Err(CodecError::Incomplete),
        }
    }
}

/// Default cap on text buffered for one incomplete frame.
pub const DEFAULT_MAX_BUFFERED: usize = 1024 * 1024;

/// Incremental STOMP decoder.
#[derive(Debug)]
pub struct Decoder {
    buffer: String,
    max_buffered: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_BUFFERED)
    }
}

impl Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that gives up on a frame once `max_buffered` bytes are pending.
    #[must_use]
    pub fn with_limit(max_buffered: usize) -> Self {
        Self {
            buffer: String::new(),
            max_buffered,
        }
    }

    /// Append received text.
    pub fn push(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
    }

    /// Number of buffered bytes not yet decoded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete item, or `None` if more text is needed.
    ///
    /// A frame that fails to decode is skipped through its NUL terminator;
    /// frames after it in the buffer are still returned. An incomplete frame
    /// larger than the limit is discarded with [`CodecError::FrameTooLarge`].
    pub fn next_item(&mut self) -> Option<Result<Item, CodecError>> {
        if self.buffer.starts_with('\n') {
            self.buffer.drain(..1);
            return Some(Ok(Item::HeartBeat));
        }
        if self.buffer.starts_with("\r\n") {
            self.buffer.drain(..2);
            return Some(Ok(Item::HeartBeat));
        }
        if self.buffer.is_empty() {
            return None;
        }

        match self.split_frame() {
            Ok(Some((frame, consumed))) => {
                self.buffer.drain(..consumed);
                Some(Ok(Item::Frame(frame)))
            }
            Ok(None) if self.buffer.len() > self.max_buffered => {
                self.buffer.clear();
                Some(Err(CodecError::FrameTooLarge {
                    limit: self.max_buffered,
                }))
            }
            Ok(None) => None,
            Err(error) => {
                self.skip_frame();
                Some(Err(error))
            }
        }
    }

    /// Drop text up to and including the next NUL, or everything if none.
    fn skip_frame(&mut self) {
        match self.buffer.find('\0') {
            Some(nul) => {
                self.buffer.drain(..=nul);
            }
            None => self.buffer.clear(),
        }
    }

    fn split_frame(&self) -> Result<Option<(Frame, usize)>, CodecError> {
        let Some((head_end, body_start)) = find_head_end(&self.buffer) else {
            return Ok(None);
        };
        let (command, headers) = parse_head(&self.buffer[..head_end])?;

        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .map(|(_, value)| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| CodecError::InvalidContentLength(value.clone()))
            })
            .transpose()?;

        let rest = &self.buffer[body_start..];
        let body_len = if let Some(len) = content_length {
            if rest.len() <= len {
                return Ok(None);
            }
            if !rest.is_char_boundary(len) || rest.as_bytes()[len] != 0 {
                return Err(CodecError::MissingTerminator);
            }
            len
        } else {
            let Some(nul) = rest.find('\0') else {
                return Ok(None);
            };
            nul
        };

        let frame = Frame {
            command,
            headers,
            body: rest[..body_len].to_owned(),
        };
        Ok(Some((frame, body_start + body_len + 1)))
    }
}

/// Heart-beat intervals in milliseconds; zero means "none".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartBeat {
    /// Smallest interval at which the sender can emit heart-beats.
    pub outgoing: u64,
    /// Desired interval at which the sender wants to receive heart-beats.
    pub incoming: u64,
}

impl HeartBeat {
    #[must_use]
    pub fn new(outgoing: u64, incoming: u64) -> Self {
        Self { outgoing, incoming }
    }

    /// Parse a `heart-beat` header value such as `"10000,10000"`.
    ///
    /// Missing or malformed values mean no heart-beating.
    #[must_use]
    pub fn parse(value: Option<&str>) -> Self {
        let Some((outgoing, incoming)) = value.and_then(|v| v.split_once(',')) else {
            return Self::default();
        };
        Self {
            outgoing: outgoing.trim().parse().unwrap_or(0),
            incoming: incoming.trim().parse().unwrap_or(0),
        }
    }

    /// Header value for this setting.
    #[must_use]
    pub fn to_header(self) -> String {
        format!("{},{}", self.outgoing, self.incoming)
    }

    /// Agree on effective intervals between our settings and the server's.
    ///
    /// The result's `outgoing` is how often we must send, `incoming` how often
    /// we should expect data from the server.
    #[must_use]
    pub fn negotiate(self, server: HeartBeat) -> Self {
        let outgoing = if self.outgoing == 0 || server.incoming == 0 {
            0
        } else {
            self.outgoing.max(server.incoming)
        };
        let incoming = if self.incoming == 0 || server.outgoing == 0 {
            0
        } else {
            self.incoming.max(server.outgoing)
        };
        Self { outgoing, incoming }
    }

    /// `outgoing` as a [`Duration`], or `None` when disabled.
    #[must_use]
    pub fn send_every(self) -> Option<Duration> {
        (self.outgoing > 0).then(|| Duration::from_millis(self.outgoing))
    }

    /// `incoming` as a [`Duration`], or `None` when disabled.
    #[must_use]
    pub fn expect_every(self) -> Option<Duration> {
        (self.incoming > 0).then(|| Duration::from_millis(self.incoming))
    }
}

/// Locate the blank line ending the head. Returns `(head_len, body_start)`.
fn find_head_end(buffer: &str) -> Option<(usize, usize)> {
    let bytes = buffer.as_bytes();
    let mut index = 0;
    while let Some(offset) = buffer[index..].find('\n') {
        let newline = index + offset;
        let next = newline + 1;
        if bytes.get(next) == Some(&b'\n') {
            return Some((newline, next + 1));
        }
        if bytes.get(next) == Some(&b'\r') && bytes.get(next + 1) == Some(&b'\n') {
            return Some((newline, next + 2));
        }
        index = next;
    }
    None
}

fn parse_head(head: &str) -> Result<(Command, Vec<(String, String)>), CodecError> {
    let mut lines = head.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));
    let command = lines.next().unwrap_or_default().parse::<Command>()?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(CodecError::MalformedHeader(line.to_owned()));
        };
        if escaped {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_owned(), value.to_owned()));
        }
    }
    Ok((command, headers))
}

fn push_header_part(out: &mut String, part: &str, escape: bool) {
    if !escape {
        out.push_str(part);
        return;
    }
    for ch in part.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
}

fn unescape(raw: &str) -> Result<String, CodecError> {
    if !raw.contains('\\') {
        return Ok(raw.to_owned());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            _ => return Err(CodecError::InvalidEscape(raw.to_owned())),
        }
    }
    Ok(out)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
