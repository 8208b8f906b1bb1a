//! Chat protocol command parser and reply generator.
//!
//! Recognized input, checked in this order:
//! - `/time` prefix: server timestamp
//! - `/quit` prefix: close the connection
//! - `/echo <text>`: reply with `<text>`
//! - `hello` (any case): greeting
//! - empty line: prompt
//! - `bye` (any case): farewell, close the connection
//!
//! Anything else is chat and is echoed back, truncated if too long.

use bytes::{Bytes, BytesMut};

/// Timestamp layout shared by `/time` replies and log records.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const QUIT_REPLY: &[u8] = b"Closing connection...\n";
const GREETING_REPLY: &[u8] = b"Hi, there!\n";
const EMPTY_REPLY: &[u8] = b"Say something...\n";
const FAREWELL_REPLY: &[u8] = b"So long, and thanks for all the fish!\n";
const TRUNCATED_WARNING: &[u8] = b"[!] Message truncated\n";

/// One parsed line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Report the server clock
    Time,
    /// Close the connection
    Quit,
    /// Reply with the text after `/echo `
    Echo(&'a [u8]),
    /// `hello`
    Greeting,
    /// Blank line
    Empty,
    /// `bye`
    Farewell,
    /// Anything else, already cut to the message size limit
    Chat { text: &'a [u8], truncated: bool },
}

/// Whether the connection loop keeps reading after the reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Continue,
    Terminate,
}

/// Reply to send (if any) and what the connection does next
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub reply: Option<Bytes>,
    pub next: Next,
}

impl Outcome {
    fn reply(data: impl Into<Bytes>, next: Next) -> Self {
        Outcome {
            reply: Some(data.into()),
            next,
        }
    }
}

/// Strip leading and trailing ASCII whitespace, including the line ending.
pub fn trim(line: &[u8]) -> &[u8] {
    line.trim_ascii()
}

impl<'a> Command<'a> {
    /// Classify an already trimmed line.
    ///
    /// Only chat text is subject to `max_message_size`; commands and
    /// keywords pass through whole.
    pub fn parse(line: &'a [u8], max_message_size: usize) -> Command<'a> {
        if line.starts_with(b"/time") {
            return Command::Time;
        }
        if line.starts_with(b"/quit") {
            return Command::Quit;
        }
        if let Some(text) = line.strip_prefix(b"/echo ") {
            return Command::Echo(text);
        }
        if line.eq_ignore_ascii_case(b"hello") {
            return Command::Greeting;
        }
        if line.is_empty() {
            return Command::Empty;
        }
        if line.eq_ignore_ascii_case(b"bye") {
            return Command::Farewell;
        }

        if line.len() > max_message_size {
            Command::Chat {
                text: &line[..max_message_size],
                truncated: true,
            }
        } else {
            Command::Chat {
                text: line,
                truncated: false,
            }
        }
    }

    /// Produce the reply and continuation for this command.
    pub fn execute(&self) -> Outcome {
        match self {
            Command::Time => {
                let now = chrono::Local::now().format(TIMESTAMP_FORMAT);
                Outcome::reply(format!("{}\n", now), Next::Continue)
            }
            Command::Quit => Outcome::reply(QUIT_REPLY, Next::Terminate),
            Command::Echo(text) => Outcome::reply(line_of(&[], text), Next::Continue),
            Command::Greeting => Outcome::reply(GREETING_REPLY, Next::Continue),
            Command::Empty => Outcome::reply(EMPTY_REPLY, Next::Continue),
            Command::Farewell => Outcome::reply(FAREWELL_REPLY, Next::Terminate),
            Command::Chat { text, truncated } => {
                let prefix: &[u8] = if *truncated { TRUNCATED_WARNING } else { &[] };
                Outcome::reply(line_of(prefix, text), Next::Continue)
            }
        }
    }
}

/// `prefix` followed by `text` and a newline
fn line_of(prefix: &[u8], text: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(prefix.len() + text.len() + 1);
    out.extend_from_slice(prefix);
    out.extend_from_slice(text);
    out.extend_from_slice(b"\n");
    out
}
