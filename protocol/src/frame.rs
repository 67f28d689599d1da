//! Binary-safe text framing.
//!
//! Grammar: `[<trigger-digits>] '/' <COMMAND-NAME> (' ' <arg>)* '\n'`, each
//! `<arg>` being `<decimal-length> ':' <raw-bytes>`. Length-prefixed argument
//! bytes may contain anything, including `\n`, `:` and `/`. The parser keeps
//! its state across calls, so the dispatched command sequence is identical no
//! matter how the input bytes are chunked.

use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single declared argument, to keep a malicious peer from
/// asking us to buffer the moon.
pub const MAX_ARG_LEN: usize = 64 * 1024 * 1024;
const MAX_NAME_LEN: usize = 64;
const MAX_ARGS: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Malformed frame. The connection is dropped silently, not answered.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Case-insensitive on the wire; normalized to uppercase here.
    pub name: String,
    pub args: Vec<Vec<u8>>,
    /// Response trigger supplied by the peer, if it expects a reply.
    pub trigger: Option<u64>,
}

impl Command {
    pub fn new(name: &str, args: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.to_ascii_uppercase(),
            args,
            trigger: None,
        }
    }

    pub fn with_trigger(name: &str, args: Vec<Vec<u8>>, trigger: u64) -> Self {
        Self {
            trigger: Some(trigger),
            ..Self::new(name, args)
        }
    }

    /// Argument `i` as UTF-8, for the many commands whose args are text.
    pub fn arg_str(&self, i: usize) -> Result<&str, crate::CmdError> {
        let arg = self
            .args
            .get(i)
            .ok_or_else(|| crate::CmdError::invalid_argument(format!("missing argument {i}")))?;
        std::str::from_utf8(arg)
            .map_err(|_| crate::CmdError::invalid_argument(format!("argument {i} is not UTF-8")))
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        if let Some(t) = self.trigger {
            dst.put_slice(t.to_string().as_bytes());
        }
        dst.put_u8(b'/');
        dst.put_slice(self.name.as_bytes());
        for arg in &self.args {
            dst.put_u8(b' ');
            dst.put_slice(arg.len().to_string().as_bytes());
            dst.put_u8(b':');
            dst.put_slice(arg);
        }
        dst.put_u8(b'\n');
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.to_vec()
    }
}

enum State {
    Initial,
    ResponseTrigger,
    CommandName,
    ArgumentSize,
    ArgumentData,
}

/// Incremental frame parser. Feed it arbitrary chunks; completed commands are
/// pushed to the output queue in wire order.
pub struct Parser {
    state: State,
    trigger: u64,
    has_trigger: bool,
    name: Vec<u8>,
    args: Vec<Vec<u8>>,
    size: usize,
    size_seen: bool,
    data: Vec<u8>,
    remaining: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: State::Initial,
            trigger: 0,
            has_trigger: false,
            name: Vec::new(),
            args: Vec::new(),
            size: 0,
            size_seen: false,
            data: Vec::new(),
            remaining: 0,
        }
    }

    pub fn feed(&mut self, input: &[u8], out: &mut VecDeque<Command>) -> Result<(), WireError> {
        let mut i = 0;
        while i < input.len() {
            let b = input[i];
            match self.state {
                State::Initial => {
                    // Garbage tolerance: skip anything that cannot start a frame.
                    if b.is_ascii_digit() {
                        self.trigger = (b - b'0') as u64;
                        self.has_trigger = true;
                        self.state = State::ResponseTrigger;
                    } else if b == b'/' {
                        self.state = State::CommandName;
                    }
                    i += 1;
                }
                State::ResponseTrigger => {
                    if b.is_ascii_digit() {
                        self.trigger = self
                            .trigger
                            .checked_mul(10)
                            .and_then(|t| t.checked_add((b - b'0') as u64))
                            .ok_or(WireError::ProtocolViolation("trigger overflow"))?;
                    } else if b == b'/' {
                        self.state = State::CommandName;
                    } else {
                        return Err(WireError::ProtocolViolation("non-digit in trigger"));
                    }
                    i += 1;
                }
                State::CommandName => {
                    if b == b' ' || b == b'\n' {
                        if self.name.is_empty() {
                            return Err(WireError::ProtocolViolation("empty command name"));
                        }
                        if b == b'\n' {
                            self.finish(out)?;
                        } else {
                            self.state = State::ArgumentSize;
                        }
                    } else {
                        if self.name.len() >= MAX_NAME_LEN {
                            return Err(WireError::ProtocolViolation("command name too long"));
                        }
                        self.name.push(b.to_ascii_uppercase());
                    }
                    i += 1;
                }
                State::ArgumentSize => {
                    if b.is_ascii_digit() {
                        self.size_seen = true;
                        self.size = self
                            .size
                            .checked_mul(10)
                            .and_then(|s| s.checked_add((b - b'0') as usize))
                            .filter(|s| *s <= MAX_ARG_LEN)
                            .ok_or(WireError::ProtocolViolation("argument too large"))?;
                    } else if b == b':' {
                        if !self.size_seen {
                            return Err(WireError::ProtocolViolation("missing argument size"));
                        }
                        if self.args.len() >= MAX_ARGS {
                            return Err(WireError::ProtocolViolation("too many arguments"));
                        }
                        self.remaining = self.size;
                        self.size = 0;
                        self.size_seen = false;
                        if self.remaining == 0 {
                            self.args.push(Vec::new());
                        } else {
                            self.data = Vec::with_capacity(self.remaining.min(64 * 1024));
                            self.state = State::ArgumentData;
                        }
                    } else if b == b' ' && !self.size_seen {
                        // separator before the next argument
                    } else if b == b'\n' && !self.size_seen {
                        self.finish(out)?;
                    } else {
                        return Err(WireError::ProtocolViolation("malformed argument size"));
                    }
                    i += 1;
                }
                State::ArgumentData => {
                    let take = self.remaining.min(input.len() - i);
                    self.data.extend_from_slice(&input[i..i + take]);
                    self.remaining -= take;
                    i += take;
                    if self.remaining == 0 {
                        self.args.push(std::mem::take(&mut self.data));
                        self.state = State::ArgumentSize;
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut VecDeque<Command>) -> Result<(), WireError> {
        let name = String::from_utf8(std::mem::take(&mut self.name))
            .map_err(|_| WireError::ProtocolViolation("command name is not UTF-8"))?;
        out.push_back(Command {
            name,
            args: std::mem::take(&mut self.args),
            trigger: self.has_trigger.then_some(self.trigger),
        });
        self.trigger = 0;
        self.has_trigger = false;
        self.size = 0;
        self.size_seen = false;
        self.remaining = 0;
        self.state = State::Initial;
        Ok(())
    }
}

/// `tokio_util` codec over [`Parser`], so connections read/write [`Command`]s
/// through a `Framed` stream.
pub struct CommandCodec {
    parser: Parser,
    ready: VecDeque<Command>,
}

impl CommandCodec {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            ready: VecDeque::new(),
        }
    }
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !src.is_empty() {
            let chunk = src.split_to(src.len());
            self.parser.feed(&chunk, &mut self.ready)?;
        }
        Ok(self.ready.pop_front())
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = WireError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> Vec<Command> {
        let mut parser = Parser::new();
        let mut out = VecDeque::new();
        parser.feed(input, &mut out).unwrap();
        out.into()
    }

    #[test]
    fn ping_without_trigger() {
        let cmds = parse_all(b"/PING\n");
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].name, "PING");
        assert_eq!(cmds[0].trigger, None);
        assert!(cmds[0].args.is_empty());
    }

    #[test]
    fn ping_with_trigger() {
        let cmds = parse_all(b"5/PING\n");
        assert_eq!(cmds[0].trigger, Some(5));
    }

    #[test]
    fn result_reply_frame_is_bit_exact() {
        let cmd = Command::new(
            "RESULT",
            vec![b"5".to_vec(), b"PONG".to_vec(), b"1712345678".to_vec()],
        );
        assert_eq!(cmd.to_bytes(), b"/RESULT 1:5 4:PONG 10:1712345678\n");
    }

    #[test]
    fn command_names_are_case_insensitive() {
        let cmds = parse_all(b"/ping\n12/Identify 6:worker\n");
        assert_eq!(cmds[0].name, "PING");
        assert_eq!(cmds[1].name, "IDENTIFY");
        assert_eq!(cmds[1].trigger, Some(12));
        assert_eq!(cmds[1].args, vec![b"worker".to_vec()]);
    }

    #[test]
    fn binary_safe_round_trip() {
        let nasty = b"line\nbreak:and/slash\x00\xff".to_vec();
        let cmd = Command::with_trigger("SUBMIT", vec![nasty.clone(), vec![], b"x".to_vec()], 42);
        let cmds = parse_all(&cmd.to_bytes());
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0], cmd);
    }

    #[test]
    fn chunk_boundary_invariance() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&Command::with_trigger("PING", vec![], 1).to_bytes());
        stream.extend_from_slice(
            &Command::new("RESULT", vec![b"1".to_vec(), b"PO\nNG".to_vec()]).to_bytes(),
        );
        stream.extend_from_slice(
            &Command::with_trigger("GET", vec![b"render".to_vec(), b"7:3".to_vec()], 2).to_bytes(),
        );

        let whole = parse_all(&stream);
        assert_eq!(whole.len(), 3);

        // one byte at a time
        let mut parser = Parser::new();
        let mut out = VecDeque::new();
        for b in &stream {
            parser.feed(std::slice::from_ref(b), &mut out).unwrap();
        }
        assert_eq!(Vec::from(out), whole);

        // every split point
        for split in 0..stream.len() {
            let mut parser = Parser::new();
            let mut out = VecDeque::new();
            parser.feed(&stream[..split], &mut out).unwrap();
            parser.feed(&stream[split..], &mut out).unwrap();
            assert_eq!(Vec::from(out), whole, "split at {split}");
        }
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let cmds = parse_all(b"\r\nhello?!/PING\n");
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].name, "PING");
    }

    #[test]
    fn garbage_inside_trigger_is_a_violation() {
        let mut parser = Parser::new();
        let mut out = VecDeque::new();
        let err = parser.feed(b"12x/PING\n", &mut out).unwrap_err();
        assert!(matches!(err, WireError::ProtocolViolation(_)));
    }

    #[test]
    fn zero_length_argument() {
        let cmds = parse_all(b"/FAIL 3:abc 0:\n");
        assert_eq!(cmds[0].args, vec![b"abc".to_vec(), b"".to_vec()]);
    }

    #[test]
    fn args_without_separator_also_parse() {
        // length prefixes make the separator redundant; tolerate its absence
        let cmds = parse_all(b"/RESULT 1:54:PONG\n");
        assert_eq!(cmds[0].args, vec![b"5".to_vec(), b"PONG".to_vec()]);
    }

    #[test]
    fn oversized_argument_is_rejected() {
        let mut parser = Parser::new();
        let mut out = VecDeque::new();
        let err = parser.feed(b"/SUBMIT 999999999999:", &mut out).unwrap_err();
        assert!(matches!(err, WireError::ProtocolViolation(_)));
    }

    #[test]
    fn codec_yields_commands_across_reads() {
        let mut codec = CommandCodec::new();
        let mut buf = BytesMut::from(&b"/PING\n5/PI"[..]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.name, "PING");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"NG\n");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.trigger, Some(5));
    }
}
