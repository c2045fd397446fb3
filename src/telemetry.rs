//! Telemetry receiver
//!
//! Turns the Arduino's inbound byte stream into measured joint angles.
//! Bytes are framed into newline-terminated lines, each line is lexed for
//! `<Ready>` and `ServoPosN: <integer>` tokens, and every well-formed token is
//! committed on its own (a fragment that starts like a token but does not
//! finish is dropped without touching the state).

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use memchr::{memchr, memchr2};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, digit1, one_of, space0},
    combinator::{map, map_res, opt, recognize},
    sequence::{pair, tuple},
    IResult,
};

use crate::arm_state::{deg_to_rad, ArmState, NUM_JOINTS};

const READY_TAG: &str = "<Ready>";
const SERVO_TAG: &str = "ServoPos";

/// Lines longer than this without a newline are noise and get dropped.
pub const MAX_LINE_LEN: usize = 256;

/// Channel number of the claw servo.
pub const CLAW_CHANNEL: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Handshake from the firmware after reset.
    Ready,
    /// Servo position report; channel is 1-based, value in degrees.
    ServoPos { channel: u8, value: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// At least one token parsed. `dropped` counts malformed fragments that
    /// were skipped in the same line.
    Recognized { tokens: Vec<Token>, dropped: usize },
    /// Nothing in the line looked like a token.
    Unrecognized,
    /// Something started like a token but never completed.
    Malformed,
}

fn ready(input: &str) -> IResult<&str, Token> {
    map(tag(READY_TAG), |_| Token::Ready)(input)
}

fn servo_pos(input: &str) -> IResult<&str, Token> {
    let (rest, (_, channel, _, _, _, value)) = tuple((
        tag(SERVO_TAG),
        one_of("123456"),
        space0,
        char(':'),
        space0,
        map_res(recognize(pair(opt(char('-')), digit1)), str::parse::<i32>),
    ))(input)?;
    let channel = channel.to_digit(10).unwrap_or(0) as u8;
    Ok((rest, Token::ServoPos { channel, value }))
}

fn token(input: &str) -> IResult<&str, Token> {
    alt((ready, servo_pos))(input)
}

/// Lex one line. Pure: the result only depends on `line`.
pub fn parse_line(line: &str) -> LineOutcome {
    let mut tokens = Vec::new();
    let mut dropped = 0usize;
    let mut rest = line;

    // Both tags start with ASCII bytes, so every hit is a char boundary.
    while let Some(pos) = memchr2(b'<', b'S', rest.as_bytes()) {
        rest = &rest[pos..];
        match token(rest) {
            Ok((remaining, tok)) => {
                tokens.push(tok);
                rest = remaining;
            }
            Err(_) if rest.starts_with(SERVO_TAG) => {
                dropped += 1;
                rest = &rest[SERVO_TAG.len()..];
            }
            Err(_) => {
                rest = &rest[1..];
            }
        }
    }

    if !tokens.is_empty() {
        LineOutcome::Recognized { tokens, dropped }
    } else if dropped > 0 {
        LineOutcome::Malformed
    } else {
        LineOutcome::Unrecognized
    }
}

/// Commit parsed tokens to the measured pose, one field at a time.
/// Returns true if the line carried the `<Ready>` handshake.
pub fn apply_tokens(state: &ArmState, tokens: &[Token]) -> bool {
    let mut ready = false;
    for tok in tokens {
        match *tok {
            Token::Ready => ready = true,
            Token::ServoPos { channel, value } if channel == CLAW_CHANNEL => {
                state.set_measured_claw(value as f64);
            }
            Token::ServoPos { channel, value } => {
                let idx = channel as usize - 1;
                if idx < NUM_JOINTS {
                    state.set_measured_joint(idx, deg_to_rad(value as f64));
                }
            }
        }
    }
    ready
}

/// Accumulates raw bytes and hands back complete lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self { buf: Vec::with_capacity(MAX_LINE_LEN) }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(nl) = memchr(b'\n', &self.buf) {
            let raw: Vec<u8> = self.buf.drain(..=nl).collect();
            let line = String::from_utf8_lossy(&raw[..nl]);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        if self.buf.len() > MAX_LINE_LEN {
            debug!(target: "telemetry", "Dropping {} bytes without line terminator", self.buf.len());
            self.buf.clear();
        }
        lines
    }

    /// Throw away a partially received line. Returns the number of bytes lost.
    pub fn discard_partial(&mut self) -> usize {
        let n = self.buf.len();
        self.buf.clear();
        n
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

pub struct TelemetryReceiver<R> {
    link: R,
    state: Arc<ArmState>,
    framer: LineFramer,
    link_ready: Arc<AtomicBool>,
    error_backoff: Duration,
}

impl<R: Read> TelemetryReceiver<R> {
    pub fn new(link: R, state: Arc<ArmState>, link_ready: Arc<AtomicBool>) -> Self {
        Self {
            link,
            state,
            framer: LineFramer::new(),
            link_ready,
            error_backoff: Duration::from_millis(500),
        }
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn handle_line(&mut self, line: &str) -> LineOutcome {
        let outcome = parse_line(line);
        match &outcome {
            LineOutcome::Recognized { tokens, dropped } => {
                if *dropped > 0 {
                    debug!(target: "telemetry", "Skipped {} malformed fragment(s) in {:?}", dropped, line);
                }
                if apply_tokens(&self.state, tokens) && !self.link_ready.swap(true, Ordering::SeqCst) {
                    info!(target: "telemetry", "Connection established");
                }
            }
            LineOutcome::Malformed => {
                debug!(target: "telemetry", "Dropped malformed line {:?}", line);
            }
            LineOutcome::Unrecognized => {}
        }
        outcome
    }

    /// Read until `stop` is raised or the link reaches end of stream.
    ///
    /// Relies on the link's read timeout to notice `stop`; a timeout also
    /// drops whatever partial line was pending.
    pub fn run(&mut self, stop: &AtomicBool) {
        let mut chunk = [0u8; 128];
        while !stop.load(Ordering::Relaxed) {
            match self.link.read(&mut chunk) {
                Ok(0) => {
                    info!(target: "telemetry", "Link closed");
                    break;
                }
                Ok(n) => {
                    for line in self.framer.push(&chunk[..n]) {
                        self.handle_line(&line);
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                    let lost = self.framer.discard_partial();
                    if lost > 0 {
                        debug!(target: "telemetry", "Read timeout, dropped {} partial bytes", lost);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(target: "telemetry", "Read error: {}", e);
                    self.framer.discard_partial();
                    thread::sleep(self.error_backoff);
                }
            }
        }
    }
}

impl<R: Read + Send + 'static> TelemetryReceiver<R> {
    pub fn spawn(mut self, stop: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("telemetry".into())
            .spawn(move || self.run(&stop))
    }
}
