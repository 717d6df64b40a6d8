//! # Agent
//!
//! Pairs by talking to an interactive bluetooth control shell the way a user
//! would: register a keyboard-only agent, ask for pairing, then answer PIN
//! and passkey prompts until the shell reports success or failure.
//!
//! Everything here blocks. Call it from a blocking thread, see
//! [`InteractiveAgentStrategy`](super::InteractiveAgentStrategy).
//!

use tracing::{debug, info, warn};

use std::io;
use std::time::{Duration, Instant};

use super::PairingOutcome;

/// What a read from the shell produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutput {
    Data(String),
    /// The shell closed its output
    Eof,
    /// Nothing arrived within the timeout
    Timeout,
}

/// A running interactive shell
pub trait ShellSession: Send {
    fn send_line(&mut self, line: &str) -> io::Result<()>;

    /// Wait at most `timeout` for more output
    fn read(&mut self, timeout: Duration) -> io::Result<ShellOutput>;

    /// Stop the shell. Must be safe to call more than once.
    fn close(&mut self);
}

/// Starts shell sessions
pub trait ShellLauncher: Send + Sync {
    fn launch(&self) -> io::Result<Box<dyn ShellSession>>;
}

/// How long to wait for the shell at each step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentTimeouts {
    /// Until the shell first shows it is ready
    pub ready: Duration,
    /// For each prompt after pairing was requested
    pub prompt: Duration,
}

impl Default for AgentTimeouts {
    fn default() -> Self {
        AgentTimeouts {
            ready: Duration::from_secs(5),
            prompt: Duration::from_secs(30),
        }
    }
}

/// Something to look for in the shell output
trait Pattern: Copy {
    /// Start and end of the first occurrence in `haystack`
    fn find(&self, haystack: &str) -> Option<(usize, usize)>;
}

fn find_literal(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    haystack.find(needle).map(|start| (start, start + needle.len()))
}

/// Signs of a shell ready for commands: its prompt, or the default agent
/// announcement printed at startup when no prompt is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ready;

impl Pattern for Ready {
    fn find(&self, haystack: &str) -> Option<(usize, usize)> {
        [find_literal(haystack, "#"), find_literal(haystack, "Agent registered")]
            .into_iter()
            .flatten()
            .min()
    }
}

/// Prompts the shell can show once pairing was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    PinRequest,
    ConfirmPasskey,
    Success,
    Failure,
}

const MARKERS: [Marker; 4] = [
    Marker::PinRequest,
    Marker::ConfirmPasskey,
    Marker::Success,
    Marker::Failure,
];

impl Pattern for Marker {
    fn find(&self, haystack: &str) -> Option<(usize, usize)> {
        match self {
            Marker::PinRequest => find_literal(haystack, "Enter PIN code:"),
            // "Confirm passkey 123456 (yes/no):", older versions end in "[y/N]"
            Marker::ConfirmPasskey => {
                let (start, end) = find_literal(haystack, "Confirm passkey")?;
                let rest = &haystack[end..];
                [find_literal(rest, "(yes/no)"), find_literal(rest, "[y/N]")]
                    .into_iter()
                    .flatten()
                    .map(|(_, answer_end)| (start, end + answer_end))
                    .min()
            }
            Marker::Success => find_literal(haystack, "Pairing successful"),
            Marker::Failure => find_literal(haystack, "Failed to pair"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Expect<P> {
    Matched(P),
    Eof,
    Timeout,
}

/// One shell session with the output read so far. Closes the session when
/// dropped, whatever path led there.
struct Dialogue {
    session: Box<dyn ShellSession>,
    buffer: String,
    closed: bool,
}

impl Dialogue {
    fn new(session: Box<dyn ShellSession>) -> Dialogue {
        Dialogue {
            session,
            buffer: String::new(),
            closed: false,
        }
    }

    fn send(&mut self, line: &str) -> io::Result<()> {
        self.session.send_line(line)
    }

    /// Wait for whichever pattern shows up first and consume the output up
    /// to the end of it
    fn expect<P: Pattern>(&mut self, patterns: &[P], timeout: Duration) -> io::Result<Expect<P>> {
        let deadline = Instant::now() + timeout;

        loop {
            let earliest = patterns
                .iter()
                .filter_map(|p| p.find(&self.buffer).map(|(start, end)| (start, end, *p)))
                .min_by_key(|(start, _, _)| *start);

            if let Some((_, end, pattern)) = earliest {
                self.buffer.drain(..end);
                return Ok(Expect::Matched(pattern));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Expect::Timeout);
            }

            match self.session.read(remaining)? {
                ShellOutput::Data(data) => self.buffer.push_str(&data),
                ShellOutput::Eof => return Ok(Expect::Eof),
                ShellOutput::Timeout => return Ok(Expect::Timeout),
            }
        }
    }

    fn finish(&mut self) {
        if self.closed {
            return;
        }
        if let Err(why) = self.session.send_line("quit") {
            debug!("Could not send quit: {}", why);
        }
        self.session.close();
        self.closed = true;
    }
}

impl Drop for Dialogue {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Drives a control shell through pairing
pub struct PairingAgent {
    launcher: Box<dyn ShellLauncher>,
    timeouts: AgentTimeouts,
}

impl PairingAgent {
    pub fn new<L: ShellLauncher + 'static>(launcher: L, timeouts: AgentTimeouts) -> PairingAgent {
        PairingAgent {
            launcher: Box::new(launcher),
            timeouts,
        }
    }

    /// Pair with `address`, answering a PIN request with `pin`.
    ///
    /// Passkey confirmations are always accepted. The shell session is closed
    /// before this returns.
    pub fn pair(&self, address: &str, pin: Option<&str>) -> PairingOutcome {
        let session = match self.launcher.launch() {
            Ok(session) => session,
            Err(why) => {
                warn!("Could not start pairing shell: {}", why);
                return PairingOutcome::AgentUnavailable;
            }
        };

        let mut dialogue = Dialogue::new(session);
        let outcome = match self.converse(&mut dialogue, address, pin) {
            Ok(outcome) => outcome,
            Err(why) => {
                warn!(%address, "Pairing dialogue failed: {}", why);
                PairingOutcome::Rejected
            }
        };
        dialogue.finish();

        info!(%address, "Pairing finished: {}", outcome);
        outcome
    }

    fn converse(
        &self,
        dialogue: &mut Dialogue,
        address: &str,
        pin: Option<&str>,
    ) -> io::Result<PairingOutcome> {
        if dialogue.expect(&[Ready], self.timeouts.ready)? != Expect::Matched(Ready) {
            warn!("Pairing shell never became ready");
            return Ok(PairingOutcome::TimedOut);
        }

        dialogue.send("agent KeyboardOnly")?;
        dialogue.send("default-agent")?;
        dialogue.send(&format!("pair {}", address))?;

        loop {
            match dialogue.expect(&MARKERS, self.timeouts.prompt)? {
                Expect::Matched(Marker::PinRequest) => match pin {
                    Some(pin) => {
                        debug!("Sending PIN");
                        dialogue.send(pin)?;
                    }
                    None => {
                        info!(%address, "Device asked for a PIN but none was given");
                        return Ok(PairingOutcome::Rejected);
                    }
                },
                Expect::Matched(Marker::ConfirmPasskey) => {
                    debug!("Confirming passkey");
                    dialogue.send("yes")?;
                }
                Expect::Matched(Marker::Success) => return Ok(PairingOutcome::Paired),
                Expect::Matched(Marker::Failure) => return Ok(PairingOutcome::Rejected),
                Expect::Eof | Expect::Timeout => return Ok(PairingOutcome::TimedOut),
            }
        }
    }
}
