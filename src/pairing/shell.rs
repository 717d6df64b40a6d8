//! `bluetoothctl` as a [`ShellSession`].

use tracing::debug;

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use super::agent::{ShellLauncher, ShellOutput, ShellSession};

/// How long a shell gets to exit after `quit` before it is killed
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Launches the bluetooth control shell as a child process
#[derive(Debug, Clone)]
pub struct BluetoothctlLauncher {
    program: String,
}

impl BluetoothctlLauncher {
    pub fn new(program: impl Into<String>) -> BluetoothctlLauncher {
        BluetoothctlLauncher {
            program: program.into(),
        }
    }
}

impl Default for BluetoothctlLauncher {
    fn default() -> Self {
        BluetoothctlLauncher::new("bluetoothctl")
    }
}

impl ShellLauncher for BluetoothctlLauncher {
    fn launch(&self) -> io::Result<Box<dyn ShellSession>> {
        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no stdout"))?;

        // Prompts are not newline terminated, so forward raw chunks
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if tx.send(chunk).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        debug!(program = %self.program, "Pairing shell started");
        Ok(Box::new(ProcessSession {
            child,
            stdin,
            output: rx,
            closed: false,
        }))
    }
}

struct ProcessSession {
    child: Child,
    stdin: Option<ChildStdin>,
    output: Receiver<String>,
    closed: bool,
}

impl ShellSession for ProcessSession {
    fn send_line(&mut self, line: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "shell input closed"))?;
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()
    }

    fn read(&mut self, timeout: Duration) -> io::Result<ShellOutput> {
        match self.output.recv_timeout(timeout) {
            Ok(chunk) => Ok(ShellOutput::Data(chunk)),
            Err(RecvTimeoutError::Timeout) => Ok(ShellOutput::Timeout),
            Err(RecvTimeoutError::Disconnected) => Ok(ShellOutput::Eof),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // End of input makes the shell exit on its own
        self.stdin = None;

        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Pairing shell exited: {}", status);
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
                _ => break,
            }
        }

        debug!("Killing pairing shell");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_program_fails_to_launch() {
        let launcher = BluetoothctlLauncher::new("systole-no-such-shell");
        let error = launcher.launch().err().map(|e| e.kind());

        assert_eq!(error, Some(io::ErrorKind::NotFound));
    }

    #[cfg(unix)]
    #[test]
    fn echoes_through_cat() {
        let mut session = BluetoothctlLauncher::new("cat").launch().unwrap();
        session.send_line("Pairing successful").unwrap();

        let mut seen = String::new();
        while !seen.contains("Pairing successful") {
            match session.read(Duration::from_secs(5)).unwrap() {
                ShellOutput::Data(chunk) => seen.push_str(&chunk),
                other => panic!("expected output, got {:?}", other),
            }
        }

        session.close();
        session.close();
        assert_eq!(session.read(Duration::from_secs(5)).unwrap(), ShellOutput::Eof);
    }
}
