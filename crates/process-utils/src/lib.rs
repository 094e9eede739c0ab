//! Small process-related helpers shared across the workspace.

use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Which pipe a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Result of [`run_with_line_handler`].
#[derive(Debug)]
pub struct ProcessOutcome {
    pub status: ExitStatus,
    /// Number of lines read across both pipes.
    pub lines: usize,
}

/// Spawn `command` with both pipes captured and feed every output line to `on_line`
/// while the child runs.
///
/// Both pipes are drained concurrently, so a chatty child can never block on a full
/// pipe buffer. Stdin is closed. The call returns once the child has exited and both
/// pipes reached EOF.
pub async fn run_with_line_handler<F>(
    command: &mut tokio::process::Command,
    mut on_line: F,
) -> std::io::Result<ProcessOutcome>
where
    F: FnMut(OutputStream, &str),
{
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, OutputStream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, OutputStream::Stderr, tx.clone()));
    }
    // Channel closes once both readers hit EOF.
    drop(tx);

    let mut lines = 0;
    while let Some((stream, line)) = rx.recv().await {
        lines += 1;
        on_line(stream, &line);
    }

    let status = child.wait().await?;
    Ok(ProcessOutcome { status, lines })
}

async fn forward_lines<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
) where
    R: AsyncRead + Unpin,
{
    // Lines are read as bytes so non-UTF-8 output never stops the drain.
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send((stream, line)).is_err() {
                    break;
                }
            }
        }
    }
}
