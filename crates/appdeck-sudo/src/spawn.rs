use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::client::{SudoClient, SudoTransport};
use crate::protocol::{SudoRequest, SudoResponse};
use crate::server::SudoServer;

struct HelperTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl SudoTransport for HelperTransport {
    fn call(&mut self, request: &SudoRequest) -> Result<SudoResponse> {
        let line = serde_json::to_string(request).context("failed to encode sudo request")?;
        self.stdin
            .write_all(line.as_bytes())
            .context("failed to write to sudo helper")?;
        self.stdin
            .write_all(b"\n")
            .context("failed to write to sudo helper")?;
        self.stdin.flush().context("failed to flush sudo helper channel")?;

        let mut response_line = String::new();
        let read = self
            .stdout
            .read_line(&mut response_line)
            .context("failed to read from sudo helper")?;
        if read == 0 {
            return Err(anyhow!("sudo helper closed the channel"));
        }
        serde_json::from_str(response_line.trim()).context("failed to decode sudo response")
    }
}

impl Drop for HelperTransport {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// Spawns the privileged sibling process and verifies the channel with a ping.
// This must happen once at startup, before the unprivileged side touches the
// network or any package data. The command is expected to end up in serve()
// with its stdio as the private channel.
pub fn spawn_helper(command: &mut Command) -> Result<SudoClient> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .context("failed to spawn sudo helper process")?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("sudo helper is missing its stdin pipe"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("sudo helper is missing its stdout pipe"))?;

    let client = SudoClient::from_transport(Box::new(HelperTransport {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    }));

    if !client.ping() {
        return Err(anyhow!(
            "sudo helper did not answer the initial ping: {}",
            client.last_error()
        ));
    }
    debug!(target: "sudo", "sudo helper process is up");
    Ok(client)
}

// The helper-process side: answer requests line by line until the channel
// closes. A malformed request produces an error response, not a dead helper.
pub fn serve(server: &SudoServer, input: impl BufRead, mut output: impl Write) -> Result<()> {
    for line in input.lines() {
        let line = line.context("failed to read sudo request line")?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<SudoRequest>(line.trim()) {
            Ok(request) => server.handle(&request),
            Err(err) => SudoResponse::failure(format!("malformed sudo request: {err}")),
        };

        let encoded =
            serde_json::to_string(&response).context("failed to encode sudo response")?;
        output
            .write_all(encoded.as_bytes())
            .context("failed to write sudo response")?;
        output.write_all(b"\n").context("failed to write sudo response")?;
        output.flush().context("failed to flush sudo response")?;
    }
    Ok(())
}
