use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);
const BANNER: &str = "chat relay listening on ";

type Output = Lines<BufReader<ChildStdout>>;

fn binary() -> &'static Path {
    assert_cmd::cargo::cargo_bin!("chat-relay")
}

/// A `chat-relay server` process on an ephemeral port.
struct RelayProcess {
    child: Child,
    addr: String,
    _stdout: Output,
}

impl RelayProcess {
    async fn start() -> Result<Self> {
        let mut child = Command::new(binary())
            .args(["server", "--listen", "127.0.0.1:0"])
            .env("RUST_LOG", "off")
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("spawn relay")?;
        let mut stdout = BufReader::new(child.stdout.take().context("relay stdout")?).lines();

        let banner = next_line(&mut stdout).await.context("relay banner")?;
        let addr = banner
            .strip_prefix(BANNER)
            .with_context(|| format!("unexpected banner {banner:?}"))?
            .to_string();
        Ok(Self {
            child,
            addr,
            _stdout: stdout,
        })
    }

    async fn kill(mut self) -> Result<()> {
        self.child.kill().await.context("kill relay")?;
        Ok(())
    }
}

/// A `chat-relay client` process driven through its terminal streams.
struct Participant {
    name: &'static str,
    child: Child,
    stdin: ChildStdin,
    stdout: Output,
}

impl Participant {
    /// Starts a client and waits for its welcome.
    async fn join(addr: &str, name: &'static str) -> Result<Self> {
        let mut child = Command::new(binary())
            .args(["client", "--name", name, "--server", addr])
            .env("RUST_LOG", "off")
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn client {name}"))?;
        let stdin = child.stdin.take().context("client stdin")?;
        let stdout = BufReader::new(child.stdout.take().context("client stdout")?).lines();

        let mut participant = Self {
            name,
            child,
            stdin,
            stdout,
        };
        participant
            .expect_line(&format!("[system] Welcome, {name}! Type /quit to leave"))
            .await?;
        Ok(participant)
    }

    async fn type_line(&mut self, text: &str) -> Result<()> {
        self.stdin.write_all(format!("{text}\n").as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn expect_line(&mut self, expected: &str) -> Result<()> {
        let line = next_line(&mut self.stdout)
            .await
            .with_context(|| format!("{} waiting for {expected:?}", self.name))?;
        if line != expected {
            bail!("{} printed {line:?}, expected {expected:?}", self.name);
        }
        Ok(())
    }

    async fn exits_cleanly(mut self) -> Result<()> {
        let status = timeout(READ_TIMEOUT, self.child.wait())
            .await
            .with_context(|| format!("{} did not exit", self.name))??;
        if !status.success() {
            bail!("{} exited with {status}", self.name);
        }
        Ok(())
    }
}

async fn next_line(output: &mut Output) -> Result<String> {
    match timeout(READ_TIMEOUT, output.next_line()).await {
        Ok(Ok(Some(line))) => Ok(line.trim_end_matches('\r').to_string()),
        Ok(Ok(None)) => bail!("stream closed"),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => bail!("timed out"),
    }
}

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let relay = RelayProcess::start().await?;

    let mut alice = Participant::join(&relay.addr, "alice").await?;
    let mut bob = Participant::join(&relay.addr, "bob").await?;
    alice.expect_line("[system] bob joined").await?;

    // Blank input is never sent; the next real line is.
    alice.type_line("").await?;
    alice.type_line("Hello from Alice").await?;
    bob.expect_line("[alice] Hello from Alice").await?;

    bob.type_line("Hi Alice!").await?;
    alice.expect_line("[bob] Hi Alice!").await?;

    bob.type_line("/quit").await?;
    bob.expect_line("*** leaving chat").await?;
    alice.expect_line("[system] bob left").await?;

    alice.type_line("/quit").await?;
    alice.expect_line("*** leaving chat").await?;

    alice.exits_cleanly().await?;
    bob.exits_cleanly().await?;
    relay.kill().await
}

#[tokio::test]
async fn client_exits_when_relay_goes_away() -> Result<()> {
    let relay = RelayProcess::start().await?;
    let mut carol = Participant::join(&relay.addr, "carol").await?;

    relay.kill().await?;
    carol.expect_line("*** connection closed by server").await?;
    carol.exits_cleanly().await
}

#[tokio::test]
async fn bind_failure_is_fatal() -> Result<()> {
    let taken = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = taken.local_addr()?;

    let output = timeout(
        READ_TIMEOUT,
        Command::new(binary())
            .args(["server", "--listen", &addr.to_string()])
            .env("RUST_LOG", "off")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output(),
    )
    .await
    .context("server did not exit")??;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains(&format!("failed to bind {addr}")),
        "unexpected stderr: {stderr}"
    );
    Ok(())
}
