use std::borrow::Cow;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    io::{self, AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    codec::{LineCodec, decode_frame},
    envelope::{Chat, Envelope, Hello, QUIT_SENTINEL},
};

const ANONYMOUS: &str = "anon";

/// Lines typed by the user; the channel closes at end of input.
type Input = mpsc::Receiver<String>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut input = spawn_stdin_reader();
    let name = match args.name {
        Some(name) => choose_name(&name),
        None => prompt_name(&mut input).await?,
    };

    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    if let Err(error) = stream.set_nodelay(true) {
        warn!(?error, "failed to disable send coalescing");
    }
    info!(server = %args.server, name = %name, "connected");

    let (reader, writer) = stream.into_split();
    let mut outbound = FramedWrite::new(writer, LineCodec::default());
    outbound
        .send(Envelope::from(Hello::new(name.clone())))
        .await
        .context("failed to send hello")?;

    let mut receiver = tokio::spawn(receive_loop(reader, io::stdout()));
    let mut stdout = io::stdout();
    let result = send_loop(&mut outbound, &mut input, &mut stdout, &name, &mut receiver).await;

    shutdown_connection(outbound).await;
    receiver.abort();
    result
}

/// What the send loop does with one line of user input (`None` at end of input).
#[derive(Debug, PartialEq, Eq)]
pub enum InputAction<'a> {
    Skip,
    Quit,
    Send(&'a str),
}

pub fn input_action(line: Option<&str>) -> InputAction<'_> {
    match line {
        None => InputAction::Quit,
        Some(text) if text.trim().is_empty() => InputAction::Skip,
        Some(QUIT_SENTINEL) => InputAction::Quit,
        Some(text) => InputAction::Send(text),
    }
}

/// Formats one line received from the relay for the terminal.
pub fn render_line(line: &[u8]) -> String {
    if let Ok(frame) = decode_frame(line) {
        if let (Some(name), Some(message)) = (frame.field("name"), frame.field("message")) {
            return format!("[{}] {}", display_value(name), display_value(message));
        }
    }
    String::from_utf8_lossy(line).trim().to_string()
}

fn display_value(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(text) => Cow::Borrowed(text.as_str()),
        other => Cow::Owned(other.to_string()),
    }
}

fn choose_name(raw: &str) -> String {
    match raw.trim() {
        "" => ANONYMOUS.to_string(),
        name => name.to_string(),
    }
}

/// Reads stdin on a plain thread so a pending read never holds up runtime
/// shutdown once the chat is over.
fn spawn_stdin_reader() -> Input {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        return;
                    }
                }
                Err(error) => {
                    debug!(?error, "failed to read from stdin");
                    return;
                }
            }
        }
    });
    rx
}

async fn prompt_name(input: &mut Input) -> Result<String> {
    let mut stdout = io::stdout();
    stdout.write_all(b"Your username: ").await?;
    stdout.flush().await.context("failed to show prompt")?;

    let line = input.recv().await;
    Ok(choose_name(line.as_deref().unwrap_or_default()))
}

async fn receive_loop<R, O>(reader: R, mut out: O)
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(reader, LineCodec::default());
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                if let Err(error) = print_line(&mut out, &render_line(&line)).await {
                    debug!(?error, "failed to render incoming line");
                    return;
                }
            }
            Err(error) => {
                debug!(?error, "receive failed");
                break;
            }
        }
    }
    let _ = print_line(&mut out, "*** connection closed by server").await;
}

async fn send_loop<W, O>(
    outbound: &mut FramedWrite<W, LineCodec>,
    input: &mut Input,
    out: &mut O,
    name: &str,
    receiver: &mut JoinHandle<()>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    loop {
        select! {
            line = input.recv() => {
                match input_action(line.as_deref()) {
                    InputAction::Skip => {}
                    InputAction::Quit => {
                        send_quit(outbound, name).await;
                        print_line(out, "*** leaving chat").await?;
                        return Ok(());
                    }
                    InputAction::Send(text) => {
                        let chat = Envelope::from(Chat::new(name, text));
                        if let Err(error) = outbound.send(chat).await {
                            debug!(?error, "send failed");
                            print_line(out, "*** connection lost").await?;
                            return Ok(());
                        }
                    }
                }
            }
            _ = &mut *receiver => return Ok(()),
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                send_quit(outbound, name).await;
                return Ok(());
            }
        }
    }
}

async fn send_quit<W>(outbound: &mut FramedWrite<W, LineCodec>, name: &str)
where
    W: AsyncWrite + Unpin,
{
    if let Err(error) = outbound.send(Envelope::from(Chat::quit(name))).await {
        debug!(?error, "failed to send quit");
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection<W>(outbound: FramedWrite<W, LineCodec>)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = outbound.into_inner();
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn print_line<O>(out: &mut O, line: &str) -> io::Result<()>
where
    O: AsyncWrite + Unpin,
{
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}
