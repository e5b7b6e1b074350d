use std::sync::Arc;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

use crate::{
    controller::{Signal, SHUTDOWN_BROADCAST},
    internal,
};

/// What the admin socket operates on. The single-process worker wires
/// this straight to its `ServerState`; the prefork parent relays to its
/// children instead.
pub trait ControlTarget: Send + Sync {
    fn pause(&self);
    fn resume(&self);
    fn status(&self) -> String;
    fn reload(&self) -> anyhow::Result<()>;
}

/// Loopback-only admin channel speaking a one-command-per-line protocol:
/// `pause`, `resume`, `status`, `reload`. Replies are `200 ...` or
/// `500 ...` lines.
pub async fn serve(listener: TcpListener, target: Arc<dyn ControlTarget>) -> anyhow::Result<()> {
    internal!(
        level = INFO,
        "control channel on {}",
        listener
            .local_addr()
            .map_or_else(|_| String::from("?"), |addr| addr.to_string())
    );

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                if matches!(sig, Ok(Signal::Shutdown)) {
                    break;
                }
            }

            connection = listener.accept() => {
                let (stream, peer) = connection?;
                internal!("control connection from {peer}");

                let target = Arc::clone(&target);
                tokio::spawn(async move {
                    if let Err(err) = handle(stream, target.as_ref()).await {
                        internal!(level = WARN, "control connection: {err}");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn handle(stream: TcpStream, target: &dyn ControlTarget) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let reply = match line.trim().to_ascii_lowercase().as_str() {
            "" => continue,
            "pause" => {
                target.pause();
                String::from("200 paused")
            }
            "resume" => {
                target.resume();
                String::from("200 resumed")
            }
            "status" => format!("200 {}", target.status()),
            "reload" => match target.reload() {
                Ok(()) => String::from("200 reloaded"),
                Err(err) => format!("500 reload failed: {err}"),
            },
            other => format!("500 unknown command {other:?}"),
        };

        writer.write_all(format!("{reply}\r\n").as_bytes()).await?;
    }

    Ok(())
}
