use std::sync::Arc;

use futures_util::FutureExt;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{interval, Duration},
};

use crate::{
    controller::{Signal, SHUTDOWN_BROADCAST},
    internal,
    server::{ServerState, BATCH_RESET_SECS},
    smtp::session::Session,
};

const PAUSED_REPLY: &[u8] = b"451 Sorry, this server is currently paused\r\n";

/// The accept front end of one worker. Each readiness wake-up drains up
/// to the adaptive batch size in one go; draining the whole batch
/// without hitting "would block" doubles the batch, and a 30 s timer
/// decays it back to the floor.
pub struct Listener {
    inner: TcpListener,
    state: Arc<ServerState>,
}

impl Listener {
    #[must_use]
    pub fn new(inner: TcpListener, state: Arc<ServerState>) -> Self {
        Self { inner, state }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        internal!(
            level = INFO,
            "listening on {}",
            self.inner
                .local_addr()
                .map_or_else(|_| String::from("?"), |addr| addr.to_string())
        );

        let mut receiver = SHUTDOWN_BROADCAST.subscribe();
        let mut reset = interval(Duration::from_secs(BATCH_RESET_SECS));
        reset.tick().await; // the first tick fires immediately

        let mut sessions: Vec<JoinHandle<()>> = Vec::default();

        loop {
            tokio::select! {
                sig = receiver.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown)) {
                        internal!(level = INFO, "listener received shutdown, draining sessions");
                        futures_util::future::join_all(sessions).await;
                        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);
                        break;
                    }
                }

                _ = reset.tick() => {
                    self.state.reset_batch();
                }

                connection = self.inner.accept() => {
                    let first = connection?;
                    sessions.retain(|session| !session.is_finished());

                    // Burst-accept the rest of the batch without waiting.
                    let batch = self.state.batch();
                    let mut saturated = true;

                    self.spawn(first, &mut sessions);
                    for _ in 1..batch {
                        match self.inner.accept().now_or_never() {
                            Some(Ok(next)) => self.spawn(next, &mut sessions),
                            Some(Err(err)) => {
                                internal!(level = WARN, "accept failed: {err}");
                            }
                            None => {
                                saturated = false;
                                break;
                            }
                        }
                    }

                    self.state.adapt_batch(saturated);
                }
            }
        }

        Ok(())
    }

    fn spawn(
        &self,
        (stream, peer): (TcpStream, std::net::SocketAddr),
        sessions: &mut Vec<JoinHandle<()>>,
    ) {
        self.state.record_accepted();

        if self.state.is_paused() {
            tokio::spawn(async move {
                let mut stream = stream;
                let _ = stream.write_all(PAUSED_REPLY).await;
                let _ = stream.shutdown().await;
            });
            return;
        }

        let session = Session::create(
            stream,
            peer,
            self.state.registry(),
            Arc::clone(&self.state),
        );

        sessions.push(tokio::spawn(async move {
            if let Err(err) = session.run().await {
                internal!(level = ERROR, "session {peer}: {err:#}");
            }
        }));
    }
}
