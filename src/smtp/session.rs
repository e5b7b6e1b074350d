use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    hooks::{Credentials, Hook, HookContext, HookResult, Registry},
    incoming, internal, outgoing,
    server::ServerState,
    smtp::{
        command::Command, connection::Connection, status::Status, transaction::Transaction, State,
    },
};

/// RFC 5321: command lines are at most 998 bytes plus CRLF.
pub const MAX_COMMAND_LINE: usize = 998;

/// Hard cap on unterminated input before the peer is cut off.
const MAX_BUFFERED_LINE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connection closed by peer")]
    Eof,

    #[error("command line exceeds {MAX_COMMAND_LINE} bytes")]
    LineTooLong,

    #[error("no input within {0:?}")]
    IdleTimeout(Duration),

    #[error("unterminated line exceeds {MAX_BUFFERED_LINE} bytes")]
    Overrun,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// One inbound SMTP connection. Reads CRLF-delimited commands from a
/// growable buffer, walks the protocol state machine, and consults the
/// hook chain at every step. Every accepted command produces exactly one
/// reply before the next command is read; replies are flushed before the
/// next read so a slow peer stalls its own session only.
pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    stream: Stream,
    buffer: Vec<u8>,
    hostname: String,
    timeout: Duration,
    state: State,
    connection: Connection,
    transaction: Transaction,
    registry: Arc<Registry>,
    server: Arc<ServerState>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    pub fn create(
        stream: Stream,
        peer: SocketAddr,
        registry: Arc<Registry>,
        server: Arc<ServerState>,
    ) -> Self {
        let config = server.config();

        Self {
            stream,
            buffer: Vec::default(),
            hostname: config.hostname.clone(),
            timeout: Duration::from_secs(config.timeout),
            state: State::Connect,
            connection: Connection::new(peer),
            transaction: Transaction::default(),
            registry,
            server,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        internal!("connected: {}", self.connection.peer());
        self.server.session_opened();

        let result = self.serve().await;

        // The disconnect hook runs on every exit path and never replies.
        let _ = self.dispatch(Hook::Disconnect).await;
        self.state = State::Closed;
        self.server.session_closed();
        internal!("closed: {}", self.connection.peer());

        result.map_err(Into::into)
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        // The acceptor queues a synthetic "Connect" event so the first
        // thing a session ever does is run the connect hook.
        let verdict = self.dispatch(Hook::Connect).await;
        let banner = format!("{} ESMTP postgate", self.hostname);
        let flow = self.respond(verdict, Status::ServiceReady, banner).await?;
        self.state = State::Greeted;

        if flow == Flow::Close {
            return Ok(());
        }

        loop {
            let line = match self.read_line(Some(MAX_COMMAND_LINE)).await {
                Ok(line) => line,
                Err(SessionError::LineTooLong) => {
                    self.send(Status::UnrecognizedCommand, "Line too long").await?;
                    continue;
                }
                Err(SessionError::Eof) => return Ok(()),
                Err(SessionError::IdleTimeout(_)) => {
                    let _ = self
                        .send(Status::Unavailable, "Connection timed out, closing")
                        .await;
                    return Ok(());
                }
                Err(SessionError::Overrun) => {
                    let _ = self
                        .send(Status::UnrecognizedCommand, "Line too long, closing connection")
                        .await;
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            let text = String::from_utf8_lossy(&line).into_owned();
            incoming!("{text}");

            let command = match Command::try_from(text.as_str()) {
                Ok(command) => command,
                Err(err) => {
                    self.send(Status::SyntaxError, &err.to_string()).await?;
                    continue;
                }
            };

            if self.handle(command).await? == Flow::Close {
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, command: Command) -> Result<Flow, SessionError> {
        match command {
            Command::Helo(host) => self.handle_helo(host, false).await,
            Command::Ehlo(host) => self.handle_helo(host, true).await,

            Command::MailFrom(from, params) => {
                if self.state != State::Greeted {
                    return self.out_of_sequence("MAIL").await;
                }

                if !params.is_empty() {
                    internal!(level = DEBUG, "MAIL parameters: {params:?}");
                }

                let verdict = self.dispatch(Hook::Mail(&from)).await;
                let accepted = accepts(&verdict);
                let flow = self
                    .respond(verdict, Status::Ok, format!("{from}, sender OK"))
                    .await?;

                if accepted {
                    self.transaction.set_sender(from);
                    self.state = State::MailRcpt;
                }

                Ok(flow)
            }

            Command::RcptTo(to) => {
                if self.state != State::MailRcpt {
                    return self.out_of_sequence("RCPT").await;
                }

                let verdict = self.dispatch(Hook::Rcpt(&to)).await;
                let accepted = accepts(&verdict);
                let flow = self
                    .respond(verdict, Status::Ok, format!("{to}, recipient ok"))
                    .await?;

                if accepted {
                    self.transaction.add_recipient(to);
                }

                Ok(flow)
            }

            Command::Data => self.handle_data().await,

            Command::Rset => {
                let verdict = self.dispatch(Hook::ResetTransaction).await;
                let flow = self.respond(verdict, Status::Ok, "OK".into()).await?;
                self.transaction = Transaction::default();
                self.state = State::Greeted;
                Ok(flow)
            }

            Command::Noop => {
                self.send(Status::Ok, "OK").await?;
                Ok(Flow::Continue)
            }

            Command::Quit => {
                let verdict = self.dispatch(Hook::Quit).await;
                let reply = format!("{} closing connection", self.hostname);
                self.respond(verdict, Status::GoodBye, reply).await?;
                Ok(Flow::Close)
            }

            Command::Auth { mechanism, initial } => self.handle_auth(&mechanism, initial).await,

            Command::Unrecognized(line) => {
                let verb = line.split_whitespace().next().unwrap_or("").to_owned();
                let verdict = self.dispatch(Hook::Unrecognized(&verb)).await;
                self.respond(
                    verdict,
                    Status::UnrecognizedCommand,
                    "Unrecognized command".into(),
                )
                .await
            }
        }
    }

    async fn handle_helo(&mut self, host: String, extended: bool) -> Result<Flow, SessionError> {
        if self.state != State::Greeted {
            return self.out_of_sequence(if extended { "EHLO" } else { "HELO" }).await;
        }

        let hook = if extended {
            Hook::Ehlo(&host)
        } else {
            Hook::Helo(&host)
        };
        let verdict = self.dispatch(hook).await;

        let flow = if accepts(&verdict) {
            if extended {
                self.send_lines(&[
                    format!("{}-{} Hi {host}", Status::Ok, self.hostname),
                    format!("{}-8BITMIME", Status::Ok),
                    format!("{} AUTH PLAIN LOGIN CRAM-MD5", Status::Ok),
                ])
                .await?;
            } else {
                let reply = match verdict {
                    HookResult::Ok(Some(message)) => message,
                    _ => format!("{} Hi {host}", self.hostname),
                };
                self.send(Status::Ok, &reply).await?;
            }

            self.connection.helo_host = Some(host);
            self.transaction = Transaction::default();
            Flow::Continue
        } else {
            self.respond(verdict, Status::Ok, String::new()).await?
        };

        Ok(flow)
    }

    async fn handle_data(&mut self) -> Result<Flow, SessionError> {
        if self.state != State::MailRcpt || self.transaction.recipients().is_empty() {
            return self.out_of_sequence("DATA").await;
        }

        let verdict = self.dispatch(Hook::Data).await;
        if !accepts(&verdict) {
            return self.respond(verdict, Status::Ok, String::new()).await;
        }

        self.state = State::Data;
        self.send(Status::StartMailInput, "go ahead").await?;

        match self.read_body().await {
            Ok(()) => {
                self.transaction.finalize();
                let verdict = self.dispatch(Hook::DataPost).await;
                let flow = self.respond(verdict, Status::Ok, "Queued".into()).await?;
                self.transaction = Transaction::default();
                self.state = State::Greeted;
                Ok(flow)
            }
            Err(SessionError::Eof) => Ok(Flow::Close),
            Err(SessionError::IdleTimeout(_)) => {
                let _ = self
                    .send(Status::Unavailable, "Connection timed out, closing")
                    .await;
                Ok(Flow::Close)
            }
            Err(err) => Err(err),
        }
    }

    /// Read dot-stuffed body lines until the terminating `.`; the stored
    /// body never contains the terminator and leading dots are unstuffed.
    async fn read_body(&mut self) -> Result<(), SessionError> {
        loop {
            let line = self.read_line(None).await?;

            if line == b"." {
                return Ok(());
            }

            let content = line.strip_prefix(b".").unwrap_or(&line);
            self.transaction.append_body_line(content);
        }
    }

    async fn handle_auth(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<Flow, SessionError> {
        if self.connection.relay_client {
            return self.out_of_sequence("AUTH").await;
        }

        let Some(credentials) = self.negotiate_auth(mechanism, initial).await? else {
            return Ok(Flow::Continue);
        };

        let mut verdict = self.dispatch(Hook::Auth(&credentials)).await;
        if verdict == HookResult::Declined {
            verdict = match mechanism {
                "PLAIN" => self.dispatch(Hook::AuthPlain(&credentials)).await,
                "LOGIN" => self.dispatch(Hook::AuthLogin(&credentials)).await,
                "CRAM-MD5" => self.dispatch(Hook::AuthCramMd5(&credentials)).await,
                _ => HookResult::Declined,
            };
        }

        // Failed AUTH leaves the protocol state untouched.
        match verdict {
            HookResult::Ok(message) => {
                self.connection.relay_client = true;
                self.connection.set_note("auth_user", &credentials.user);
                let reply = message.unwrap_or_else(|| "Authentication successful".into());
                self.send(Status::AuthSuccessful, &reply).await?;
            }
            HookResult::Deny(message) | HookResult::DenyHard(message) => {
                self.server.record_rejection(true);
                let reply = message.unwrap_or_else(|| "Authentication failed".into());
                self.send(Status::AuthFailed, &reply).await?;
            }
            HookResult::DenySoft(message) => {
                self.server.record_rejection(false);
                let reply = message.unwrap_or_else(|| "Temporary authentication failure".into());
                self.send(Status::ActionAborted, &reply).await?;
            }
            HookResult::Declined => {
                self.send(Status::NotSupported, "No authenticator available")
                    .await?;
            }
            HookResult::Done => {}
        }

        Ok(Flow::Continue)
    }

    /// Drive the SASL exchange for `mechanism`, returning the collected
    /// credentials or `None` when the dialogue already produced a reply
    /// (cancellation, bad base64, unsupported mechanism).
    async fn negotiate_auth(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> Result<Option<Credentials>, SessionError> {
        match mechanism {
            "PLAIN" => {
                let payload = match initial {
                    Some(payload) => payload,
                    None => match self.challenge("").await? {
                        Some(line) => line,
                        None => return Ok(None),
                    },
                };

                let Some(decoded) = self.decode_base64(&payload).await? else {
                    return Ok(None);
                };

                // authzid NUL authcid NUL passwd
                let decoded = String::from_utf8_lossy(&decoded).into_owned();
                let mut parts = decoded.split('\0');
                let _authzid = parts.next();

                match (parts.next(), parts.next()) {
                    (Some(user), Some(password)) if !user.is_empty() => Ok(Some(Credentials {
                        user: user.to_owned(),
                        response: password.to_owned(),
                        ticket: None,
                    })),
                    _ => {
                        self.send(Status::SyntaxError, "Malformed PLAIN response")
                            .await?;
                        Ok(None)
                    }
                }
            }

            "LOGIN" => {
                let user = match initial {
                    Some(user) => user,
                    None => match self.challenge("VXNlcm5hbWU6").await? {
                        Some(line) => line,
                        None => return Ok(None),
                    },
                };
                let Some(user) = self.decode_base64(&user).await? else {
                    return Ok(None);
                };

                let Some(password) = self.challenge("UGFzc3dvcmQ6").await? else {
                    return Ok(None);
                };
                let Some(password) = self.decode_base64(&password).await? else {
                    return Ok(None);
                };

                Ok(Some(Credentials {
                    user: String::from_utf8_lossy(&user).into_owned(),
                    response: String::from_utf8_lossy(&password).into_owned(),
                    ticket: None,
                }))
            }

            "CRAM-MD5" => {
                if initial.is_some() {
                    self.send(Status::SyntaxError, "CRAM-MD5 takes no initial response")
                        .await?;
                    return Ok(None);
                }

                let ticket = format!(
                    "<{}.{}.{}@{}>",
                    std::process::id(),
                    rand::random::<u32>(),
                    unix_now(),
                    self.hostname
                );

                let Some(response) = self.challenge(&BASE64.encode(&ticket)).await? else {
                    return Ok(None);
                };
                let Some(response) = self.decode_base64(&response).await? else {
                    return Ok(None);
                };

                let response = String::from_utf8_lossy(&response).into_owned();
                match response.rsplit_once(' ') {
                    Some((user, digest)) if !user.is_empty() => Ok(Some(Credentials {
                        user: user.to_owned(),
                        response: digest.to_ascii_lowercase(),
                        ticket: Some(ticket),
                    })),
                    _ => {
                        self.send(Status::SyntaxError, "Malformed CRAM-MD5 response")
                            .await?;
                        Ok(None)
                    }
                }
            }

            _ => {
                self.send(Status::NotSupported, "Unsupported authentication mechanism")
                    .await?;
                Ok(None)
            }
        }
    }

    /// Emit a 334 continuation and read the client's answer. `*` cancels.
    async fn challenge(&mut self, text: &str) -> Result<Option<String>, SessionError> {
        self.send(Status::AuthContinue, text).await?;

        let line = self.read_line(Some(MAX_COMMAND_LINE)).await?;
        let line = String::from_utf8_lossy(&line).into_owned();

        if line.trim() == "*" {
            self.send(Status::SyntaxError, "Authentication cancelled")
                .await?;
            return Ok(None);
        }

        Ok(Some(line))
    }

    async fn decode_base64(&mut self, payload: &str) -> Result<Option<Vec<u8>>, SessionError> {
        match BASE64.decode(payload.trim()) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(_) => {
                self.send(Status::SyntaxError, "Invalid base64").await?;
                Ok(None)
            }
        }
    }

    async fn out_of_sequence(&mut self, verb: &str) -> Result<Flow, SessionError> {
        let reply = format!("{verb} not allowed now");
        self.send(Status::InvalidCommandSequence, &reply).await?;
        Ok(Flow::Continue)
    }

    async fn dispatch(&mut self, hook: Hook<'_>) -> HookResult {
        let registry = Arc::clone(&self.registry);
        let mut ctx = HookContext {
            connection: &mut self.connection,
            transaction: &mut self.transaction,
        };

        registry.dispatch(hook, &mut ctx).await
    }

    /// Map a hook verdict onto exactly one SMTP reply. `status`/`default`
    /// are the hook's built-in reply for the OK/all-declined path.
    async fn respond(
        &mut self,
        verdict: HookResult,
        status: Status,
        default: String,
    ) -> Result<Flow, SessionError> {
        match verdict {
            HookResult::Ok(message) => {
                let reply = message.unwrap_or(default);
                self.send(status, &reply).await?;
                Ok(Flow::Continue)
            }
            HookResult::Declined => {
                self.send(status, &default).await?;
                Ok(Flow::Continue)
            }
            HookResult::Deny(message) => {
                self.server.record_rejection(true);
                let reply = message.unwrap_or_else(|| "Denied".into());
                self.send(Status::Error, &reply).await?;
                Ok(Flow::Continue)
            }
            HookResult::DenySoft(message) => {
                self.server.record_rejection(false);
                let reply = message.unwrap_or_else(|| "Temporarily denied, try again later".into());
                self.send(Status::ActionAborted, &reply).await?;
                Ok(Flow::Continue)
            }
            HookResult::DenyHard(message) => {
                self.server.record_rejection(true);
                let reply = message.unwrap_or_else(|| "Denied".into());
                self.send(Status::Error, &reply).await?;
                Ok(Flow::Close)
            }
            HookResult::Done => Ok(Flow::Continue),
        }
    }

    async fn send(&mut self, status: Status, text: &str) -> Result<(), SessionError> {
        let line = format!("{status} {text}");
        outgoing!("{line}");

        self.stream.write_all(format!("{line}\r\n").as_bytes()).await?;
        self.stream.flush().await?;

        Ok(())
    }

    async fn send_lines(&mut self, lines: &[String]) -> Result<(), SessionError> {
        let mut wire = String::new();
        for line in lines {
            outgoing!("{line}");
            wire.push_str(line);
            wire.push_str("\r\n");
        }

        self.stream.write_all(wire.as_bytes()).await?;
        self.stream.flush().await?;

        Ok(())
    }

    /// Pull the next LF-terminated line out of the growable input buffer,
    /// reading from the stream as needed. A trailing CR is stripped, so
    /// both CRLF and bare LF clients work. `limit` enforces the command
    /// line bound; body lines pass `None`.
    async fn read_line(&mut self, limit: Option<usize>) -> Result<Vec<u8>, SessionError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&byte| byte == b'\n') {
                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }

                if limit.is_some_and(|limit| line.len() > limit) {
                    return Err(SessionError::LineTooLong);
                }

                return Ok(line);
            }

            if self.buffer.len() > MAX_BUFFERED_LINE {
                return Err(SessionError::Overrun);
            }

            let mut chunk = [0; 4096];
            let read = tokio::time::timeout(self.timeout, self.stream.read(&mut chunk))
                .await
                .map_err(|_| SessionError::IdleTimeout(self.timeout))??;

            if read == 0 {
                return Err(SessionError::Eof);
            }

            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

fn accepts(verdict: &HookResult) -> bool {
    matches!(verdict, HookResult::Ok(_) | HookResult::Declined)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::{
        config::Config,
        hooks::{Plugin, Registry},
        plugins::auth::Auth,
        smtp::address::Address,
    };

    /// Captures what the hook chain saw so tests can look inside a
    /// finished session.
    #[derive(Default)]
    struct Recorder {
        bodies: Mutex<Vec<Vec<u8>>>,
        senders: Mutex<Vec<String>>,
        relayed_mail: Mutex<Vec<bool>>,
    }

    struct Recording(Arc<Recorder>);

    #[async_trait]
    impl Plugin for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn hook(
            &self,
            hook: Hook<'_>,
            ctx: &mut HookContext<'_>,
        ) -> anyhow::Result<HookResult> {
            match hook {
                Hook::Mail(from) => {
                    self.0.senders.lock().unwrap().push(from.to_string());
                    self.0
                        .relayed_mail
                        .lock()
                        .unwrap()
                        .push(ctx.connection.relay_client);
                }
                Hook::DataPost => {
                    self.0
                        .bodies
                        .lock()
                        .unwrap()
                        .push(ctx.transaction.body().to_vec());
                }
                _ => {}
            }

            Ok(HookResult::Declined)
        }
    }

    struct Scripted(fn(&Hook<'_>) -> HookResult);

    #[async_trait]
    impl Plugin for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn hook(
            &self,
            hook: Hook<'_>,
            _ctx: &mut HookContext<'_>,
        ) -> anyhow::Result<HookResult> {
            Ok((self.0)(&hook))
        }
    }

    async fn converse(input: &str, registry: Registry) -> Vec<String> {
        let (mut client, server) = tokio::io::duplex(64 * 1024);

        let state = Arc::new(ServerState::new(Config::default(), Registry::default()));
        let session = Session::create(
            server,
            "192.0.2.5:12345".parse().unwrap(),
            Arc::new(registry),
            state,
        );

        client.write_all(input.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let running = tokio::spawn(session.run());

        let mut replies = String::new();
        client.read_to_string(&mut replies).await.unwrap();
        running.await.unwrap().unwrap();

        replies.lines().map(str::to_owned).collect()
    }

    #[tokio::test]
    async fn full_transaction_with_default_replies() {
        let replies = converse(
            "HELO client.example\r\n\
             MAIL FROM:<a@b.example>\r\n\
             RCPT TO:<c@d.example>\r\n\
             DATA\r\n\
             Subject: t\r\n\
             \r\n\
             body\r\n\
             .\r\n\
             QUIT\r\n",
            Registry::default(),
        )
        .await;

        assert_eq!(
            replies,
            [
                "220 localhost ESMTP postgate",
                "250 localhost Hi client.example",
                "250 <a@b.example>, sender OK",
                "250 <c@d.example>, recipient ok",
                "354 go ahead",
                "250 Queued",
                "221 localhost closing connection",
            ]
        );
    }

    #[tokio::test]
    async fn exactly_one_reply_per_command() {
        let replies = converse(
            "HELO x\r\nNOOP\r\nNOOP\r\nRSET\r\nBANANA\r\nQUIT\r\n",
            Registry::default(),
        )
        .await;

        // Banner plus one line for each of the six commands.
        assert_eq!(replies.len(), 7);
        assert_eq!(replies[4], "250 OK");
        assert!(replies[5].starts_with("500 "));
    }

    #[tokio::test]
    async fn dot_stuffing_round_trip() {
        let recorder = Arc::new(Recorder::default());
        let registry = Registry::new(vec![Box::new(Recording(Arc::clone(&recorder)))]);

        converse(
            "MAIL FROM:<a@b.example>\r\n\
             RCPT TO:<c@d.example>\r\n\
             DATA\r\n\
             ..leading dot\r\n\
             normal\r\n\
             .\r\n\
             QUIT\r\n",
            registry,
        )
        .await;

        let bodies = recorder.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        // One leading dot survives, the terminator line does not.
        assert_eq!(bodies[0], b".leading dot\r\nnormal\r\n");
    }

    #[tokio::test]
    async fn out_of_sequence_commands() {
        let replies = converse(
            "RCPT TO:<c@d.example>\r\n\
             DATA\r\n\
             MAIL FROM:<a@b.example>\r\n\
             MAIL FROM:<x@y.example>\r\n\
             QUIT\r\n",
            Registry::default(),
        )
        .await;

        assert!(replies[1].starts_with("503 "));
        assert!(replies[2].starts_with("503 "));
        assert!(replies[3].starts_with("250 "));
        // Nested MAIL is refused.
        assert!(replies[4].starts_with("503 "));
    }

    #[tokio::test]
    async fn mail_without_helo_is_legal() {
        let replies = converse(
            "MAIL FROM:<a@b.example>\r\nQUIT\r\n",
            Registry::default(),
        )
        .await;
        assert!(replies[1].starts_with("250 "));
    }

    #[tokio::test]
    async fn deny_and_denysoft_map_to_550_and_451() {
        let registry = Registry::new(vec![Box::new(Scripted(|hook| match hook {
            Hook::Helo(_) => HookResult::deny_soft("come back later"),
            Hook::Rcpt(_) => HookResult::deny("no such user"),
            _ => HookResult::Declined,
        }))]);

        let replies = converse(
            "HELO x\r\nMAIL FROM:<a@b.example>\r\nRCPT TO:<c@d.example>\r\nDATA\r\nQUIT\r\n",
            registry,
        )
        .await;

        assert_eq!(replies[1], "451 come back later");
        assert!(replies[2].starts_with("250 "));
        assert_eq!(replies[3], "550 no such user");
        // The denied RCPT never joined the transaction, so DATA is early.
        assert!(replies[4].starts_with("503 "));
    }

    #[tokio::test]
    async fn denyhard_closes_the_connection() {
        let registry = Registry::new(vec![Box::new(Scripted(|hook| match hook {
            Hook::Helo(_) => HookResult::DenyHard(Some("go away".into())),
            _ => HookResult::Declined,
        }))]);

        let replies = converse("HELO x\r\nNOOP\r\n", registry).await;

        assert_eq!(replies[1], "550 go away");
        // The NOOP after the hard deny was never answered.
        assert_eq!(replies.len(), 2);
    }

    #[tokio::test]
    async fn data_needs_a_recipient() {
        let replies = converse(
            "MAIL FROM:<a@b.example>\r\nDATA\r\nQUIT\r\n",
            Registry::default(),
        )
        .await;
        assert!(replies[2].starts_with("503 "));
    }

    #[tokio::test]
    async fn ehlo_advertises_auth() {
        let replies = converse("EHLO client.example\r\nQUIT\r\n", Registry::default()).await;

        assert_eq!(replies[1], "250-localhost Hi client.example");
        assert_eq!(replies[2], "250-8BITMIME");
        assert_eq!(replies[3], "250 AUTH PLAIN LOGIN CRAM-MD5");
    }

    #[tokio::test]
    async fn oversized_command_line_gets_500() {
        let long = "X".repeat(MAX_COMMAND_LINE + 10);
        let replies = converse(&format!("{long}\r\nNOOP\r\nQUIT\r\n"), Registry::default()).await;

        assert!(replies[1].starts_with("500 "));
        // The session survives.
        assert_eq!(replies[2], "250 OK");
    }

    #[tokio::test]
    async fn auth_plain_marks_the_relay_client() {
        let mut config = Config::default();
        config.set("auth_users", vec!["alice s3cret".into()]);

        let recorder = Arc::new(Recorder::default());
        let registry = Registry::new(vec![
            Box::new(Auth::flat_file(&config)),
            Box::new(Recording(Arc::clone(&recorder))),
        ]);

        // \0alice\0s3cret
        let initial = "AGFsaWNlAHMzY3JldA==";
        let replies = converse(
            &format!("AUTH PLAIN {initial}\r\nMAIL FROM:<a@b.example>\r\nQUIT\r\n"),
            registry,
        )
        .await;

        assert_eq!(replies[1], "235 Authentication successful");
        assert_eq!(*recorder.relayed_mail.lock().unwrap(), [true]);
    }

    #[tokio::test]
    async fn auth_login_dialogue() {
        let mut config = Config::default();
        config.set("auth_users", vec!["alice s3cret".into()]);
        let registry = Registry::new(vec![Box::new(Auth::flat_file(&config))]);

        // base64("alice"), base64("s3cret")
        let replies = converse(
            "AUTH LOGIN\r\nYWxpY2U=\r\nczNjcmV0\r\nQUIT\r\n",
            registry,
        )
        .await;

        assert_eq!(replies[1], "334 VXNlcm5hbWU6");
        assert_eq!(replies[2], "334 UGFzc3dvcmQ6");
        assert_eq!(replies[3], "235 Authentication successful");
    }

    #[tokio::test]
    async fn auth_with_bad_password_leaves_state_unchanged() {
        let mut config = Config::default();
        config.set("auth_users", vec!["alice s3cret".into()]);
        let registry = Registry::new(vec![Box::new(Auth::flat_file(&config))]);

        let initial = BASE64.encode("\0alice\0wrong");
        let replies = converse(
            &format!("AUTH PLAIN {initial}\r\nMAIL FROM:<a@b.example>\r\nQUIT\r\n"),
            registry,
        )
        .await;

        assert!(replies[1].starts_with("535 "));
        // Still a usable session.
        assert!(replies[2].starts_with("250 "));
    }

    #[tokio::test]
    async fn auth_without_backend_is_unsupported() {
        let replies = converse("AUTH PLAIN AGEAYg==\r\nQUIT\r\n", Registry::default()).await;
        assert!(replies[1].starts_with("504 "));
    }

    #[tokio::test]
    async fn auth_cancellation() {
        let replies = converse("AUTH LOGIN\r\n*\r\nQUIT\r\n", Registry::default()).await;
        assert_eq!(replies[1], "334 VXNlcm5hbWU6");
        assert!(replies[2].starts_with("501 "));
    }

    #[tokio::test]
    async fn null_sender_reaches_the_hooks() {
        let recorder = Arc::new(Recorder::default());
        let registry = Registry::new(vec![Box::new(Recording(Arc::clone(&recorder)))]);

        converse("MAIL FROM:<>\r\nQUIT\r\n", registry).await;

        assert_eq!(*recorder.senders.lock().unwrap(), ["<>"]);
        assert!(Address::parse("<>").unwrap().is_null());
    }
}
