use core::fmt::{self, Display, Formatter};

use async_trait::async_trait;

use crate::{
    internal,
    smtp::{address::Address, connection::Connection, transaction::Transaction},
};

/// Credentials collected by the session during an AUTH dialogue. For
/// PLAIN/LOGIN `response` is the password; for CRAM-MD5 it is the
/// lowercase hex HMAC digest and `ticket` the challenge it was computed
/// over.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub response: String,
    pub ticket: Option<String>,
}

/// A named decision point during SMTP processing. Hook-specific arguments
/// ride along; everything else handlers need lives in the [`HookContext`].
#[derive(Clone, Copy, Debug)]
pub enum Hook<'a> {
    Connect,
    Helo(&'a str),
    Ehlo(&'a str),
    Mail(&'a Address),
    Rcpt(&'a Address),
    Data,
    DataPost,
    ResetTransaction,
    Auth(&'a Credentials),
    AuthPlain(&'a Credentials),
    AuthLogin(&'a Credentials),
    AuthCramMd5(&'a Credentials),
    Quit,
    Disconnect,
    Unrecognized(&'a str),
}

impl Hook<'_> {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Helo(_) => "helo",
            Self::Ehlo(_) => "ehlo",
            Self::Mail(_) => "mail",
            Self::Rcpt(_) => "rcpt",
            Self::Data => "data",
            Self::DataPost => "data_post",
            Self::ResetTransaction => "reset_transaction",
            Self::Auth(_) => "auth",
            Self::AuthPlain(_) => "auth-plain",
            Self::AuthLogin(_) => "auth-login",
            Self::AuthCramMd5(_) => "auth-cram-md5",
            Self::Quit => "quit",
            Self::Disconnect => "disconnect",
            Self::Unrecognized(_) => "unrecognized_command",
        }
    }
}

impl Display for Hook<'_> {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.name())
    }
}

/// The outcome of one handler, each variant optionally carrying a reply
/// text. `Declined` falls through to the next handler; `Done` means the
/// handler has produced its own reply and the default must be suppressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookResult {
    Ok(Option<String>),
    Deny(Option<String>),
    DenySoft(Option<String>),
    DenyHard(Option<String>),
    Declined,
    Done,
}

impl HookResult {
    #[must_use]
    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny(Some(message.into()))
    }

    #[must_use]
    pub fn deny_soft(message: impl Into<String>) -> Self {
        Self::DenySoft(Some(message.into()))
    }
}

/// Borrowed view of the session state handlers may inspect and annotate.
/// Scoped strictly to one hook invocation.
pub struct HookContext<'a> {
    pub connection: &'a mut Connection,
    pub transaction: &'a mut Transaction,
}

/// A policy module. Handlers run in registration order; returning
/// `Declined` for hooks a plugin does not care about is the norm. An
/// `Err` is contained by the dispatcher, never by the session.
///
/// Handlers are async: one that starts an external operation (a DNS
/// batch, a locked store update on the blocking pool) simply awaits it,
/// which suspends the whole chain without consuming client input or
/// emitting a reply.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    async fn hook(
        &self,
        hook: Hook<'_>,
        ctx: &mut HookContext<'_>,
    ) -> anyhow::Result<HookResult>;
}

/// The ordered hook chain shared by all sessions of a worker.
#[derive(Default)]
pub struct Registry {
    plugins: Vec<Box<dyn Plugin>>,
}

impl Registry {
    #[must_use]
    pub fn new(plugins: Vec<Box<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run the chain for `hook`. The first terminal result wins; if every
    /// handler declines the caller applies the hook's default reply.
    pub async fn dispatch(&self, hook: Hook<'_>, ctx: &mut HookContext<'_>) -> HookResult {
        internal!("dispatching {hook}");

        for plugin in &self.plugins {
            match plugin.hook(hook, ctx).await {
                Ok(HookResult::Declined) => {}
                Ok(result) => {
                    internal!(level = DEBUG, "{}: {hook} -> {result:?}", plugin.name());
                    return result;
                }
                Err(err) => {
                    internal!(level = ERROR, "{}: {hook} failed: {err:#}", plugin.name());
                    return HookResult::deny_soft("Internal error, please try again later");
                }
            }
        }

        HookResult::Declined
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::smtp::{connection::Connection, transaction::Transaction};

    struct Scripted {
        name: &'static str,
        result: fn() -> anyhow::Result<HookResult>,
    }

    #[async_trait]
    impl Plugin for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn hook(
            &self,
            _hook: Hook<'_>,
            _ctx: &mut HookContext<'_>,
        ) -> anyhow::Result<HookResult> {
            (self.result)()
        }
    }

    fn scripted(name: &'static str, result: fn() -> anyhow::Result<HookResult>) -> Box<Scripted> {
        Box::new(Scripted { name, result })
    }

    fn ctx_parts() -> (Connection, Transaction) {
        (
            Connection::new("192.0.2.1:9999".parse().unwrap()),
            Transaction::default(),
        )
    }

    #[tokio::test]
    async fn declined_falls_through_in_order() {
        let first = scripted("first", || Ok(HookResult::Declined));
        let second = scripted("second", || Ok(HookResult::Ok(Some("fine".into()))));
        let third = scripted("third", || Ok(HookResult::Deny(None)));

        let registry = Registry::new(vec![first, second, third]);
        let (mut conn, mut txn) = ctx_parts();
        let mut ctx = HookContext {
            connection: &mut conn,
            transaction: &mut txn,
        };

        let result = registry.dispatch(Hook::Connect, &mut ctx).await;
        assert_eq!(result, HookResult::Ok(Some("fine".into())));
    }

    #[tokio::test]
    async fn terminal_result_stops_iteration() {
        let first = scripted("first", || Ok(HookResult::Deny(Some("no".into()))));
        let second = scripted("second", || Ok(HookResult::Ok(None)));

        let registry = Registry::new(vec![first, second]);
        let (mut conn, mut txn) = ctx_parts();
        let mut ctx = HookContext {
            connection: &mut conn,
            transaction: &mut txn,
        };

        let result = registry.dispatch(Hook::Data, &mut ctx).await;
        assert_eq!(result, HookResult::Deny(Some("no".into())));
    }

    #[tokio::test]
    async fn handler_error_becomes_denysoft() {
        let broken = scripted("broken", || Err(anyhow::anyhow!("boom")));

        let registry = Registry::new(vec![broken]);
        let (mut conn, mut txn) = ctx_parts();
        let mut ctx = HookContext {
            connection: &mut conn,
            transaction: &mut txn,
        };

        assert!(matches!(
            registry.dispatch(Hook::DataPost, &mut ctx).await,
            HookResult::DenySoft(Some(_))
        ));
    }

    #[tokio::test]
    async fn empty_chain_declines() {
        let registry = Registry::default();
        let (mut conn, mut txn) = ctx_parts();
        let mut ctx = HookContext {
            connection: &mut conn,
            transaction: &mut txn,
        };

        assert_eq!(
            registry.dispatch(Hook::Quit, &mut ctx).await,
            HookResult::Declined
        );
    }
}
