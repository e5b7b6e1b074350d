use std::net::IpAddr;

use async_trait::async_trait;
use md5::{Digest, Md5};

use crate::{
    config::Config,
    greylist::{self, Assessment, Mode, Params, Store},
    hooks::{Hook, HookContext, HookResult, Plugin},
    internal,
    smtp::transaction::Transaction,
};

use super::whitelist::{WHITELISTED_RCPTS, WHITELISTED_SENDER};

/// Connection note set when a deferral was decided but the sender was
/// the null path. The transaction is torn down as soon as its final
/// reply is written, so the note lives on the connection and is read
/// back by the data hook of later transactions on the same connection;
/// those with a real sender then see the deferred soft rejection.
const DEFERRED: &str = "greylist";

/// Cached fingerprint note.
const FINGERPRINT: &str = "greylist_fingerprint";

const DENIED: &str = "This mail is temporarily denied";

/// Hash-based greylisting. The first delivery attempt of an unseen
/// (body, envelope, Message-ID) combination is soft-rejected; a retry
/// after `black_timeout` whitelists the client IP for `white_timeout`.
/// State lives in a lock-guarded store shared by all workers.
pub struct Greylist {
    params: Params,
    store: Store,
}

impl Greylist {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let params = config
            .get_line("hash_greylist")
            .map(Params::from_config_line)
            .unwrap_or_default();

        Self {
            params,
            store: Store::new(&config.db_dir),
        }
    }

    fn skip(&self, ctx: &HookContext<'_>) -> bool {
        ctx.connection.relay_client
            || ctx.connection.whitelisthost
            || ctx.transaction.note(WHITELISTED_SENDER).is_some()
            || all_recipients_whitelisted(ctx.transaction)
            || ctx.transaction.data_size() > self.params.max_size
    }

    async fn assess(&self, ctx: &mut HookContext<'_>) -> anyhow::Result<HookResult> {
        if self.params.mode == Mode::Off || self.skip(ctx) {
            return Ok(HookResult::Declined);
        }

        // Greylisting is keyed on dotted quads; other peers pass.
        let IpAddr::V4(ip) = ctx.connection.remote_ip() else {
            return Ok(HookResult::Declined);
        };

        let fingerprint = match ctx.transaction.note(FINGERPRINT) {
            Some(cached) => cached.to_owned(),
            None => {
                let computed = fingerprint(ctx.transaction);
                ctx.transaction.set_note(FINGERPRINT, computed.clone());
                computed
            }
        };

        let store = self.store.clone();
        let params = self.params.clone();
        let now = unix_now();

        // The lock is taken and released entirely on the blocking pool;
        // no await happens while it is held.
        let assessment = tokio::task::spawn_blocking(move || {
            let mut guard = store.open()?;
            let assessment = greylist::assess(guard.map_mut(), &params, now, ip, &fingerprint);
            guard.close()?;
            Ok::<_, greylist::StoreError>(assessment)
        })
        .await?;

        let assessment = match assessment {
            Ok(assessment) => assessment,
            Err(err) => {
                // Store trouble never blocks mail.
                internal!(level = ERROR, "greylist store unavailable: {err}");
                return Ok(HookResult::Declined);
            }
        };

        internal!(level = DEBUG, "greylist: {ip} -> {assessment:?}");

        if assessment.passes() {
            return Ok(HookResult::Declined);
        }

        if self.params.mode == Mode::TestOnly {
            internal!(level = INFO, "greylist (testonly): would defer {ip}");
            return Ok(HookResult::Declined);
        }

        // Null senders are delivery probes: record the decision on the
        // connection and let the probe through.
        if ctx.transaction.sender().is_some_and(|sender| sender.is_null()) {
            ctx.connection.set_note(DEFERRED, "1");
            return Ok(HookResult::Declined);
        }

        Ok(HookResult::deny_soft(DENIED))
    }

    fn deferred(&self, ctx: &HookContext<'_>) -> HookResult {
        let bounced = ctx
            .transaction
            .sender()
            .is_some_and(|sender| sender.is_null());

        if ctx.connection.note(DEFERRED).is_some()
            && !bounced
            && !ctx.connection.relay_client
            && !all_recipients_whitelisted(ctx.transaction)
        {
            HookResult::deny_soft(DENIED)
        } else {
            HookResult::Declined
        }
    }
}

fn all_recipients_whitelisted(transaction: &Transaction) -> bool {
    let total = transaction.recipients().len();
    let whitelisted: usize = transaction
        .note(WHITELISTED_RCPTS)
        .and_then(|count| count.parse().ok())
        .unwrap_or(0);

    total > 0 && whitelisted >= total
}

/// MD5 over body bytes (always from position 0), the sender, each
/// recipient in order, and the Message-ID header value or nothing.
#[must_use]
pub fn fingerprint(transaction: &Transaction) -> String {
    let mut digest = Md5::new();

    digest.update(transaction.body());

    if let Some(sender) = transaction.sender() {
        digest.update(sender.to_string());
    }

    for recipient in transaction.recipients() {
        digest.update(recipient.to_string());
    }

    if let Some(message_id) = transaction.message_id() {
        digest.update(message_id);
    }

    hex::encode(digest.finalize())
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[async_trait]
impl Plugin for Greylist {
    fn name(&self) -> &'static str {
        "hash_greylist"
    }

    async fn hook(
        &self,
        hook: Hook<'_>,
        ctx: &mut HookContext<'_>,
    ) -> anyhow::Result<HookResult> {
        match hook {
            Hook::Data => Ok(self.deferred(ctx)),
            Hook::DataPost => self.assess(ctx).await,
            _ => Ok(HookResult::Declined),
        }
    }
}
