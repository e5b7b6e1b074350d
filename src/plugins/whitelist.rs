use async_trait::async_trait;

use crate::{
    config::Config,
    hooks::{Hook, HookContext, HookResult, Plugin},
    internal,
    smtp::address::Address,
};

/// Note counting how many of the transaction's recipients are
/// whitelisted; the greylist bypass compares it to the recipient count.
pub const WHITELISTED_RCPTS: &str = "whitelisted_rcpts";

/// Note marking a whitelisted envelope sender.
pub const WHITELISTED_SENDER: &str = "whitelistsender";

/// Flag-only plugin: it never decides, it annotates. IP lists accept
/// exact addresses or prefix patterns ending in a dot (`10.1.1.`).
pub struct Whitelist {
    hosts: Vec<String>,
    relays: Vec<String>,
    senders: Vec<String>,
    rcpts: Vec<String>,
}

impl Whitelist {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let list = |key: &str| {
            config
                .get(key)
                .iter()
                .map(|line| line.trim().to_ascii_lowercase())
                .filter(|line| !line.is_empty())
                .collect()
        };

        Self {
            hosts: list("whitelisthosts"),
            relays: list("relayclients"),
            senders: list("whitelistsenders"),
            rcpts: list("whitelistrcpt"),
        }
    }

    fn ip_listed(patterns: &[String], ip: &str) -> bool {
        patterns.iter().any(|pattern| {
            if pattern.ends_with('.') {
                ip.starts_with(pattern.as_str())
            } else {
                pattern == ip
            }
        })
    }

    /// An address matches on the full `local@host` or on its domain.
    fn address_listed(patterns: &[String], address: &Address) -> bool {
        let (Some(local), Some(host)) = (address.local(), address.host()) else {
            return false;
        };
        let full = format!("{}@{host}", local.to_ascii_lowercase());

        patterns
            .iter()
            .any(|pattern| pattern == &full || pattern == host)
    }
}

#[async_trait]
impl Plugin for Whitelist {
    fn name(&self) -> &'static str {
        "whitelist"
    }

    async fn hook(
        &self,
        hook: Hook<'_>,
        ctx: &mut HookContext<'_>,
    ) -> anyhow::Result<HookResult> {
        match hook {
            Hook::Connect => {
                let ip = ctx.connection.remote_ip().to_string();

                if Self::ip_listed(&self.hosts, &ip) {
                    internal!(level = DEBUG, "whitelisted host {ip}");
                    ctx.connection.whitelisthost = true;
                }

                if Self::ip_listed(&self.relays, &ip) {
                    internal!(level = DEBUG, "relay client {ip}");
                    ctx.connection.relay_client = true;
                }
            }

            Hook::Mail(from) => {
                if Self::address_listed(&self.senders, from) {
                    ctx.transaction.set_note(WHITELISTED_SENDER, "1");
                }
            }

            Hook::Rcpt(to) => {
                if Self::address_listed(&self.rcpts, to) {
                    let seen: u64 = ctx
                        .transaction
                        .note(WHITELISTED_RCPTS)
                        .and_then(|count| count.parse().ok())
                        .unwrap_or(0);
                    ctx.transaction
                        .set_note(WHITELISTED_RCPTS, (seen + 1).to_string());
                }
            }

            _ => {}
        }

        Ok(HookResult::Declined)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::smtp::{connection::Connection, transaction::Transaction};

    fn plugin() -> Whitelist {
        let mut config = Config::default();
        config.set("whitelisthosts", vec!["192.0.2.7".into(), "10.1.1.".into()]);
        config.set("relayclients", vec!["198.51.100.1".into()]);
        config.set("whitelistsenders", vec!["friendly.example".into()]);
        config.set("whitelistrcpt", vec!["postmaster@example.com".into()]);
        Whitelist::from_config(&config)
    }

    async fn run(plugin: &Whitelist, hook: Hook<'_>, conn: &mut Connection, txn: &mut Transaction) {
        let mut ctx = HookContext {
            connection: conn,
            transaction: txn,
        };
        assert_eq!(plugin.hook(hook, &mut ctx).await.unwrap(), HookResult::Declined);
    }

    #[tokio::test]
    async fn flags_exact_and_prefix_hosts() {
        let plugin = plugin();

        for (peer, expected) in [
            ("192.0.2.7:25", true),
            ("10.1.1.200:25", true),
            ("10.1.10.1:25", false),
        ] {
            let mut conn = Connection::new(peer.parse().unwrap());
            let mut txn = Transaction::default();
            run(&plugin, Hook::Connect, &mut conn, &mut txn).await;
            assert_eq!(conn.whitelisthost, expected, "{peer}");
        }
    }

    #[tokio::test]
    async fn relay_clients_are_flagged() {
        let plugin = plugin();
        let mut conn = Connection::new("198.51.100.1:25".parse().unwrap());
        let mut txn = Transaction::default();
        run(&plugin, Hook::Connect, &mut conn, &mut txn).await;
        assert!(conn.relay_client);
        assert!(!conn.whitelisthost);
    }

    #[tokio::test]
    async fn sender_domain_match_sets_note() {
        let plugin = plugin();
        let mut conn = Connection::new("203.0.113.9:25".parse().unwrap());
        let mut txn = Transaction::default();

        let from = Address::parse("anyone@friendly.example").unwrap();
        run(&plugin, Hook::Mail(&from), &mut conn, &mut txn).await;
        assert_eq!(txn.note(WHITELISTED_SENDER), Some("1"));
    }

    #[tokio::test]
    async fn recipient_matches_are_counted() {
        let plugin = plugin();
        let mut conn = Connection::new("203.0.113.9:25".parse().unwrap());
        let mut txn = Transaction::default();

        let listed = Address::parse("postmaster@example.com").unwrap();
        let other = Address::parse("user@example.com").unwrap();

        run(&plugin, Hook::Rcpt(&listed), &mut conn, &mut txn).await;
        run(&plugin, Hook::Rcpt(&other), &mut conn, &mut txn).await;
        run(&plugin, Hook::Rcpt(&listed), &mut conn, &mut txn).await;

        assert_eq!(txn.note(WHITELISTED_RCPTS), Some("2"));
    }
}
