use std::{collections::HashMap, net::Ipv4Addr, sync::Arc};

use async_trait::async_trait;

use crate::{
    config::Config,
    dns::{self, BatchSink, DnsError, Lookup},
    hooks::{Hook, HookContext, HookResult, Plugin},
    internal,
};

/// Transaction note carrying the prepared rejection text.
const NOTE: &str = "rhsbl";

struct Zone {
    zone: String,
    message: Option<String>,
}

/// Right-hand-side blocklist: the sender's domain is looked up under
/// each configured zone when MAIL arrives; a hit rejects every RCPT of
/// the transaction. Config lines are `zone` or `zone message` (the
/// message may be quoted).
pub struct Rhsbl {
    zones: Vec<Zone>,
    resolver: Arc<dyn Lookup>,
    parallelism: usize,
}

impl Rhsbl {
    #[must_use]
    pub fn from_config(config: &Config, resolver: Arc<dyn Lookup>) -> Self {
        let zones = config
            .get("rhsbl_zones")
            .iter()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() {
                    return None;
                }

                let (zone, message) = match line.split_once(char::is_whitespace) {
                    Some((zone, message)) => {
                        (zone, Some(message.trim().trim_matches('"').to_owned()))
                    }
                    None => (line, None),
                };

                Some(Zone {
                    zone: zone.to_owned(),
                    message,
                })
            })
            .collect();

        Self {
            zones,
            resolver,
            parallelism: config.dns_parallelism,
        }
    }

    async fn check_domain(&self, domain: &str) -> Option<String> {
        let a_queries: Vec<String> = self
            .zones
            .iter()
            .map(|zone| format!("{domain}.{}", zone.zone))
            .collect();

        // TXT is only fetched where no message is configured.
        let txt_queries: Vec<String> = self
            .zones
            .iter()
            .filter(|zone| zone.message.is_none())
            .map(|zone| format!("{domain}.{}", zone.zone))
            .collect();

        let mut sink = Collector::default();
        if !dns::batch(
            self.resolver.as_ref(),
            &a_queries,
            &txt_queries,
            self.parallelism,
            &mut sink,
        )
        .await
        {
            return None;
        }

        // First hit in configuration order wins.
        for (zone, query) in self.zones.iter().zip(&a_queries) {
            if !sink.listed.contains(query) {
                continue;
            }

            let message = zone
                .message
                .clone()
                .or_else(|| sink.texts.get(query).cloned())
                .unwrap_or_else(|| format!("is listed in {}", zone.zone));

            return Some(format!("Mail from {domain} rejected because it {message}"));
        }

        None
    }
}

#[derive(Default)]
struct Collector {
    listed: Vec<String>,
    texts: HashMap<String, String>,
}

impl BatchSink for Collector {
    fn process_a_result(&mut self, result: Result<Vec<Ipv4Addr>, DnsError>, query: &str) {
        match result {
            Ok(records) if !records.is_empty() => {
                if !self.listed.iter().any(|listed| listed == query) {
                    self.listed.push(query.to_owned());
                }
            }
            Ok(_) | Err(DnsError::NotFound(_)) => {}
            Err(err) => internal!(level = DEBUG, "rhsbl lookup {query}: {err}"),
        }
    }

    fn process_txt_result(&mut self, result: Result<Vec<String>, DnsError>, query: &str) {
        if let Ok(texts) = result {
            if let Some(text) = texts.into_iter().next() {
                self.texts.entry(query.to_owned()).or_insert(text);
            }
        }
    }
}

#[async_trait]
impl Plugin for Rhsbl {
    fn name(&self) -> &'static str {
        "rhsbl"
    }

    async fn hook(
        &self,
        hook: Hook<'_>,
        ctx: &mut HookContext<'_>,
    ) -> anyhow::Result<HookResult> {
        match hook {
            Hook::Mail(from) => {
                if ctx.connection.relay_client || self.zones.is_empty() {
                    return Ok(HookResult::Declined);
                }

                // The null sender has no domain to look up.
                let Some(domain) = from.host() else {
                    return Ok(HookResult::Declined);
                };

                if let Some(rejection) = self.check_domain(domain).await {
                    internal!(level = INFO, "rhsbl hit: {rejection}");
                    ctx.transaction.set_note(NOTE, rejection);
                }

                Ok(HookResult::Declined)
            }

            Hook::Rcpt(_) => match ctx.transaction.note(NOTE) {
                Some(rejection) if !ctx.connection.relay_client => {
                    Ok(HookResult::deny(rejection))
                }
                _ => Ok(HookResult::Declined),
            },

            _ => Ok(HookResult::Declined),
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    use super::*;
    use crate::smtp::{address::Address, connection::Connection, transaction::Transaction};

    struct Canned(HashMap<String, Vec<Ipv4Addr>>);

    #[async_trait]
    impl Lookup for Canned {
        async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| DnsError::NotFound(name.to_owned()))
        }

        async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
            Err(DnsError::NotFound(name.to_owned()))
        }
    }

    fn plugin(lines: Vec<String>, listed: &[&str]) -> Rhsbl {
        let mut config = Config::default();
        config.set("rhsbl_zones", lines);

        let canned = listed
            .iter()
            .map(|name| ((*name).to_owned(), vec![Ipv4Addr::new(127, 0, 0, 2)]))
            .collect();

        Rhsbl::from_config(&config, Arc::new(Canned(canned)))
    }

    async fn mail_then_rcpt(plugin: &Rhsbl, sender: &str) -> HookResult {
        let mut conn = Connection::new("203.0.113.5:25".parse().unwrap());
        let mut txn = Transaction::default();
        let from = Address::parse(sender).unwrap();

        {
            let mut ctx = HookContext {
                connection: &mut conn,
                transaction: &mut txn,
            };
            assert_eq!(
                plugin.hook(Hook::Mail(&from), &mut ctx).await.unwrap(),
                HookResult::Declined
            );
        }

        let to = Address::parse("c@d.example").unwrap();
        let mut ctx = HookContext {
            connection: &mut conn,
            transaction: &mut txn,
        };
        plugin.hook(Hook::Rcpt(&to), &mut ctx).await.unwrap()
    }

    #[tokio::test]
    async fn listed_domain_is_rejected_at_rcpt() {
        let plugin = plugin(
            vec!["bl.example \"domain listed\"".into()],
            &["spam.tld.bl.example"],
        );

        assert_eq!(
            mail_then_rcpt(&plugin, "x@spam.tld").await,
            HookResult::deny("Mail from spam.tld rejected because it domain listed")
        );
    }

    #[tokio::test]
    async fn unlisted_domain_passes() {
        let plugin = plugin(vec!["bl.example".into()], &["spam.tld.bl.example"]);
        assert_eq!(
            mail_then_rcpt(&plugin, "x@ham.tld").await,
            HookResult::Declined
        );
    }

    #[tokio::test]
    async fn default_message_names_the_zone() {
        let plugin = plugin(vec!["bl.example".into()], &["spam.tld.bl.example"]);
        assert_eq!(
            mail_then_rcpt(&plugin, "x@spam.tld").await,
            HookResult::deny("Mail from spam.tld rejected because it is listed in bl.example")
        );
    }

    #[tokio::test]
    async fn null_sender_is_skipped() {
        let plugin = plugin(vec!["bl.example".into()], &[]);

        let mut conn = Connection::new("203.0.113.5:25".parse().unwrap());
        let mut txn = Transaction::default();
        let mut ctx = HookContext {
            connection: &mut conn,
            transaction: &mut txn,
        };

        assert_eq!(
            plugin
                .hook(Hook::Mail(&Address::Null), &mut ctx)
                .await
                .unwrap(),
            HookResult::Declined
        );
        assert_eq!(txn.note(NOTE), None);
    }
}
