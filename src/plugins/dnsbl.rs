use std::{collections::HashMap, net::IpAddr, net::Ipv4Addr, sync::Arc};

use async_trait::async_trait;

use crate::{
    config::Config,
    dns::{self, BatchSink, DnsError, Lookup},
    hooks::{Hook, HookContext, HookResult, Plugin},
    internal,
};

/// Connection note carrying the rejection text for a listed client.
const NOTE: &str = "dnsbl";

/// IP blocklist: the reversed client address is looked up under every
/// configured zone as soon as the connection arrives, so the answers are
/// usually in before the client gets past MAIL. Rejection happens at
/// RCPT, sparing authenticated relays.
pub struct Dnsbl {
    zones: Vec<String>,
    resolver: Arc<dyn Lookup>,
    parallelism: usize,
}

impl Dnsbl {
    #[must_use]
    pub fn from_config(config: &Config, resolver: Arc<dyn Lookup>) -> Self {
        let zones = config
            .get("dnsbl_zones")
            .iter()
            .map(|line| line.trim().to_owned())
            .filter(|line| !line.is_empty())
            .collect();

        Self {
            zones,
            resolver,
            parallelism: config.dns_parallelism,
        }
    }

    fn queries(&self, ip: Ipv4Addr) -> Vec<String> {
        let [a, b, c, d] = ip.octets();
        let reversed = format!("{d}.{c}.{b}.{a}");

        self.zones
            .iter()
            .map(|zone| format!("{reversed}.{zone}"))
            .collect()
    }

    async fn check(&self, ip: Ipv4Addr) -> Option<String> {
        let queries = self.queries(ip);

        let mut sink = Collector::default();
        if !dns::batch(
            self.resolver.as_ref(),
            &queries,
            &queries,
            self.parallelism,
            &mut sink,
        )
        .await
        {
            return None;
        }

        for (zone, query) in self.zones.iter().zip(&queries) {
            if !sink.listed.contains(query) {
                continue;
            }

            return Some(
                sink.texts
                    .get(query)
                    .cloned()
                    .unwrap_or_else(|| format!("Blocked by {zone}")),
            );
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
            Err(err) => internal!(level = DEBUG, "dnsbl lookup {query}: {err}"),
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
impl Plugin for Dnsbl {
    fn name(&self) -> &'static str {
        "dnsbl"
    }

    async fn hook(
        &self,
        hook: Hook<'_>,
        ctx: &mut HookContext<'_>,
    ) -> anyhow::Result<HookResult> {
        match hook {
            Hook::Connect => {
                if self.zones.is_empty() {
                    return Ok(HookResult::Declined);
                }

                let IpAddr::V4(ip) = ctx.connection.remote_ip() else {
                    return Ok(HookResult::Declined);
                };

                if let Some(rejection) = self.check(ip).await {
                    internal!(level = INFO, "dnsbl hit for {ip}: {rejection}");
                    ctx.connection.set_note(NOTE, rejection);
                }

                Ok(HookResult::Declined)
            }

            Hook::Rcpt(_) => match ctx.connection.note(NOTE) {
                Some(rejection) if !ctx.connection.relay_client => {
                    Ok(HookResult::deny(rejection))
                }
                _ => Ok(HookResult::Declined),
            },

            _ => Ok(HookResult::Declined),
        }
    }
}
