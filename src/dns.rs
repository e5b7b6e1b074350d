use std::net::Ipv4Addr;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
    TokioAsyncResolver,
};
use thiserror::Error;

use crate::internal;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// NXDOMAIN / no records: for blocklists this simply means "not
    /// listed".
    #[error("no records for {0}")]
    NotFound(String),

    #[error("lookup failed: {0}")]
    Failed(String),
}

/// The two query shapes blocklist plugins need. A trait so tests and
/// offline runs can substitute a canned resolver.
#[async_trait]
pub trait Lookup: Send + Sync {
    async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError>;
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError>;
}

/// Production resolver on the worker's runtime. Uses the system
/// `resolv.conf` when readable, public defaults otherwise.
pub struct Resolver {
    inner: TokioAsyncResolver,
}

impl Resolver {
    #[must_use]
    pub fn system() -> Self {
        let inner = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|err| {
            internal!(level = WARN, "system resolver unavailable ({err}), using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });

        Self { inner }
    }
}

fn convert(name: &str, err: ResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => DnsError::NotFound(name.to_owned()),
        _ => DnsError::Failed(err.to_string()),
    }
}

#[async_trait]
impl Lookup for Resolver {
    async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        self.inner
            .ipv4_lookup(name)
            .await
            .map(|answer| answer.iter().map(|record| record.0).collect())
            .map_err(|err| convert(name, err))
    }

    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.inner
            .txt_lookup(name)
            .await
            .map(|answer| answer.iter().map(ToString::to_string).collect())
            .map_err(|err| convert(name, err))
    }
}

/// Receives one callback per answer. Callbacks must be idempotent with
/// respect to repeated answers for the same query.
pub trait BatchSink: Send {
    fn process_a_result(&mut self, result: Result<Vec<Ipv4Addr>, DnsError>, query: &str);
    fn process_txt_result(&mut self, result: Result<Vec<String>, DnsError>, query: &str);
}

enum Answer {
    A(String, Result<Vec<Ipv4Addr>, DnsError>),
    Txt(String, Result<Vec<String>, DnsError>),
}

/// Issue every A and TXT query concurrently, bounded by `parallelism`,
/// delivering answers to `sink` as they arrive. Returns `false` without
/// suspending when both query sets are empty, `true` once the whole
/// batch has completed. Awaiting this call is what suspends a hook
/// chain; dropping the future cancels any in-flight queries.
pub async fn batch(
    resolver: &dyn Lookup,
    a_queries: &[String],
    txt_queries: &[String],
    parallelism: usize,
    sink: &mut dyn BatchSink,
) -> bool {
    if a_queries.is_empty() && txt_queries.is_empty() {
        return false;
    }

    enum Kind {
        A(String),
        Txt(String),
    }

    let work = a_queries
        .iter()
        .cloned()
        .map(Kind::A)
        .chain(txt_queries.iter().cloned().map(Kind::Txt));

    let mut answers = stream::iter(work)
        .map(|kind| async move {
            match kind {
                Kind::A(query) => {
                    let result = resolver.a(&query).await;
                    Answer::A(query, result)
                }
                Kind::Txt(query) => {
                    let result = resolver.txt(&query).await;
                    Answer::Txt(query, result)
                }
            }
        })
        .buffer_unordered(parallelism.max(1));

    while let Some(answer) = answers.next().await {
        match answer {
            Answer::A(query, result) => sink.process_a_result(result, &query),
            Answer::Txt(query, result) => sink.process_txt_result(result, &query),
        }
    }

    true
}
