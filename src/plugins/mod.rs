pub mod auth;
pub mod dnsbl;
pub mod greylist;
pub mod rhsbl;
pub mod whitelist;

use std::sync::Arc;

use crate::{config::Config, dns::Lookup, hooks::Registry, internal};

/// Plugins named by the ordered `plugins` config list, loaded when the
/// key is absent.
const DEFAULT_CHAIN: &[&str] = &["whitelist", "dnsbl", "rhsbl", "auth_flat_file", "hash_greylist"];

/// Build the ordered plugin chain for one worker. The order of the
/// `plugins` lines is the dispatch order; an unknown name is a
/// configuration error and aborts startup.
pub fn init(config: &Config, resolver: Arc<dyn Lookup>) -> anyhow::Result<Registry> {
    let configured = config.get("plugins");
    let names: Vec<&str> = if configured.is_empty() {
        DEFAULT_CHAIN.to_vec()
    } else {
        configured.iter().map(String::as_str).collect()
    };

    let mut plugins: Vec<Box<dyn crate::hooks::Plugin>> = Vec::with_capacity(names.len());
    for name in names {
        internal!("loading plugin {name}");

        plugins.push(match name {
            "whitelist" => Box::new(whitelist::Whitelist::from_config(config)),
            "dnsbl" => Box::new(dnsbl::Dnsbl::from_config(config, Arc::clone(&resolver))),
            "rhsbl" => Box::new(rhsbl::Rhsbl::from_config(config, Arc::clone(&resolver))),
            "auth_flat_file" => Box::new(auth::Auth::flat_file(config)),
            "hash_greylist" => Box::new(greylist::Greylist::from_config(config)),
            other => anyhow::bail!("unknown plugin {other:?} in plugins config"),
        });
    }

    internal!(level = INFO, "initialised {} plugins", plugins.len());

    Ok(Registry::new(plugins))
}
