use std::collections::HashMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use md5::Md5;

use crate::{
    config::Config,
    hooks::{Credentials, Hook, HookContext, HookResult, Plugin},
    internal,
};

type HmacMd5 = Hmac<Md5>;

/// Where secrets come from. SQL and LDAP backends live outside this
/// crate; they only need to implement this trait.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn secret(&self, user: &str) -> anyhow::Result<Option<String>>;
}

/// Plaintext `user secret` lines from the `auth_users` config key.
pub struct FlatFile {
    users: HashMap<String, String>,
}

impl FlatFile {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let users = config
            .get("auth_users")
            .iter()
            .filter_map(|line| {
                line.trim()
                    .split_once(char::is_whitespace)
                    .map(|(user, secret)| (user.to_owned(), secret.trim().to_owned()))
            })
            .collect();

        Self { users }
    }
}

#[async_trait]
impl AuthBackend for FlatFile {
    async fn secret(&self, user: &str) -> anyhow::Result<Option<String>> {
        Ok(self.users.get(user).cloned())
    }
}

/// Verifies the credentials the session collected. PLAIN and LOGIN
/// compare the password; CRAM-MD5 recomputes the digest over the ticket.
/// Unknown users decline so another authenticator may take over.
pub struct Auth {
    backend: Box<dyn AuthBackend>,
}

impl Auth {
    #[must_use]
    pub fn new(backend: Box<dyn AuthBackend>) -> Self {
        Self { backend }
    }

    #[must_use]
    pub fn flat_file(config: &Config) -> Self {
        Self::new(Box::new(FlatFile::from_config(config)))
    }

    async fn verify_password(&self, credentials: &Credentials) -> anyhow::Result<HookResult> {
        match self.backend.secret(&credentials.user).await? {
            Some(secret) if secret == credentials.response => Ok(HookResult::Ok(None)),
            Some(_) => {
                internal!(level = INFO, "auth failed for {}", credentials.user);
                Ok(HookResult::Deny(None))
            }
            None => Ok(HookResult::Declined),
        }
    }

    async fn verify_digest(&self, credentials: &Credentials) -> anyhow::Result<HookResult> {
        let Some(ticket) = credentials.ticket.as_deref() else {
            return Ok(HookResult::Deny(None));
        };

        match self.backend.secret(&credentials.user).await? {
            Some(secret) if hmac_md5_hex(ticket, &secret) == credentials.response => {
                Ok(HookResult::Ok(None))
            }
            Some(_) => {
                internal!(level = INFO, "auth failed for {}", credentials.user);
                Ok(HookResult::Deny(None))
            }
            None => Ok(HookResult::Declined),
        }
    }
}

/// The CRAM-MD5 proof: lowercase hex HMAC-MD5 of the ticket keyed with
/// the shared secret.
#[must_use]
pub fn hmac_md5_hex(ticket: &str, secret: &str) -> String {
    let mut mac =
        HmacMd5::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(ticket.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[async_trait]
impl Plugin for Auth {
    fn name(&self) -> &'static str {
        "auth_flat_file"
    }

    async fn hook(
        &self,
        hook: Hook<'_>,
        _ctx: &mut HookContext<'_>,
    ) -> anyhow::Result<HookResult> {
        match hook {
            Hook::AuthPlain(credentials) | Hook::AuthLogin(credentials) => {
                self.verify_password(credentials).await
            }
            Hook::AuthCramMd5(credentials) => self.verify_digest(credentials).await,
            _ => Ok(HookResult::Declined),
        }
    }
}
