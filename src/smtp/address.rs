use core::fmt::{self, Display, Formatter};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("malformed address: {0}")]
pub struct AddressError(pub String);

/// A reverse-path or forward-path as it appears on the wire. The null
/// path `<>` identifies bounce messages and delivery probes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Null,
    Mailbox { local: String, host: String },
}

impl Address {
    /// Parse a minimal RFC 5321 path: optional angle brackets, an optional
    /// source route (`@relay:`), and `local@host`. Addresses are stored
    /// with the host lowercased; the local part is preserved as sent.
    pub fn parse(path: &str) -> Result<Self, AddressError> {
        let mut inner = path.trim();

        let bracketed = inner.starts_with('<');
        if bracketed {
            inner = inner[1..]
                .strip_suffix('>')
                .ok_or_else(|| AddressError(path.to_owned()))?;
        }

        if inner.is_empty() {
            // Only the explicit `<>` denotes the null path.
            return if bracketed {
                Ok(Self::Null)
            } else {
                Err(AddressError(path.to_owned()))
            };
        }

        // Source routes are obsolete; strip and ignore them.
        if inner.starts_with('@') {
            inner = inner
                .split_once(':')
                .map(|(_, rest)| rest)
                .ok_or_else(|| AddressError(path.to_owned()))?;
        }

        let (local, host) = inner
            .rsplit_once('@')
            .ok_or_else(|| AddressError(path.to_owned()))?;

        if local.is_empty()
            || host.is_empty()
            || local.chars().any(|c| c.is_ascii_whitespace() || c == '<')
            || host
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '[' | ']' | ':')))
        {
            return Err(AddressError(path.to_owned()));
        }

        Ok(Self::Mailbox {
            local: local.to_owned(),
            host: host.to_ascii_lowercase(),
        })
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn local(&self) -> Option<&str> {
        match self {
            Self::Null => None,
            Self::Mailbox { local, .. } => Some(local),
        }
    }

    /// The domain part, `None` for the null path.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Null => None,
            Self::Mailbox { host, .. } => Some(host),
        }
    }
}

impl Display for Address {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Null => fmt.write_str("<>"),
            Self::Mailbox { local, host } => write!(fmt, "<{local}@{host}>"),
        }
    }
}
