pub mod address;
pub mod command;
pub mod connection;
pub mod session;
pub mod status;
pub mod transaction;

use core::fmt::{self, Display, Formatter};

/// Protocol position of a session. `Greeted` covers everything between
/// the banner and MAIL; a completed or reset transaction returns there.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum State {
    #[default]
    Connect,
    Greeted,
    MailRcpt,
    Data,
    Closed,
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Connect => "Connect",
            Self::Greeted => "Greeted",
            Self::MailRcpt => "Mail",
            Self::Data => "Data",
            Self::Closed => "Closed",
        })
    }
}
