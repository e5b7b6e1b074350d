use core::fmt::{self, Display, Formatter};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    ServiceReady = 220,
    GoodBye = 221,
    AuthSuccessful = 235,
    Ok = 250,
    AuthContinue = 334,
    StartMailInput = 354,
    Unavailable = 421,
    ActionAborted = 451,
    UnrecognizedCommand = 500,
    SyntaxError = 501,
    InvalidCommandSequence = 503,
    NotSupported = 504,
    AuthFailed = 535,
    Error = 550,
}

impl Status {
    /// Temporary failures invite the client to retry later.
    #[must_use]
    pub fn is_temporary(self) -> bool {
        let code = self as i32;
        (400..500).contains(&code)
    }

    #[must_use]
    pub fn is_permanent(self) -> bool {
        self as i32 >= 500
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", *self as i32)
    }
}
