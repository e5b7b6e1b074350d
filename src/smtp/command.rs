use core::fmt::{self, Display, Formatter};

use thiserror::Error;

use super::address::{Address, AddressError};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("{0} requires an argument")]
    MissingArgument(&'static str),

    #[error(transparent)]
    BadAddress(#[from] AddressError),

    #[error("malformed parameter: {0}")]
    BadParameter(String),
}

/// An ESMTP parameter such as `SIZE=1024` or a bare keyword.
pub type Param = (String, Option<String>);

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    MailFrom(Address, Vec<Param>),
    RcptTo(Address),
    Data,
    Rset,
    Noop,
    Quit,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    /// Anything we do not implement; the verb is kept for the
    /// unrecognized_command hook.
    Unrecognized(String),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(host) => write!(fmt, "HELO {host}"),
            Self::Ehlo(host) => write!(fmt, "EHLO {host}"),
            Self::MailFrom(from, _) => write!(fmt, "MAIL FROM:{from}"),
            Self::RcptTo(to) => write!(fmt, "RCPT TO:{to}"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::Auth { mechanism, .. } => write!(fmt, "AUTH {mechanism}"),
            Self::Unrecognized(verb) => fmt.write_str(verb),
        }
    }
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let line = line.trim();
        let upper = line.to_ascii_uppercase();

        if let Some(rest) = strip_verb(line, &upper, "MAIL FROM:") {
            let (path, params) = split_path(rest)?;
            return Ok(Self::MailFrom(Address::parse(path)?, params));
        }

        if let Some(rest) = strip_verb(line, &upper, "RCPT TO:") {
            // RCPT parameters (DSN extensions) are tolerated and ignored.
            let (path, _) = split_path(rest)?;
            return Ok(Self::RcptTo(Address::parse(path)?));
        }

        let (verb, argument) = match line.split_once(char::is_whitespace) {
            Some((verb, argument)) => (verb, argument.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" | "EHLO" if argument.is_empty() => {
                Err(CommandError::MissingArgument("HELO/EHLO"))
            }
            "HELO" => Ok(Self::Helo(argument.to_owned())),
            "EHLO" => Ok(Self::Ehlo(argument.to_owned())),
            "DATA" => Ok(Self::Data),
            "RSET" => Ok(Self::Rset),
            "NOOP" => Ok(Self::Noop),
            "QUIT" => Ok(Self::Quit),
            "AUTH" if argument.is_empty() => Err(CommandError::MissingArgument("AUTH")),
            "AUTH" => {
                let (mechanism, initial) = match argument.split_once(char::is_whitespace) {
                    Some((mechanism, initial)) => (mechanism, Some(initial.trim().to_owned())),
                    None => (argument, None),
                };

                Ok(Self::Auth {
                    mechanism: mechanism.to_ascii_uppercase(),
                    initial,
                })
            }
            _ => Ok(Self::Unrecognized(line.to_owned())),
        }
    }
}

fn strip_verb<'a>(line: &'a str, upper: &str, verb: &str) -> Option<&'a str> {
    upper
        .starts_with(verb)
        .then(|| line[verb.len()..].trim_start())
}

/// Split `rest` into the path token and any trailing ESMTP parameters.
fn split_path(rest: &str) -> Result<(&str, Vec<Param>), CommandError> {
    let rest = rest.trim();

    let (path, tail) = if rest.starts_with('<') {
        match rest.find('>') {
            Some(end) => rest.split_at(end + 1),
            None => (rest, ""),
        }
    } else {
        rest.split_once(char::is_whitespace).unwrap_or((rest, ""))
    };

    let mut params = Vec::new();
    for word in tail.split_ascii_whitespace() {
        match word.split_once('=') {
            Some((key, _)) if key.is_empty() => {
                return Err(CommandError::BadParameter(word.to_owned()))
            }
            Some((key, value)) => {
                params.push((key.to_ascii_uppercase(), Some(value.to_owned())));
            }
            None => params.push((word.to_ascii_uppercase(), None)),
        }
    }

    Ok((path, params))
}

#[cfg(test)]
mod test {
    use super::{Command, CommandError};
    use crate::smtp::address::Address;

    #[test]
    fn mail_from() {
        assert_eq!(
            Command::try_from("MAIL FROM:<test@example.com>"),
            Ok(Command::MailFrom(
                Address::parse("test@example.com").unwrap(),
                Vec::new()
            ))
        );

        // Null sender and a space after the colon.
        assert_eq!(
            Command::try_from("Mail From: <>"),
            Ok(Command::MailFrom(Address::Null, Vec::new()))
        );

        assert!(matches!(
            Command::try_from("MAIL FROM:"),
            Err(CommandError::BadAddress(_))
        ));
    }

    #[test]
    fn mail_from_parameters() {
        let Ok(Command::MailFrom(from, params)) =
            Command::try_from("MAIL FROM:<a@b.example> SIZE=1024 BODY=8BITMIME")
        else {
            panic!("expected MAIL");
        };

        assert_eq!(from.to_string(), "<a@b.example>");
        assert_eq!(params[0], ("SIZE".to_owned(), Some("1024".to_owned())));
        assert_eq!(params[1], ("BODY".to_owned(), Some("8BITMIME".to_owned())));
    }

    #[test]
    fn rcpt_to() {
        assert_eq!(
            Command::try_from("rcpt to:<c@d.example>"),
            Ok(Command::RcptTo(Address::parse("c@d.example").unwrap()))
        );

        assert!(Command::try_from("RCPT TO: not an address").is_err());
    }

    #[test]
    fn helo_variants() {
        assert_eq!(
            Command::try_from("HELO mail.example.com"),
            Ok(Command::Helo("mail.example.com".to_owned()))
        );
        assert_eq!(
            Command::try_from("ehlo mail.example.com"),
            Ok(Command::Ehlo("mail.example.com".to_owned()))
        );
        assert_eq!(
            Command::try_from("EHLO"),
            Err(CommandError::MissingArgument("HELO/EHLO"))
        );
    }

    #[test]
    fn auth() {
        assert_eq!(
            Command::try_from("AUTH cram-md5"),
            Ok(Command::Auth {
                mechanism: "CRAM-MD5".to_owned(),
                initial: None,
            })
        );

        assert_eq!(
            Command::try_from("AUTH PLAIN AGZvbwBiYXI="),
            Ok(Command::Auth {
                mechanism: "PLAIN".to_owned(),
                initial: Some("AGZvbwBiYXI=".to_owned()),
            })
        );
    }

    #[test]
    fn bare_verbs_any_case() {
        for (line, expected) in [
            ("DATA", Command::Data),
            ("data", Command::Data),
            ("RsEt", Command::Rset),
            ("noop", Command::Noop),
            ("QUIT", Command::Quit),
        ] {
            assert_eq!(Command::try_from(line), Ok(expected));
        }
    }

    #[test]
    fn unrecognized_keeps_line() {
        assert_eq!(
            Command::try_from("VRFY someone"),
            Ok(Command::Unrecognized("VRFY someone".to_owned()))
        );
    }
}
