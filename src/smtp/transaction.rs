use std::collections::HashMap;

use crate::internal;

use super::address::Address;

/// One MAIL FROM .. end-of-DATA cycle. A connection runs any number of
/// transactions in sequence; the session replaces this value wholesale on
/// RSET, HELO, and after a completed DATA.
#[derive(Debug, Default)]
pub struct Transaction {
    sender: Option<Address>,
    recipients: Vec<Address>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    data_size: u64,
    notes: HashMap<String, String>,
}

impl Transaction {
    #[must_use]
    pub const fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    pub fn set_sender(&mut self, sender: Address) {
        self.sender = Some(sender);
    }

    #[must_use]
    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    pub fn add_recipient(&mut self, recipient: Address) {
        self.recipients.push(recipient);
    }

    /// The message body, always read from position 0.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub const fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Append one dot-unstuffed body line. The CRLF terminator is restored
    /// here so the stored body is byte-faithful to the wire.
    pub fn append_body_line(&mut self, line: &[u8]) {
        self.body.extend_from_slice(line);
        self.body.extend_from_slice(b"\r\n");
        self.data_size += line.len() as u64 + 2;
    }

    /// Parse and record the message headers once the body is complete.
    pub fn finalize(&mut self) {
        match mailparse::parse_headers(&self.body) {
            Ok((headers, _)) => {
                self.headers = headers
                    .iter()
                    .map(|header| (header.get_key(), header.get_value()))
                    .collect();
            }
            Err(err) => internal!(level = DEBUG, "unparsable headers: {err}"),
        }
    }

    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header with the given name, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.header("Message-ID")
    }

    #[must_use]
    pub fn note(&self, key: &str) -> Option<&str> {
        self.notes.get(key).map(String::as_str)
    }

    pub fn set_note(&mut self, key: &str, value: impl Into<String>) {
        self.notes.insert(key.to_owned(), value.into());
    }
}
