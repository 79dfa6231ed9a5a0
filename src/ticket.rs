//! Ticket syntax: a fixed-length token of ASCII letters and digits.

use crate::protocol::TICKET_LENGTH;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TicketError {
    #[error("ticket must be {expected} bytes, got {0}", expected = TICKET_LENGTH)]
    Length(usize),

    #[error("ticket contains a non alphanumeric byte at offset {0}")]
    Charset(usize),
}

/// Validated ticket. Used both for open tickets sent by clients and for
/// notify tickets handed out by the broker.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Ticket(String);

impl Ticket {
    pub fn parse(raw: &[u8]) -> Result<Self, TicketError> {
        if raw.len() != TICKET_LENGTH {
            return Err(TicketError::Length(raw.len()));
        }
        if let Some(pos) = raw.iter().position(|b| !b.is_ascii_alphanumeric()) {
            return Err(TicketError::Charset(pos));
        }
        // Only ASCII left at this point.
        Ok(Ticket(raw.iter().map(|b| *b as char).collect()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::str::FromStr for Ticket {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ticket::parse(s.as_bytes())
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Tickets are credentials; keep them out of debug logs.
impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ticket({}…)", &self.0[..6])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "qcdn2jax6tx4nljdyed61hm3iqbld5nf44zxbh9gf355ofw2";

    #[test]
    fn accepts_alphanumeric_of_exact_length() {
        let ticket: Ticket = VALID.parse().unwrap();
        assert_eq!(ticket.as_str(), VALID);
        assert_eq!(ticket.as_bytes().len(), TICKET_LENGTH);
    }

    #[test]
    fn rejects_wrong_length() {
        for len in [0, 1, 47, 49, 96] {
            let raw = vec![b'a'; len];
            assert_eq!(Ticket::parse(&raw), Err(TicketError::Length(len)));
        }
    }

    #[test]
    fn rejects_disallowed_bytes() {
        for (pos, bad) in [(0, b'-'), (10, b' '), (47, b'/'), (20, 0xC3), (5, b'\n')] {
            let mut raw = VALID.as_bytes().to_vec();
            raw[pos] = bad;
            assert_eq!(Ticket::parse(&raw), Err(TicketError::Charset(pos)));
        }
    }

    #[test]
    fn debug_does_not_leak_full_ticket() {
        let ticket: Ticket = VALID.parse().unwrap();
        let shown = format!("{ticket:?}");
        assert!(!shown.contains(VALID));
        assert!(shown.starts_with("Ticket(qcdn2j"));
    }
}
