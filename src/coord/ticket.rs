//! Ticket naming and ownership rules.
//!
//! A ticket is an ephemeral sequential node `<kind>-<seq>` under a lock or
//! lease root. Ownership is never stored; it is recomputed from the current
//! sorted children every time it matters.

use serde::{Deserialize, Serialize};

/// Kind of a ticket, encoded as its name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketKind {
    /// Shared lock bid.
    Read,
    /// Exclusive lock bid.
    Write,
    /// Lease pool bid.
    Lease,
}

impl TicketKind {
    /// Name prefix handed to the store before the sequence suffix.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Read => "read-",
            Self::Write => "write-",
            Self::Lease => "lease-",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "lease" => Some(Self::Lease),
            _ => None,
        }
    }
}

/// Lock acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// One holder at a time.
    Exclusive,
    /// Any number of holders while no earlier exclusive bid exists.
    Shared,
}

impl LockMode {
    /// Ticket kind used to bid in this mode.
    pub fn ticket_kind(&self) -> TicketKind {
        match self {
            Self::Exclusive => TicketKind::Write,
            Self::Shared => TicketKind::Read,
        }
    }
}

/// A parsed ticket name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ticket {
    /// Child name as listed by the store.
    pub name: String,
    /// Ticket kind.
    pub kind: TicketKind,
    /// Store-assigned sequence number.
    pub sequence: u64,
}

impl Ticket {
    /// Parse a child name. Returns `None` for foreign nodes.
    pub fn parse(name: &str) -> Option<Self> {
        let (label, digits) = name.rsplit_once('-')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            kind: TicketKind::from_label(label)?,
            sequence: digits.parse().ok()?,
        })
    }
}

/// Outcome of checking a ticket against its root's children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    /// The ticket owns the resource.
    Acquired,
    /// The ticket must wait for this one to disappear.
    WaitOn(Ticket),
    /// The ticket is not among the children any more.
    Lost,
}

/// Parse and sort children by sequence, skipping foreign names.
pub fn sorted_tickets<S: AsRef<str>>(children: &[S]) -> Vec<Ticket> {
    let mut tickets: Vec<Ticket> = children
        .iter()
        .filter_map(|name| Ticket::parse(name.as_ref()))
        .collect();
    tickets.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.name.cmp(&b.name)));
    tickets
}

/// 0-based position of `own` among sorted tickets.
pub fn rank_of(tickets: &[Ticket], own: &str) -> Option<usize> {
    tickets.iter().position(|t| t.name == own)
}

/// Decide whether `own` holds the lock in `mode`, and if not, what it waits on.
///
/// Exclusive bids wait on their immediate predecessor. Shared bids wait on the
/// nearest earlier exclusive bid and ignore earlier shared bids.
pub fn blocker(mode: LockMode, tickets: &[Ticket], own: &str) -> Blocker {
    let rank = match rank_of(tickets, own) {
        Some(rank) => rank,
        None => return Blocker::Lost,
    };
    let ahead = &tickets[..rank];
    let waiting_on = match mode {
        LockMode::Exclusive => ahead.last(),
        LockMode::Shared => ahead.iter().rev().find(|t| t.kind == TicketKind::Write),
    };
    match waiting_on {
        Some(ticket) => Blocker::WaitOn(ticket.clone()),
        None => Blocker::Acquired,
    }
}

/// Check if `own` holds the lock in `mode`.
pub fn is_owner(mode: LockMode, tickets: &[Ticket], own: &str) -> bool {
    blocker(mode, tickets, own) == Blocker::Acquired
}

/// The `pool_size` lowest-sequence tickets.
pub fn holders(tickets: &[Ticket], pool_size: usize) -> &[Ticket] {
    &tickets[..tickets.len().min(pool_size)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_ticket_names() {
        let t = Ticket::parse("write-0000000042").unwrap();
        assert_eq!(t.kind, TicketKind::Write);
        assert_eq!(t.sequence, 42);

        assert!(Ticket::parse("lease-").is_none());
        assert!(Ticket::parse("other-0000000001").is_none());
        assert!(Ticket::parse("read-00x1").is_none());
    }

    #[test]
    fn test_sorted_by_sequence_not_name() {
        let children = names(&["write-0000000003", "read-0000000001", "junk", "write-0000000002"]);
        let sorted = sorted_tickets(&children);
        let order: Vec<u64> = sorted.iter().map(|t| t.sequence).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_exclusive_waits_on_immediate_predecessor() {
        let tickets = sorted_tickets(&names(&[
            "write-0000000001",
            "write-0000000002",
            "write-0000000003",
        ]));
        assert_eq!(blocker(LockMode::Exclusive, &tickets, "write-0000000001"), Blocker::Acquired);
        match blocker(LockMode::Exclusive, &tickets, "write-0000000003") {
            Blocker::WaitOn(t) => assert_eq!(t.name, "write-0000000002"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(blocker(LockMode::Exclusive, &tickets, "write-0000000009"), Blocker::Lost);
    }

    #[test]
    fn test_shared_readers_coexist_until_a_writer() {
        let tickets = sorted_tickets(&names(&[
            "read-0000000001",
            "read-0000000002",
            "write-0000000003",
            "read-0000000004",
        ]));
        assert!(is_owner(LockMode::Shared, &tickets, "read-0000000001"));
        assert!(is_owner(LockMode::Shared, &tickets, "read-0000000002"));
        match blocker(LockMode::Shared, &tickets, "read-0000000004") {
            Blocker::WaitOn(t) => assert_eq!(t.name, "write-0000000003"),
            other => panic!("unexpected {:?}", other),
        }
        // The writer waits behind the last reader.
        match blocker(LockMode::Exclusive, &tickets, "write-0000000003") {
            Blocker::WaitOn(t) => assert_eq!(t.name, "read-0000000002"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_holders_cap_at_pool_size() {
        let tickets = sorted_tickets(&names(&["lease-0000000002", "lease-0000000001"]));
        assert_eq!(holders(&tickets, 1).len(), 1);
        assert_eq!(holders(&tickets, 1)[0].sequence, 1);
        assert_eq!(holders(&tickets, 5).len(), 2);
    }
}
