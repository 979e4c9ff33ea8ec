//! The joined view and the chainable filter combinator.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;
use tangle_conn_db::AddressBook;
use tangle_conn_hub::Hub;
use tangle_conn_staging::Staging;
use tangle_peer::{Address, PeerRecord};

use crate::predicates::{group_key, passes_exp_backoff};

/// Which cold pool `peers_connectable` draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Db,
    Staging,
}

/// Read-only facade over the three pools.
#[derive(Debug, Clone)]
pub struct Query {
    db: AddressBook,
    hub: Hub,
    staging: Staging,
}

impl Query {
    pub fn new(db: AddressBook, hub: Hub, staging: Staging) -> Self {
        Self { db, hub, staging }
    }

    /// Hub entries that are connecting or connected.
    pub fn peers_in_connection(&self) -> PeerQuery {
        PeerQuery {
            entries: self
                .hub
                .entries()
                .into_iter()
                .filter(|(_, e)| e.state.is_in_connection())
                .map(|(a, e)| (a, e.record))
                .collect(),
        }
    }

    /// Hub entries that are fully connected.
    pub fn peers_connected(&self) -> PeerQuery {
        PeerQuery {
            entries: self
                .hub
                .entries()
                .into_iter()
                .filter(|(_, e)| e.state.is_connected())
                .map(|(a, e)| (a, e.record))
                .collect(),
        }
    }

    /// Entries from the chosen pool that are not currently in flight.
    pub fn peers_connectable(&self, origin: Origin) -> PeerQuery {
        let entries = match origin {
            Origin::Db => self.db.entries(),
            Origin::Staging => self.staging.entries(),
        };
        PeerQuery {
            entries: entries
                .into_iter()
                .filter(|(addr, _)| {
                    self.hub
                        .get_state(addr)
                        .map(|s| !s.is_in_connection())
                        .unwrap_or(true)
                })
                .collect(),
        }
    }

    /// Latest `state_change` per debounce group across the address book
    /// and the hub's live entries.
    ///
    /// A dialed peer leaves the connectable set the moment it turns
    /// `connecting`, so a candidate snapshot alone cannot see its
    /// groupmates' fresh activity; debouncing must consult this union.
    pub fn group_activity(&self) -> HashMap<String, u64> {
        let mut latest: HashMap<String, u64> = HashMap::new();
        {
            let mut fold = |record: &PeerRecord| {
                if let Some(t) = record.state_change {
                    let slot = latest.entry(group_key(record)).or_insert(0);
                    if t > *slot {
                        *slot = t;
                    }
                }
            };
            for (_, record) in self.db.entries() {
                fold(&record);
            }
            for (_, entry) in self.hub.entries() {
                fold(&entry.record);
            }
        }
        latest
    }
}

/// A filterable snapshot of `(Address, PeerRecord)` entries.
///
/// Combinators consume and return the query so passes chain:
/// `q.filter(..).group_debounce(..).exp_backoff(..).take(n)`.
#[derive(Debug, Clone, Default)]
pub struct PeerQuery {
    entries: Vec<(Address, PeerRecord)>,
}

impl PeerQuery {
    pub fn from_entries(entries: Vec<(Address, PeerRecord)>) -> Self {
        Self { entries }
    }

    pub fn filter(mut self, pred: impl Fn(&Address, &PeerRecord) -> bool) -> Self {
        self.entries.retain(|(a, r)| pred(a, r));
        self
    }

    pub fn take(mut self, n: usize) -> Self {
        self.entries.truncate(n);
        self
    }

    /// Stable sort ascending by `state_change`; never-attempted records
    /// sort first.
    pub fn sort_by_state_change(mut self) -> Self {
        self.entries
            .sort_by_key(|(_, r)| r.state_change.unwrap_or(0));
        self
    }

    pub fn shuffle(mut self, rng: &mut impl Rng) -> Self {
        self.entries.shuffle(rng);
        self
    }

    /// At most one entry per debounce group, and only from groups whose
    /// most recent attempt is at least `min_ms` old. Within a passing
    /// group the entry with the oldest attempt wins.
    ///
    /// `activity` is the group's last-attempt baseline beyond this
    /// snapshot (see [`Query::group_activity`]); a groupmate that was
    /// just dialed is live in the hub and no longer present here, but its
    /// timestamp must still hold the rest of its group back.
    pub fn group_debounce(
        self,
        now_ms: u64,
        min_ms: u64,
        activity: &HashMap<String, u64>,
    ) -> Self {
        let mut groups: HashMap<String, Vec<(Address, PeerRecord)>> = HashMap::new();
        for (addr, record) in self.entries {
            groups.entry(group_key(&record)).or_default().push((addr, record));
        }

        let mut entries = Vec::new();
        for (group, members) in groups {
            let own = members.iter().filter_map(|(_, r)| r.state_change).max();
            let latest = activity
                .get(&group)
                .copied()
                .into_iter()
                .chain(own)
                .max()
                .unwrap_or(0);
            if now_ms.saturating_sub(latest) < min_ms {
                continue;
            }
            if let Some(pick) = members
                .into_iter()
                .min_by_key(|(_, r)| r.state_change.unwrap_or(0))
            {
                entries.push(pick);
            }
        }
        Self { entries }
    }

    /// Keep entries whose exponential backoff window has elapsed.
    pub fn exp_backoff(
        self,
        now_ms: u64,
        step: std::time::Duration,
        max: std::time::Duration,
    ) -> Self {
        self.filter(|_, r| passes_exp_backoff(r, now_ms, step, max))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.entries.iter().map(|(a, _)| a.clone()).collect()
    }

    pub fn into_vec(self) -> Vec<(Address, PeerRecord)> {
        self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Address, PeerRecord)> {
        self.entries.iter()
    }
}

impl IntoIterator for PeerQuery {
    type Item = (Address, PeerRecord);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
