//! Segments: named predicates over recipients, resolved against the store at
//! send time.

use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::{
    domain::UserId,
    store::{recipients::ActivityFilter, Store},
    Result,
};

/// Window for the `new` segment.
pub const NEW_WINDOW_DAYS: i64 = 7;
/// Window for the `active` / `inactive` segments.
pub const ACTIVITY_WINDOW_DAYS: i64 = 30;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Segment {
    #[default]
    All,
    New,
    Active,
    Inactive,
}

impl Segment {
    pub const ALL: [Segment; 4] = [Segment::All, Segment::New, Segment::Active, Segment::Inactive];

    /// Parse a stored/callback label. Unknown labels fall back to `All`.
    pub fn parse(label: &str) -> Self {
        Self::parse_strict(label).unwrap_or_else(|| {
            tracing::warn!(label, "unknown segment label, falling back to 'all'");
            Segment::All
        })
    }

    pub fn parse_strict(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "all" => Some(Segment::All),
            "new" => Some(Segment::New),
            "active" => Some(Segment::Active),
            "inactive" => Some(Segment::Inactive),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Segment::All => "all",
            Segment::New => "new",
            Segment::Active => "active",
            Segment::Inactive => "inactive",
        }
    }

    /// Operator-facing name.
    pub fn title(self) -> &'static str {
        match self {
            Segment::All => "👥 All users",
            Segment::New => "🆕 New (7 days)",
            Segment::Active => "✅ Active (30 days)",
            Segment::Inactive => "😴 Inactive",
        }
    }

    fn filter(self, now: DateTime<Utc>) -> ActivityFilter {
        match self {
            Segment::All => ActivityFilter::Any,
            Segment::New => ActivityFilter::RegisteredSince(now - Duration::days(NEW_WINDOW_DAYS)),
            Segment::Active => {
                ActivityFilter::SeenSince(now - Duration::days(ACTIVITY_WINDOW_DAYS))
            }
            Segment::Inactive => {
                ActivityFilter::NotSeenSince(now - Duration::days(ACTIVITY_WINDOW_DAYS))
            }
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Resolve a segment against the current contents of the store.
pub fn resolve(store: &Store, segment: Segment) -> Result<Vec<UserId>> {
    resolve_at(store, segment, Utc::now())
}

pub fn resolve_at(store: &Store, segment: Segment, now: DateTime<Utc>) -> Result<Vec<UserId>> {
    store.active_recipient_ids(segment.filter(now))
}

/// Resolve a raw label (as stored on a campaign).
pub fn resolve_label_at(store: &Store, label: &str, now: DateTime<Utc>) -> Result<Vec<UserId>> {
    resolve_at(store, Segment::parse(label), now)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::store::{recipients::Profile, test_support::at};

    /// 1: new & active, 2: old but active, 3: old & idle, 4: new but blocked.
    fn fixture() -> (Store, DateTime<Utc>) {
        let store = Store::open_in_memory().unwrap();
        let now = at(2026, 3, 31, 12, 0);
        let p = Profile::default();

        store.upsert_at(UserId(1), &p, None, at(2026, 3, 28, 0, 0)).unwrap();
        store.upsert_at(UserId(2), &p, None, at(2026, 1, 1, 0, 0)).unwrap();
        store.upsert_at(UserId(2), &p, None, at(2026, 3, 20, 0, 0)).unwrap();
        store.upsert_at(UserId(3), &p, None, at(2026, 1, 1, 0, 0)).unwrap();
        store.upsert_at(UserId(4), &p, None, at(2026, 3, 30, 0, 0)).unwrap();
        store.set_active(UserId(4), false).unwrap();
        (store, now)
    }

    fn set(store: &Store, seg: Segment, now: DateTime<Utc>) -> HashSet<UserId> {
        resolve_at(store, seg, now).unwrap().into_iter().collect()
    }

    #[test]
    fn segments_match_their_windows() {
        let (store, now) = fixture();
        assert_eq!(
            resolve_at(&store, Segment::All, now).unwrap(),
            vec![UserId(1), UserId(2), UserId(3)]
        );
        assert_eq!(resolve_at(&store, Segment::New, now).unwrap(), vec![UserId(1)]);
        assert_eq!(resolve_at(&store, Segment::Active, now).unwrap(), vec![UserId(1), UserId(2)]);
        assert_eq!(resolve_at(&store, Segment::Inactive, now).unwrap(), vec![UserId(3)]);
    }

    #[test]
    fn all_is_a_superset_and_new_is_disjoint_from_inactive() {
        let (store, now) = fixture();
        let all = set(&store, Segment::All, now);
        for seg in [Segment::New, Segment::Active, Segment::Inactive] {
            assert!(set(&store, seg, now).is_subset(&all), "{seg} not within all");
        }
        let new = set(&store, Segment::New, now);
        let inactive = set(&store, Segment::Inactive, now);
        assert!(new.is_disjoint(&inactive));
    }

    #[test]
    fn deactivation_removes_from_every_segment_idempotently() {
        let (store, now) = fixture();
        store.set_active(UserId(1), false).unwrap();
        let once: Vec<_> = Segment::ALL
            .iter()
            .map(|s| set(&store, *s, now))
            .collect();
        store.set_active(UserId(1), false).unwrap();
        let twice: Vec<_> = Segment::ALL
            .iter()
            .map(|s| set(&store, *s, now))
            .collect();

        assert_eq!(once, twice);
        assert!(once.iter().all(|s| !s.contains(&UserId(1))));
    }

    #[test]
    fn resolution_uses_the_time_it_is_called_with() {
        let (store, now) = fixture();
        // Ten days later user 1 is no longer "new".
        let later = now + Duration::days(10);
        assert!(resolve_at(&store, Segment::New, later).unwrap().is_empty());
    }

    #[test]
    fn unknown_labels_fall_back_to_all() {
        let (store, now) = fixture();
        assert_eq!(Segment::parse("VIP"), Segment::All);
        assert_eq!(Segment::parse(" Inactive "), Segment::Inactive);
        assert_eq!(Segment::parse_strict("vip"), None);
        assert_eq!(
            resolve_label_at(&store, "vip", now).unwrap(),
            resolve_at(&store, Segment::All, now).unwrap()
        );
    }
}
