//! Rule and snapshot stores. The snapshot store is append-only: a set is
//! written once per conversion and later corrections only append reversals.

use std::collections::HashSet;

use affiliate_core::types::{EventCommissionSnapshot, PartnerTier, SnapshotKind};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::rules::{CommissionRule, RuleCondition};

pub trait RuleStore: Send + Sync {
    /// Live rules (latest version per rule key) whose campaign, tier, and
    /// event-type conditions are compatible with the given facts.
    fn active_rules_for(
        &self,
        campaign_id: Uuid,
        partner_tier: PartnerTier,
        event_type: &str,
        as_of: DateTime<Utc>,
    ) -> Vec<CommissionRule>;
}

pub trait SnapshotStore: Send + Sync {
    /// Insert the snapshot set for a conversion. Returns `false` without
    /// writing when a set already exists (uniqueness on conversion id).
    fn insert_set(
        &self,
        conversion_id: Uuid,
        snapshots: Vec<EventCommissionSnapshot>,
    ) -> bool;

    /// Append compensating reversals. Returns `false` if the set was already
    /// reversed or does not exist.
    fn append_reversals(
        &self,
        conversion_id: Uuid,
        reversals: Vec<EventCommissionSnapshot>,
    ) -> bool;

    fn snapshots_for(&self, conversion_id: &Uuid) -> Vec<EventCommissionSnapshot>;

    fn get(&self, snapshot_id: &Uuid) -> Option<EventCommissionSnapshot>;

    /// Original snapshots for a partner that have not been reversed.
    fn live_for_partner(&self, partner_id: &Uuid) -> Vec<EventCommissionSnapshot>;

    /// Partners that own at least one live snapshot.
    fn partners_with_live_snapshots(&self) -> Vec<Uuid>;

    /// Net (originals minus reversals) commission for a partner over
    /// conversions that occurred in `[from, to)`.
    fn partner_net_total(
        &self,
        partner_id: &Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Decimal;
}

// ─── In-memory rule store ───────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryRuleStore {
    rules: DashMap<Uuid, CommissionRule>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a rule as the next version of its `rule_key`.
    pub fn publish(&self, mut rule: CommissionRule) -> CommissionRule {
        let latest = self
            .rules
            .iter()
            .filter(|r| r.rule_key == rule.rule_key)
            .map(|r| r.version)
            .max()
            .unwrap_or(0);
        rule.version = latest + 1;
        info!(
            rule_id = %rule.id,
            rule_key = %rule.rule_key,
            version = rule.version,
            commission_type = rule.action.type_name(),
            "Commission rule published"
        );
        self.rules.insert(rule.id, rule.clone());
        rule
    }

    pub fn get(&self, id: &Uuid) -> Option<CommissionRule> {
        self.rules.get(id).map(|r| r.clone())
    }
}

impl RuleStore for InMemoryRuleStore {
    fn active_rules_for(
        &self,
        campaign_id: Uuid,
        partner_tier: PartnerTier,
        event_type: &str,
        as_of: DateTime<Utc>,
    ) -> Vec<CommissionRule> {
        let live: Vec<CommissionRule> = self
            .rules
            .iter()
            .filter(|r| r.is_live(as_of))
            .map(|r| r.clone())
            .collect();

        live.iter()
            .filter(|r| {
                !live
                    .iter()
                    .any(|other| other.rule_key == r.rule_key && other.version > r.version)
            })
            .filter(|r| {
                r.conditions.iter().all(|c| match c {
                    RuleCondition::Campaign(id) => *id == campaign_id,
                    RuleCondition::PartnerTier(tier) => *tier == partner_tier,
                    RuleCondition::EventType(kind) => kind.eq_ignore_ascii_case(event_type),
                    RuleCondition::Vendor(_) => true,
                })
            })
            .cloned()
            .collect()
    }
}

// ─── In-memory snapshot store ───────────────────────────────────────────────

#[derive(Default)]
pub struct InMemorySnapshotStore {
    sets: DashMap<Uuid, Vec<EventCommissionSnapshot>>,
    by_id: DashMap<Uuid, EventCommissionSnapshot>,
    by_partner: DashMap<Uuid, Vec<Uuid>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self, snapshot: &EventCommissionSnapshot) {
        self.by_id.insert(snapshot.id, snapshot.clone());
        self.by_partner
            .entry(snapshot.partner_id)
            .or_default()
            .push(snapshot.id);
    }

    pub fn count(&self) -> usize {
        self.by_id.len()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn insert_set(
        &self,
        conversion_id: Uuid,
        snapshots: Vec<EventCommissionSnapshot>,
    ) -> bool {
        match self.sets.entry(conversion_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                for s in &snapshots {
                    self.index(s);
                }
                slot.insert(snapshots);
                true
            }
        }
    }

    fn append_reversals(
        &self,
        conversion_id: Uuid,
        reversals: Vec<EventCommissionSnapshot>,
    ) -> bool {
        let Some(mut set) = self.sets.get_mut(&conversion_id) else {
            return false;
        };
        if set.iter().any(|s| s.kind == SnapshotKind::Reversal) {
            return false;
        }
        for r in &reversals {
            self.index(r);
        }
        set.extend(reversals);
        true
    }

    fn snapshots_for(&self, conversion_id: &Uuid) -> Vec<EventCommissionSnapshot> {
        self.sets
            .get(conversion_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn get(&self, snapshot_id: &Uuid) -> Option<EventCommissionSnapshot> {
        self.by_id.get(snapshot_id).map(|s| s.clone())
    }

    fn live_for_partner(&self, partner_id: &Uuid) -> Vec<EventCommissionSnapshot> {
        let Some(ids) = self.by_partner.get(partner_id).map(|ids| ids.clone()) else {
            return Vec::new();
        };
        let all: Vec<EventCommissionSnapshot> =
            ids.iter().filter_map(|id| self.get(id)).collect();
        let reversed: HashSet<Uuid> = all.iter().filter_map(|s| s.reverses).collect();
        all.into_iter()
            .filter(|s| s.kind == SnapshotKind::Original && !reversed.contains(&s.id))
            .collect()
    }

    fn partners_with_live_snapshots(&self) -> Vec<Uuid> {
        let partners: Vec<Uuid> = self.by_partner.iter().map(|e| *e.key()).collect();
        partners
            .into_iter()
            .filter(|p| !self.live_for_partner(p).is_empty())
            .collect()
    }

    fn partner_net_total(
        &self,
        partner_id: &Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Decimal {
        let Some(ids) = self.by_partner.get(partner_id).map(|ids| ids.clone()) else {
            return Decimal::ZERO;
        };
        ids.iter()
            .filter_map(|id| self.get(id))
            .filter(|s| s.conversion_occurred_at >= from && s.conversion_occurred_at < to)
            .map(|s| s.amount)
            .sum()
    }
}
