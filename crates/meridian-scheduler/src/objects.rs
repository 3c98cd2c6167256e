//! The object-reference table.
//!
//! Every logical object in the cluster is named by an `ObjRef`. A ref is
//! either canonical (it owns storage) or an alias redirecting to another
//! ref; alias chains always terminate and are path-compressed on every
//! resolution. The table also carries the distributed GC state: reference
//! counts, payload locations, and the contained-reference lists used for
//! cascading decrements.

use std::collections::{BTreeMap, BTreeSet};

use meridian_proto::{ObjRef, ObjStoreId, ObjectSnapshot};
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// One object-reference record.
#[derive(Debug, Clone)]
struct ObjectEntry {
    /// Alias target; equals the ref itself on canonical refs.
    target: ObjRef,
    /// Outstanding logical references. Meaningful on canonical refs; an
    /// alias transfers its count to the canonical when the edge is drawn.
    refcount: u64,
    /// Stores holding the finalized payload. Canonical refs only.
    locations: BTreeSet<ObjStoreId>,
    /// References embedded inside the payload. Set at most once.
    contained: Option<Vec<ObjRef>>,
    /// Whether any store has reported the payload finalized.
    ready: bool,
    /// Error message when the producing task failed.
    failed: Option<String>,
    /// Whether the ref has been garbage-collected.
    retired: bool,
}

impl ObjectEntry {
    fn new(objref: ObjRef) -> Self {
        Self {
            target: objref,
            refcount: 1,
            locations: BTreeSet::new(),
            contained: None,
            ready: false,
            failed: None,
            retired: false,
        }
    }

    const fn is_canonical(&self, objref: ObjRef) -> bool {
        self.target.get() == objref.get()
    }
}

/// Effect of drawing an alias edge, to be turned into store notifications
/// and queue rechecks by the caller.
#[derive(Debug)]
pub struct AliasEffect {
    /// The effective canonical after transitive resolution.
    pub canonical: ObjRef,
    /// Stores that must be told about the new alias.
    pub notify_stores: BTreeSet<ObjStoreId>,
    /// Whether the canonical is already ready (the alias inherits it).
    pub ready: bool,
    /// Whether the edge was already present (the call was a no-op).
    pub noop: bool,
}

/// A ref retired by the garbage collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retirement {
    /// The retired canonical ref.
    pub objref: ObjRef,
    /// Stores that must deallocate the payload.
    pub locations: BTreeSet<ObjStoreId>,
}

/// The scheduler's object-reference table.
#[derive(Debug, Default)]
pub struct ObjectTable {
    entries: BTreeMap<ObjRef, ObjectEntry>,
    next_ref: u64,
}

impl ObjectTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh canonical ref with refcount 1.
    pub fn allocate(&mut self) -> ObjRef {
        self.next_ref += 1;
        let objref = ObjRef::new(self.next_ref);
        self.entries.insert(objref, ObjectEntry::new(objref));
        objref
    }

    fn entry(&self, objref: ObjRef) -> Result<&ObjectEntry> {
        self.entries
            .get(&objref)
            .ok_or(SchedulerError::UnknownObjRef(objref))
    }

    fn live_entry(&self, objref: ObjRef) -> Result<&ObjectEntry> {
        let entry = self.entry(objref)?;
        if entry.retired {
            return Err(SchedulerError::RetiredObjRef(objref));
        }
        Ok(entry)
    }

    /// Resolves the canonical ref, compressing the path walked.
    ///
    /// Canonical resolution is idempotent: the result always resolves to
    /// itself.
    pub fn canonical(&mut self, objref: ObjRef) -> Result<ObjRef> {
        let mut walked = Vec::new();
        let mut current = objref;
        loop {
            let entry = self.live_entry(current)?;
            if entry.is_canonical(current) {
                break;
            }
            walked.push(current);
            current = entry.target;
        }

        // Path compression: everything walked points at the terminal ref.
        for node in walked {
            if let Some(entry) = self.entries.get_mut(&node) {
                entry.target = current;
            }
        }

        Ok(current)
    }

    /// Resolves the canonical ref without mutating the table.
    pub fn canonical_readonly(&self, objref: ObjRef) -> Result<ObjRef> {
        let mut current = objref;
        loop {
            let entry = self.entry(current)?;
            if entry.is_canonical(current) {
                return Ok(current);
            }
            current = entry.target;
        }
    }

    /// Returns true when the ref was ever allocated (retired included).
    #[must_use]
    pub fn is_allocated(&self, objref: ObjRef) -> bool {
        self.entries.contains_key(&objref)
    }

    /// Whether the canonical of `objref` is ready.
    pub fn is_ready(&self, objref: ObjRef) -> Result<bool> {
        let canonical = self.canonical_readonly(objref)?;
        Ok(self.live_entry(canonical)?.ready)
    }

    /// The recorded failure message on the canonical, if any.
    pub fn failure(&self, objref: ObjRef) -> Result<Option<String>> {
        let canonical = self.canonical_readonly(objref)?;
        Ok(self.live_entry(canonical)?.failed.clone())
    }

    /// Stores holding the canonical payload.
    pub fn locations(&self, objref: ObjRef) -> Result<BTreeSet<ObjStoreId>> {
        let canonical = self.canonical_readonly(objref)?;
        Ok(self.live_entry(canonical)?.locations.clone())
    }

    /// Current refcount of the canonical.
    pub fn refcount(&self, objref: ObjRef) -> Result<u64> {
        let canonical = self.canonical_readonly(objref)?;
        Ok(self.live_entry(canonical)?.refcount)
    }

    /// Draws the alias edge `alias -> target`, resolving transitively.
    ///
    /// The alias's accumulated refcount transfers to the canonical; the
    /// alias holds no independent count afterwards. Cycles are rejected
    /// with the table unchanged. Redrawing an existing edge is a no-op.
    pub fn alias(&mut self, alias: ObjRef, target: ObjRef) -> Result<AliasEffect> {
        let canonical = self.canonical(target)?;

        let (is_alias, has_contained) = {
            let entry = self.live_entry(alias)?;
            (!entry.is_canonical(alias), entry.contained.is_some())
        };

        if is_alias {
            // Already an alias: same effective canonical is a no-op,
            // anything else is a conflicting redeclaration.
            let existing = self.canonical(alias)?;
            if existing == canonical {
                return Ok(AliasEffect {
                    canonical,
                    notify_stores: BTreeSet::new(),
                    ready: self.live_entry(canonical)?.ready,
                    noop: true,
                });
            }
            return Err(SchedulerError::AliasConflict {
                alias,
                existing,
                target,
            });
        }

        if canonical == alias {
            return Err(SchedulerError::AliasCycle { alias, target });
        }

        if has_contained {
            return Err(SchedulerError::ProtocolViolation(format!(
                "cannot alias {alias}: contained refs already recorded"
            )));
        }

        // The alias surrenders its locations (stores are re-pointed via
        // NotifyAlias) and its refcount.
        let (transferred, old_locations) = {
            let entry = self
                .entries
                .get_mut(&alias)
                .ok_or(SchedulerError::UnknownObjRef(alias))?;
            entry.target = canonical;
            let count = std::mem::take(&mut entry.refcount);
            let locations = std::mem::take(&mut entry.locations);
            (count, locations)
        };

        let canonical_entry = self
            .entries
            .get_mut(&canonical)
            .ok_or(SchedulerError::UnknownObjRef(canonical))?;
        canonical_entry.refcount += transferred;

        let mut notify_stores = old_locations;
        notify_stores.extend(canonical_entry.locations.iter().copied());

        debug!(%alias, %canonical, transferred, "alias recorded");
        Ok(AliasEffect {
            canonical,
            notify_stores,
            ready: canonical_entry.ready,
            noop: false,
        })
    }

    /// Marks the canonical of `objref` ready at `store`.
    ///
    /// Returns any retirements triggered by a deferred zero count.
    pub fn mark_ready(&mut self, objref: ObjRef, store: ObjStoreId) -> Result<(ObjRef, Vec<Retirement>)> {
        let canonical = self.canonical(objref)?;
        let entry = self
            .entries
            .get_mut(&canonical)
            .ok_or(SchedulerError::UnknownObjRef(canonical))?;
        entry.ready = true;
        entry.locations.insert(store);

        let mut retired = Vec::new();
        if entry.refcount == 0 {
            // A zero count was held pending readiness; collect it now.
            self.retire(canonical, &mut retired)?;
        }
        Ok((canonical, retired))
    }

    /// Increments the canonical's refcount by `by`.
    pub fn increment(&mut self, objref: ObjRef, by: u64) -> Result<()> {
        let canonical = self.canonical(objref)?;
        let entry = self
            .entries
            .get_mut(&canonical)
            .ok_or(SchedulerError::UnknownObjRef(canonical))?;
        entry.refcount += by;
        Ok(())
    }

    /// Decrements the canonical's refcount by `by`.
    ///
    /// A count reaching zero retires the ref when it is ready (or failed
    /// with nothing stored); otherwise retirement is deferred until
    /// readiness. Retirement cascades through contained refs.
    pub fn decrement(&mut self, objref: ObjRef, by: u64) -> Result<Vec<Retirement>> {
        let canonical = self.canonical(objref)?;
        let entry = self
            .entries
            .get_mut(&canonical)
            .ok_or(SchedulerError::UnknownObjRef(canonical))?;

        if entry.refcount < by {
            return Err(SchedulerError::ProtocolViolation(format!(
                "refcount of {canonical} would drop below zero"
            )));
        }
        entry.refcount -= by;

        let mut retired = Vec::new();
        if entry.refcount == 0 {
            let collectable = entry.ready || (entry.failed.is_some() && entry.locations.is_empty());
            if collectable {
                self.retire(canonical, &mut retired)?;
            } else {
                debug!(%canonical, "zero count held for not-yet-ready ref");
            }
        }
        Ok(retired)
    }

    /// Records the refs embedded inside the payload of `objref`.
    ///
    /// May be set at most once; each contained ref gains one count held by
    /// the container.
    pub fn add_contained(&mut self, objref: ObjRef, contained: Vec<ObjRef>) -> Result<()> {
        let canonical = self.canonical(objref)?;
        {
            let entry = self.live_entry(canonical)?;
            if entry.contained.is_some() {
                return Err(SchedulerError::ProtocolViolation(format!(
                    "contained refs of {canonical} already recorded"
                )));
            }
        }

        // Validate and count before recording so a bad list leaves the
        // table unchanged.
        for child in &contained {
            self.live_entry(self.canonical_readonly(*child)?)?;
        }
        for child in contained.clone() {
            self.increment(child, 1)?;
        }

        let entry = self
            .entries
            .get_mut(&canonical)
            .ok_or(SchedulerError::UnknownObjRef(canonical))?;
        entry.contained = Some(contained);
        Ok(())
    }

    /// Records a failure message on the canonical of `objref`.
    pub fn mark_failed(&mut self, objref: ObjRef, message: &str) -> Result<()> {
        let canonical = self.canonical(objref)?;
        let entry = self
            .entries
            .get_mut(&canonical)
            .ok_or(SchedulerError::UnknownObjRef(canonical))?;
        if entry.failed.is_none() {
            entry.failed = Some(message.to_owned());
        }
        Ok(())
    }

    fn retire(&mut self, canonical: ObjRef, out: &mut Vec<Retirement>) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&canonical)
            .ok_or(SchedulerError::UnknownObjRef(canonical))?;
        debug_assert!(entry.is_canonical(canonical));
        debug_assert_eq!(entry.refcount, 0);

        entry.retired = true;
        let locations = std::mem::take(&mut entry.locations);
        let contained = entry.contained.take().unwrap_or_default();

        debug!(%canonical, stores = locations.len(), "ref retired");
        out.push(Retirement {
            objref: canonical,
            locations,
        });

        // Cascade: the container's hold on each contained ref is released.
        for child in contained {
            let child_retired = self.decrement(child, 1)?;
            out.extend(child_retired);
        }
        Ok(())
    }

    /// Live aliases resolving to `canonical`, in ref order.
    ///
    /// Used to tell a store that just received a canonical payload about
    /// the names that redirect to it.
    #[must_use]
    pub fn aliases_of(&self, canonical: ObjRef) -> Vec<ObjRef> {
        self.entries
            .iter()
            .filter(|(objref, entry)| {
                !entry.retired
                    && !entry.is_canonical(**objref)
                    && self
                        .canonical_readonly(**objref)
                        .is_ok_and(|c| c == canonical)
            })
            .map(|(objref, _)| *objref)
            .collect()
    }

    /// Snapshots every entry for introspection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ObjectSnapshot> {
        self.entries
            .iter()
            .map(|(objref, entry)| {
                let canonical = self
                    .canonical_readonly(*objref)
                    .unwrap_or(entry.target);
                ObjectSnapshot {
                    objref: *objref,
                    canonical,
                    refcount: entry.refcount,
                    ready: entry.ready,
                    retired: entry.retired,
                    locations: entry.locations.iter().copied().collect(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(id: u64) -> ObjStoreId {
        ObjStoreId::new(id)
    }

    #[test]
    fn allocate_is_fresh_and_counted() {
        let mut table = ObjectTable::new();
        let r1 = table.allocate();
        let r2 = table.allocate();
        assert_ne!(r1, r2);
        assert_eq!(table.refcount(r1).unwrap(), 1);
        assert!(!table.is_ready(r1).unwrap());
    }

    #[test]
    fn canonical_is_idempotent() {
        let mut table = ObjectTable::new();
        let a = table.allocate();
        let b = table.allocate();
        let c = table.allocate();

        table.alias(b, c).unwrap();
        table.alias(a, b).unwrap();

        let canon = table.canonical(a).unwrap();
        assert_eq!(canon, c);
        assert_eq!(table.canonical(canon).unwrap(), canon);
    }

    #[test]
    fn alias_chain_is_path_compressed() {
        let mut table = ObjectTable::new();
        let a = table.allocate();
        let b = table.allocate();
        let c = table.allocate();

        table.alias(b, c).unwrap();
        table.alias(a, b).unwrap();
        table.canonical(a).unwrap();

        // After compression, a points directly at c.
        assert_eq!(table.entries.get(&a).unwrap().target, c);
    }

    #[test]
    fn alias_cycle_rejected() {
        let mut table = ObjectTable::new();
        let a = table.allocate();
        let b = table.allocate();

        table.alias(b, a).unwrap();
        let err = table.alias(a, b).unwrap_err();
        assert!(matches!(err, SchedulerError::AliasCycle { .. }));

        // State unchanged: a is still canonical.
        assert_eq!(table.canonical(a).unwrap(), a);
    }

    #[test]
    fn self_alias_rejected() {
        let mut table = ObjectTable::new();
        let a = table.allocate();
        let err = table.alias(a, a).unwrap_err();
        assert!(matches!(err, SchedulerError::AliasCycle { .. }));
    }

    #[test]
    fn realias_same_target_is_noop() {
        let mut table = ObjectTable::new();
        let a = table.allocate();
        let b = table.allocate();

        let first = table.alias(a, b).unwrap();
        assert!(!first.noop);

        let second = table.alias(a, b).unwrap();
        assert!(second.noop);
        assert_eq!(second.canonical, b);
        // Refcount not transferred twice.
        assert_eq!(table.refcount(b).unwrap(), 2);
    }

    #[test]
    fn realias_different_target_conflicts() {
        let mut table = ObjectTable::new();
        let a = table.allocate();
        let b = table.allocate();
        let c = table.allocate();

        table.alias(a, b).unwrap();
        let err = table.alias(a, c).unwrap_err();
        assert!(matches!(err, SchedulerError::AliasConflict { .. }));
    }

    #[test]
    fn alias_transfers_refcount() {
        let mut table = ObjectTable::new();
        let a = table.allocate();
        let b = table.allocate();
        table.increment(a, 2).unwrap();

        table.alias(a, b).unwrap();

        // a held 3, b held 1: after the transfer b owns all 4.
        assert_eq!(table.refcount(b).unwrap(), 4);
        assert_eq!(table.refcount(a).unwrap(), 4); // resolves through the alias
    }

    #[test]
    fn alias_inherits_readiness() {
        let mut table = ObjectTable::new();
        let a = table.allocate();
        let b = table.allocate();
        table.mark_ready(b, store(1)).unwrap();

        let effect = table.alias(a, b).unwrap();
        assert!(effect.ready);
        assert!(table.is_ready(a).unwrap());
        assert_eq!(effect.notify_stores, BTreeSet::from([store(1)]));
    }

    #[test]
    fn ready_via_alias_lands_on_canonical() {
        let mut table = ObjectTable::new();
        let a = table.allocate();
        let b = table.allocate();
        table.alias(a, b).unwrap();

        let (canonical, retired) = table.mark_ready(a, store(2)).unwrap();
        assert_eq!(canonical, b);
        assert!(retired.is_empty());
        assert_eq!(table.locations(b).unwrap(), BTreeSet::from([store(2)]));
    }

    #[test]
    fn increment_then_decrement_restores_state() {
        let mut table = ObjectTable::new();
        let r = table.allocate();
        table.mark_ready(r, store(1)).unwrap();

        let before = table.refcount(r).unwrap();
        table.increment(r, 1).unwrap();
        let retired = table.decrement(r, 1).unwrap();
        assert!(retired.is_empty());
        assert_eq!(table.refcount(r).unwrap(), before);
    }

    #[test]
    fn decrement_to_zero_retires_ready_ref() {
        let mut table = ObjectTable::new();
        let r = table.allocate();
        table.mark_ready(r, store(1)).unwrap();
        table.mark_ready(r, store(2)).unwrap();

        let retired = table.decrement(r, 1).unwrap();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].objref, r);
        assert_eq!(retired[0].locations, BTreeSet::from([store(1), store(2)]));

        // Once retired, always retired.
        assert!(matches!(
            table.refcount(r),
            Err(SchedulerError::RetiredObjRef(_))
        ));
    }

    #[test]
    fn zero_count_on_unready_ref_is_deferred() {
        let mut table = ObjectTable::new();
        let r = table.allocate();

        let retired = table.decrement(r, 1).unwrap();
        assert!(retired.is_empty(), "deallocation must wait for readiness");

        // Readiness arrives; the held zero count collects now.
        let (_, retired) = table.mark_ready(r, store(1)).unwrap();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].objref, r);
    }

    #[test]
    fn decrement_below_zero_is_a_violation() {
        let mut table = ObjectTable::new();
        let r = table.allocate();
        table.mark_ready(r, store(1)).unwrap();

        let err = table.decrement(r, 2).unwrap_err();
        assert!(matches!(err, SchedulerError::ProtocolViolation(_)));
    }

    #[test]
    fn contained_refs_cascade_on_retirement() {
        let mut table = ObjectTable::new();
        let container = table.allocate();
        let child_a = table.allocate();
        let child_b = table.allocate();

        table.mark_ready(container, store(1)).unwrap();
        table.mark_ready(child_a, store(1)).unwrap();
        table.mark_ready(child_b, store(2)).unwrap();

        table
            .add_contained(container, vec![child_a, child_b])
            .unwrap();
        assert_eq!(table.refcount(child_a).unwrap(), 2);

        // Children's submitters drop their holds; the container keeps
        // them alive.
        table.decrement(child_a, 1).unwrap();
        table.decrement(child_b, 1).unwrap();
        assert_eq!(table.refcount(child_a).unwrap(), 1);

        // Dropping the container cascades into both children.
        let retired = table.decrement(container, 1).unwrap();
        let refs: Vec<ObjRef> = retired.iter().map(|r| r.objref).collect();
        assert_eq!(refs, vec![container, child_a, child_b]);
    }

    #[test]
    fn contained_set_at_most_once() {
        let mut table = ObjectTable::new();
        let container = table.allocate();
        let child = table.allocate();

        table.add_contained(container, vec![child]).unwrap();
        let err = table.add_contained(container, vec![child]).unwrap_err();
        assert!(matches!(err, SchedulerError::ProtocolViolation(_)));
    }

    #[test]
    fn retired_refs_stay_retired() {
        let mut table = ObjectTable::new();
        let r = table.allocate();
        table.mark_ready(r, store(1)).unwrap();
        table.decrement(r, 1).unwrap();

        assert!(matches!(
            table.mark_ready(r, store(2)),
            Err(SchedulerError::RetiredObjRef(_))
        ));
        assert!(matches!(
            table.increment(r, 1),
            Err(SchedulerError::RetiredObjRef(_))
        ));

        // A retired ref cannot be aliased onto a live target either.
        let target = table.allocate();
        table.mark_ready(target, store(2)).unwrap();
        assert!(matches!(
            table.alias(r, target),
            Err(SchedulerError::RetiredObjRef(_))
        ));
    }

    #[test]
    fn failed_unstored_ref_collects_without_readiness() {
        let mut table = ObjectTable::new();
        let r = table.allocate();
        table.mark_failed(r, "transfer failed").unwrap();

        let retired = table.decrement(r, 1).unwrap();
        assert_eq!(retired.len(), 1);
        assert!(retired[0].locations.is_empty());
    }

    #[test]
    fn unknown_ref_is_rejected() {
        let table = ObjectTable::new();
        assert!(matches!(
            table.canonical_readonly(ObjRef::new(7)),
            Err(SchedulerError::UnknownObjRef(_))
        ));
    }
}
