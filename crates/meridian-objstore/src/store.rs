//! The local object map.
//!
//! One canonical ref owns one immutable buffer. The map only ever holds
//! finalized payloads (or failure records); transfers in flight buffer
//! outside the map and are tracked separately so duplicate deliveries
//! coalesce onto a single pull.

use bytes::Bytes;
use dashmap::DashMap;
use meridian_proto::{ObjRef, ObjSnapshot};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Result, StoreError};

/// A finalized object payload.
///
/// `metadata_offset` partitions the buffer into a serialised-object prefix
/// and a binary-buffer suffix; the store treats both opaquely.
#[derive(Debug, Clone)]
pub struct Payload {
    pub metadata_offset: u64,
    pub data: Bytes,
}

impl Payload {
    /// Total payload size in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// A stored record: either a finalized payload or a failed result.
#[derive(Debug, Clone)]
enum Stored {
    Payload(Payload),
    Failed(String),
}

/// Outcome of asking to start a delivery.
#[derive(Debug)]
pub enum DeliveryTicket {
    /// The payload is already here; nothing to do.
    AlreadyPresent,
    /// Another delivery for this ref is running; attach to it.
    InFlight,
    /// The caller owns the pull. Dropping the guard settles the ticket.
    Started(DeliveryGuard),
}

/// Marks a delivery as in flight until dropped.
#[derive(Debug)]
pub struct DeliveryGuard {
    store: Arc<LocalStoreInner>,
    objref: ObjRef,
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        self.store.inflight.remove(&self.objref);
        self.store.changed.notify_waiters();
    }
}

#[derive(Debug, Default)]
struct LocalStoreInner {
    objects: DashMap<ObjRef, Stored>,
    aliases: DashMap<ObjRef, ObjRef>,
    inflight: DashMap<ObjRef, ()>,
    changed: Notify,
}

/// The per-node object store map.
#[derive(Debug, Clone, Default)]
pub struct LocalStore {
    inner: Arc<LocalStoreInner>,
}

impl LocalStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves local aliases.
    ///
    /// A payload stored under the ref itself wins over an alias edge, so
    /// a late alias never hides bytes already held.
    #[must_use]
    pub fn resolve(&self, objref: ObjRef) -> ObjRef {
        let mut current = objref;
        // Alias chains are scheduler-verified acyclic; the bound is for
        // robustness against a misbehaving peer.
        for _ in 0..64 {
            if self.inner.objects.contains_key(&current) {
                return current;
            }
            match self.inner.aliases.get(&current) {
                Some(target) => current = *target,
                None => return current,
            }
        }
        current
    }

    /// Looks up a finalized record without blocking.
    ///
    /// `None` means unknown here (possibly still in transit).
    pub fn get_finalized(&self, objref: ObjRef) -> Option<Result<Payload>> {
        let canonical = self.resolve(objref);
        self.inner.objects.get(&canonical).map(|stored| match &*stored {
            Stored::Payload(payload) => Ok(payload.clone()),
            Stored::Failed(message) => Err(StoreError::TaskFailed {
                objref,
                message: message.clone(),
            }),
        })
    }

    /// Waits until `objref` resolves to a finalized record.
    ///
    /// Blocks across pending aliases and in-flight transfers; fails fast
    /// when the record is a failed result.
    pub async fn wait_resolved(&self, objref: ObjRef) -> Result<Payload> {
        loop {
            let notified = self.inner.changed.notified();
            if let Some(result) = self.get_finalized(objref) {
                return result;
            }
            notified.await;
        }
    }

    /// Inserts a finalized payload. Idempotent: a payload already present
    /// for the ref is kept (finalized payloads are immutable).
    pub fn insert_finalized(&self, objref: ObjRef, payload: Payload) {
        use dashmap::mapref::entry::Entry;
        match self.inner.objects.entry(objref) {
            Entry::Vacant(slot) => {
                debug!(%objref, size = payload.data.len(), "payload finalized");
                slot.insert(Stored::Payload(payload));
            }
            Entry::Occupied(_) => {
                debug!(%objref, "duplicate finalize ignored");
            }
        }
        self.inner.changed.notify_waiters();
    }

    /// Records a failed result so readers observe the task's error.
    pub fn insert_failed(&self, objref: ObjRef, message: impl Into<String>) {
        use dashmap::mapref::entry::Entry;
        if let Entry::Vacant(slot) = self.inner.objects.entry(objref) {
            slot.insert(Stored::Failed(message.into()));
        }
        self.inner.changed.notify_waiters();
    }

    /// Installs a local alias. Pending until the canonical arrives.
    pub fn install_alias(&self, alias: ObjRef, canonical: ObjRef) {
        if alias == canonical {
            return;
        }
        self.inner.aliases.insert(alias, canonical);
        self.inner.changed.notify_waiters();
    }

    /// Frees the payload for `canonical`. Idempotent.
    pub fn deallocate(&self, canonical: ObjRef) {
        if self.inner.objects.remove(&canonical).is_some() {
            debug!(objref = %canonical, "payload deallocated");
        }
        self.inner.changed.notify_waiters();
    }

    /// Claims or joins the delivery of `objref`.
    pub fn begin_delivery(&self, objref: ObjRef) -> DeliveryTicket {
        if self.inner.objects.contains_key(&self.resolve(objref)) {
            return DeliveryTicket::AlreadyPresent;
        }
        use dashmap::mapref::entry::Entry;
        match self.inner.inflight.entry(objref) {
            Entry::Occupied(_) => DeliveryTicket::InFlight,
            Entry::Vacant(slot) => {
                slot.insert(());
                DeliveryTicket::Started(DeliveryGuard {
                    store: self.inner.clone(),
                    objref,
                })
            }
        }
    }

    /// Returns true when a delivery of `objref` is currently running.
    #[must_use]
    pub fn delivery_in_flight(&self, objref: ObjRef) -> bool {
        self.inner.inflight.contains_key(&objref)
    }

    /// Waits for an attached delivery to settle, then reports its result.
    pub async fn wait_delivery_settled(&self, objref: ObjRef) -> Result<()> {
        loop {
            let notified = self.inner.changed.notified();
            if !self.delivery_in_flight(objref) {
                return match self.get_finalized(objref) {
                    Some(Ok(_)) => Ok(()),
                    Some(Err(e)) => Err(e),
                    None => Err(StoreError::TransferFailed {
                        objref,
                        src: "peer".to_owned(),
                        reason: "attached transfer did not finalize".to_owned(),
                    }),
                };
            }
            notified.await;
        }
    }

    /// Diagnostic snapshot. An empty request lists every held object.
    #[must_use]
    pub fn snapshot(&self, objrefs: &[ObjRef]) -> Vec<ObjSnapshot> {
        let describe = |objref: ObjRef, stored: &Stored| match stored {
            Stored::Payload(payload) => ObjSnapshot {
                objref,
                total_size: payload.total_size(),
                metadata_offset: payload.metadata_offset,
                finalized: true,
                failed: None,
            },
            Stored::Failed(message) => ObjSnapshot {
                objref,
                total_size: 0,
                metadata_offset: 0,
                finalized: false,
                failed: Some(message.clone()),
            },
        };

        if objrefs.is_empty() {
            let mut all: Vec<ObjSnapshot> = self
                .inner
                .objects
                .iter()
                .map(|entry| describe(*entry.key(), entry.value()))
                .collect();
            all.sort_by_key(|s| s.objref);
            all
        } else {
            objrefs
                .iter()
                .filter_map(|objref| {
                    let canonical = self.resolve(*objref);
                    self.inner
                        .objects
                        .get(&canonical)
                        .map(|stored| describe(*objref, stored.value()))
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn payload(data: &[u8], metadata_offset: u64) -> Payload {
        Payload {
            metadata_offset,
            data: Bytes::copy_from_slice(data),
        }
    }

    #[test]
    fn lookup_through_alias_chain() {
        let store = LocalStore::new();
        let canonical = ObjRef::new(3);
        store.insert_finalized(canonical, payload(b"abc", 1));
        store.install_alias(ObjRef::new(5), canonical);
        store.install_alias(ObjRef::new(7), ObjRef::new(5));

        let found = store.get_finalized(ObjRef::new(7)).unwrap().unwrap();
        assert_eq!(&found.data[..], b"abc");
    }

    #[test]
    fn alias_never_duplicates_storage() {
        let store = LocalStore::new();
        let canonical = ObjRef::new(3);
        store.insert_finalized(canonical, payload(b"abc", 0));
        store.install_alias(ObjRef::new(5), canonical);

        assert_eq!(store.snapshot(&[]).len(), 1);
    }

    #[test]
    fn finalized_payload_is_immutable() {
        let store = LocalStore::new();
        let r = ObjRef::new(1);
        store.insert_finalized(r, payload(b"first", 0));
        store.insert_finalized(r, payload(b"second", 0));

        let kept = store.get_finalized(r).unwrap().unwrap();
        assert_eq!(&kept.data[..], b"first");
    }

    #[test]
    fn failed_record_surfaces_error() {
        let store = LocalStore::new();
        let r = ObjRef::new(20);
        store.insert_failed(r, "E");

        let err = store.get_finalized(r).unwrap().unwrap_err();
        assert!(matches!(err, StoreError::TaskFailed { .. }));
    }

    #[test]
    fn deallocate_is_idempotent() {
        let store = LocalStore::new();
        let r = ObjRef::new(1);
        store.insert_finalized(r, payload(b"x", 0));

        store.deallocate(r);
        store.deallocate(r);
        assert!(store.get_finalized(r).is_none());
    }

    #[test]
    fn second_delivery_attaches() {
        let store = LocalStore::new();
        let r = ObjRef::new(9);

        let first = store.begin_delivery(r);
        assert!(matches!(first, DeliveryTicket::Started(_)));

        let second = store.begin_delivery(r);
        assert!(matches!(second, DeliveryTicket::InFlight));

        drop(first);
        assert!(!store.delivery_in_flight(r));

        store.insert_finalized(r, payload(b"x", 0));
        let third = store.begin_delivery(r);
        assert!(matches!(third, DeliveryTicket::AlreadyPresent));
    }

    #[tokio::test]
    async fn wait_resolved_blocks_until_alias_and_payload_arrive() {
        let store = LocalStore::new();
        let alias = ObjRef::new(5);
        let canonical = ObjRef::new(3);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_resolved(alias).await })
        };

        // Not resolvable yet.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        store.install_alias(alias, canonical);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "pending alias must keep blocking");

        store.insert_finalized(canonical, payload(b"late", 2));
        let found = waiter.await.unwrap().unwrap();
        assert_eq!(&found.data[..], b"late");
        assert_eq!(found.metadata_offset, 2);
    }

    #[tokio::test]
    async fn attached_delivery_settles_with_outcome() {
        let store = LocalStore::new();
        let r = ObjRef::new(4);
        let ticket = store.begin_delivery(r);
        let DeliveryTicket::Started(guard) = ticket else {
            panic!("expected to own the delivery");
        };

        let attached = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_delivery_settled(r).await })
        };

        store.insert_finalized(r, payload(b"ok", 0));
        drop(guard);

        attached.await.unwrap().unwrap();
    }
}
