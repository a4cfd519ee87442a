use crate::errors::OpError;
use downcast_rs::impl_downcast;
use downcast_rs::Downcast;
use std::any::type_name;
use std::borrow::Cow;
use std::collections::BTreeMap;

/// A small integer naming a native resource reachable from JS. Never reused
/// within the lifetime of the table that minted it.
pub type Rid = u32;

/// Anything the resource table can own on JS's behalf. `close` runs exactly
/// once, when the entry is removed from the table (either explicitly via
/// `close(rid)` or implicitly via `take`).
pub trait Resource: Downcast + 'static {
    fn name(&self) -> Cow<str> {
        type_name::<Self>().into()
    }

    fn close(self: Box<Self>) {}
}

impl_downcast!(Resource);

/// `rid → typed resource`, with uniform `BadResource` failures and no reuse
/// of rids. Deliberately a `BTreeMap` rather than a `HashMap`: `entries()`
/// (the backing of the `resources()` binding) is expected to produce a
/// stable, sorted listing.
#[derive(Default)]
pub struct ResourceTable {
    next_rid: Rid,
    table: BTreeMap<Rid, Box<dyn Resource>>,
}

impl ResourceTable {
    pub fn new() -> Self {
        ResourceTable {
            next_rid: 1,
            table: BTreeMap::new(),
        }
    }

    /// Adds a resource, returning the rid JS should hold onto. Monotonic:
    /// never returns an rid that is, or ever was in this process, live at
    /// the same time as another entry.
    pub fn add<T: Resource>(&mut self, resource: T) -> Rid {
        let rid = self.next_rid;
        self.next_rid += 1;
        self.table.insert(rid, Box::new(resource));
        rid
    }

    pub fn get<T: Resource>(&self, rid: Rid) -> Result<&T, OpError> {
        self.table
            .get(&rid)
            .and_then(|r| r.downcast_ref::<T>())
            .ok_or_else(|| OpError::bad_resource(format!("bad resource id: {rid}")))
    }

    pub fn get_mut<T: Resource>(&mut self, rid: Rid) -> Result<&mut T, OpError> {
        self.table
            .get_mut(&rid)
            .and_then(|r| r.downcast_mut::<T>())
            .ok_or_else(|| OpError::bad_resource(format!("bad resource id: {rid}")))
    }

    /// Removes and returns the raw boxed resource without downcasting,
    /// without running its close hook. Used by callers that need to inspect
    /// a resource before deciding how to finish closing it.
    pub fn take_any(&mut self, rid: Rid) -> Result<Box<dyn Resource>, OpError> {
        self.table
            .remove(&rid)
            .ok_or_else(|| OpError::bad_resource(format!("bad resource id: {rid}")))
    }

    pub fn take<T: Resource>(&mut self, rid: Rid) -> Result<Box<T>, OpError> {
        let boxed = self.take_any(rid)?;
        boxed
            .downcast::<T>()
            .map_err(|_| OpError::bad_resource(format!("bad resource id: {rid}")))
    }

    /// Removes the entry and runs its close hook. A second `close` on the
    /// same rid fails with `BadResource` rather than panicking or being a
    /// silent no-op.
    pub fn close(&mut self, rid: Rid) -> Result<(), OpError> {
        let resource = self.take_any(rid)?;
        resource.close();
        Ok(())
    }

    pub fn has(&self, rid: Rid) -> bool {
        self.table.contains_key(&rid)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// `{ rid: kind_name, ... }`, backing the `resources()` binding.
    pub fn entries(&self) -> BTreeMap<Rid, String> {
        self.table
            .iter()
            .map(|(rid, resource)| (*rid, resource.name().into_owned()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u32);
    impl Resource for Counter {
        fn name(&self) -> Cow<str> {
            "counter".into()
        }
    }

    #[test]
    fn add_never_returns_a_live_rid() {
        let mut table = ResourceTable::new();
        let a = table.add(Counter(1));
        let b = table.add(Counter(2));
        assert_ne!(a, b);
    }

    #[test]
    fn close_of_live_rid_then_reads_fail() {
        let mut table = ResourceTable::new();
        let rid = table.add(Counter(1));
        assert!(table.close(rid).is_ok());
        assert!(table.get::<Counter>(rid).is_err());
        assert!(table.take::<Counter>(rid).is_err());
        assert!(table.close(rid).is_err());
    }

    #[test]
    fn close_of_unknown_rid_is_bad_resource() {
        let mut table = ResourceTable::new();
        assert!(table.close(404).is_err());
    }

    #[test]
    fn entries_lists_kind_names() {
        let mut table = ResourceTable::new();
        let rid = table.add(Counter(1));
        let entries = table.entries();
        assert_eq!(entries.get(&rid).map(String::as_str), Some("counter"));
    }

    #[test]
    fn downcast_to_wrong_type_does_not_remove_entry() {
        struct Other;
        impl Resource for Other {}

        let mut table = ResourceTable::new();
        let rid = table.add(Counter(1));
        assert!(table.get::<Other>(rid).is_err());
        assert!(table.get::<Counter>(rid).is_ok());
    }
}
