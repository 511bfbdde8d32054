use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::instance::ScriptInstance;
use crate::sync::{read, write};
use crate::types::{ItemId, ObjectId};

#[derive(Default)]
struct Maps {
    by_item: HashMap<ItemId, Arc<ScriptInstance>>,
    by_object: HashMap<ObjectId, BTreeSet<ItemId>>,
}

/// Owns every installed script instance
///
/// Both indexes live behind one lock, so an instance is either fully
/// registered or fully absent from the point of view of any reader.
#[derive(Default)]
pub struct InstanceRegistry {
    maps: RwLock<Maps>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look an instance up by its (object, item) pair
    pub fn get(&self, object: ObjectId, item: ItemId) -> Option<Arc<ScriptInstance>> {
        read(&self.maps)
            .by_item
            .get(&item)
            .filter(|instance| instance.object() == object)
            .cloned()
    }

    pub fn get_by_item(&self, item: ItemId) -> Option<Arc<ScriptInstance>> {
        read(&self.maps).by_item.get(&item).cloned()
    }

    /// Whether exactly this instance (not just one for the same item) is registered
    pub fn contains(&self, instance: &Arc<ScriptInstance>) -> bool {
        read(&self.maps)
            .by_item
            .get(&instance.item())
            .is_some_and(|current| Arc::ptr_eq(current, instance))
    }

    pub fn all_for_object(&self, object: ObjectId) -> Vec<Arc<ScriptInstance>> {
        let maps = read(&self.maps);
        maps.by_object
            .get(&object)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| maps.by_item.get(item).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<ScriptInstance>> {
        read(&self.maps).by_item.values().cloned().collect()
    }

    /// Insert or replace the instance for its item; returns the instance it
    /// displaced, if that was a different one
    pub fn upsert(&self, instance: Arc<ScriptInstance>) -> Option<Arc<ScriptInstance>> {
        let mut maps = write(&self.maps);
        let item = instance.item();
        let object = instance.object();

        let previous = maps.by_item.insert(item, Arc::clone(&instance));
        if let Some(previous) = &previous
            && previous.object() != object
        {
            Self::unlink_object(&mut maps, previous.object(), item);
        }
        maps.by_object.entry(object).or_default().insert(item);

        debug!(target: "registry", "Registered script {} on object {}", item, object);
        previous.filter(|previous| !Arc::ptr_eq(previous, &instance))
    }

    /// Remove exactly this instance. Idempotent, and a no-op when the item
    /// has since been taken over by a different instance.
    pub fn remove(&self, instance: &Arc<ScriptInstance>) -> bool {
        let mut maps = write(&self.maps);
        let item = instance.item();

        let is_current = maps
            .by_item
            .get(&item)
            .is_some_and(|current| Arc::ptr_eq(current, instance));
        if !is_current {
            return false;
        }

        maps.by_item.remove(&item);
        Self::unlink_object(&mut maps, instance.object(), item);
        debug!(target: "registry", "Removed script {} from object {}", item, instance.object());
        true
    }

    /// How many registered instances currently run this exact source text
    pub fn scripts_with_identical_source(&self, source: &str) -> usize {
        read(&self.maps)
            .by_item
            .values()
            .filter(|instance| instance.program().source == source)
            .count()
    }

    pub fn len(&self) -> usize {
        read(&self.maps).by_item.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unlink_object(maps: &mut Maps, object: ObjectId, item: ItemId) {
        if let Some(items) = maps.by_object.get_mut(&object) {
            items.remove(&item);
            if items.is_empty() {
                maps.by_object.remove(&object);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StartOptions;

    fn instance(object: u32, source: &str) -> Arc<ScriptInstance> {
        ScriptInstance::new(ObjectId(object), ItemId::new_v4(), source, StartOptions::new())
    }

    #[test]
    fn test_lookup_by_pair_and_item() {
        let registry = InstanceRegistry::new();
        let a = instance(1, "a");
        registry.upsert(Arc::clone(&a));

        assert!(registry.get(ObjectId(1), a.item()).is_some());
        assert!(registry.get(ObjectId(2), a.item()).is_none());
        assert!(registry.get_by_item(a.item()).is_some());
        assert_eq!(registry.all_for_object(ObjectId(1)).len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = InstanceRegistry::new();
        let a = instance(1, "a");
        registry.upsert(Arc::clone(&a));

        assert!(registry.remove(&a));
        assert!(!registry.remove(&a));
        assert!(registry.is_empty());
        assert!(registry.all_for_object(ObjectId(1)).is_empty());
    }

    #[test]
    fn test_remove_ignores_replaced_instance() {
        let registry = InstanceRegistry::new();
        let first = instance(1, "a");
        let second = ScriptInstance::new(ObjectId(1), first.item(), "b", StartOptions::new());

        registry.upsert(Arc::clone(&first));
        let displaced = registry.upsert(Arc::clone(&second));
        assert!(displaced.is_some_and(|d| Arc::ptr_eq(&d, &first)));

        // Removing the stale instance must not evict its replacement
        assert!(!registry.remove(&first));
        assert!(registry.contains(&second));
    }

    #[test]
    fn test_upsert_same_instance_reports_nothing_displaced() {
        let registry = InstanceRegistry::new();
        let a = instance(1, "a");
        registry.upsert(Arc::clone(&a));
        assert!(registry.upsert(Arc::clone(&a)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_identical_source_count() {
        let registry = InstanceRegistry::new();
        registry.upsert(instance(1, "same"));
        registry.upsert(instance(2, "same"));
        registry.upsert(instance(2, "other"));

        assert_eq!(registry.scripts_with_identical_source("same"), 2);
        assert_eq!(registry.scripts_with_identical_source("other"), 1);
        assert_eq!(registry.scripts_with_identical_source("missing"), 0);
        assert_eq!(registry.all_for_object(ObjectId(2)).len(), 2);
    }
}
