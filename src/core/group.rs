use std::collections::HashMap;

use crate::core::subscription::ConsumerId;

/// Sticky routing table: group key → consumer that currently owns it.
#[derive(Debug, Default, Clone)]
pub struct MessageGroupMap {
    owners: HashMap<String, ConsumerId>,
}

impl MessageGroupMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, group: &str) -> Option<&ConsumerId> {
        self.owners.get(group)
    }

    pub fn put(&mut self, group: impl Into<String>, owner: ConsumerId) {
        self.owners.insert(group.into(), owner);
    }

    pub fn remove_group(&mut self, group: &str) -> Option<ConsumerId> {
        self.owners.remove(group)
    }

    /// Drop every group owned by `consumer`, returning the released keys.
    pub fn remove_consumer(&mut self, consumer: &ConsumerId) -> Vec<String> {
        let released: Vec<String> = self
            .owners
            .iter()
            .filter(|(_, owner)| *owner == consumer)
            .map(|(group, _)| group.clone())
            .collect();
        for group in &released {
            self.owners.remove(group);
        }
        released
    }

    pub fn groups_of(&self, consumer: &ConsumerId) -> Vec<String> {
        let mut groups: Vec<String> = self
            .owners
            .iter()
            .filter(|(_, owner)| *owner == consumer)
            .map(|(group, _)| group.clone())
            .collect();
        groups.sort();
        groups
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn clear(&mut self) {
        self.owners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removing_a_consumer_releases_only_its_groups() {
        let mut map = MessageGroupMap::new();
        let a = ConsumerId::new("a");
        let b = ConsumerId::new("b");
        map.put("g1", a.clone());
        map.put("g2", b.clone());
        map.put("g3", a.clone());

        let mut released = map.remove_consumer(&a);
        released.sort();
        assert_eq!(released, vec!["g1".to_string(), "g3".to_string()]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("g2"), Some(&b));
        assert!(map.groups_of(&a).is_empty());
    }
}
