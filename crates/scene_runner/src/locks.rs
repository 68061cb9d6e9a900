//! Per-scene execution locks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Hands out one async mutex per scene id.
///
/// Holders of the same scene's lock run one at a time; different scenes do
/// not contend.
#[derive(Default)]
pub struct SceneLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SceneLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock for the given scene, created on first use.
    pub fn for_scene(&self, scene_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(scene_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the lock entry once a scene is finished.
    pub fn release(&self, scene_id: &str) {
        self.locks.lock().remove(scene_id);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_scene_shares_lock() {
        let locks = SceneLocks::new();
        let a = locks.for_scene("one");
        let b = locks.for_scene("one");
        let c = locks.for_scene("two");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(locks.len(), 2);

        locks.release("one");
        assert_eq!(locks.len(), 1);
    }
}
