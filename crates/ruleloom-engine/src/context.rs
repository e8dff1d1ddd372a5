use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cooldown::CooldownLedger;
use crate::node::Node;
use crate::platform::{Location, Platform, Subject};
use crate::scheduler::Scheduler;

/// Property key holding the trigger location
pub const LOCATION_KEY: &str = "location";
/// Property key holding the equipment slot involved in the trigger
pub const SLOT_KEY: &str = "slot";

/// Engine services reachable from every context
pub struct Services<T> {
    platform: Arc<dyn Platform<T>>,
    scheduler: Arc<dyn Scheduler>,
    cooldowns: Arc<CooldownLedger>,
    rng: Mutex<StdRng>,
}

impl<T: Subject> Services<T> {
    pub fn new(
        platform: Arc<dyn Platform<T>>,
        scheduler: Arc<dyn Scheduler>,
        cooldowns: Arc<CooldownLedger>,
    ) -> Self {
        Self {
            platform,
            scheduler,
            cooldowns,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Make chance rolls reproducible
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn platform(&self) -> &dyn Platform<T> {
        self.platform.as_ref()
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn cooldowns(&self) -> &Arc<CooldownLedger> {
        &self.cooldowns
    }

    /// Draw a value in `[0, 1)`
    pub fn roll(&self) -> f64 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen::<f64>()
    }
}

struct ContextInner<T> {
    subject: Arc<T>,
    properties: RwLock<HashMap<String, Node>>,
    targets: RwLock<Vec<Arc<T>>>,
    services: Arc<Services<T>>,
}

/// Per-trigger state shared by every rule evaluated for that trigger.
///
/// Cloning yields another handle to the same state: a property written by
/// one branch is visible to siblings evaluated later and to delayed
/// continuations running on other threads.
pub struct Context<T> {
    inner: Arc<ContextInner<T>>,
}

impl<T> Clone for Context<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Subject> Context<T> {
    pub fn new(subject: Arc<T>, services: Arc<Services<T>>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                subject,
                properties: RwLock::new(HashMap::new()),
                targets: RwLock::new(Vec::new()),
                services,
            }),
        }
    }

    /// Builder-style property assignment
    pub fn with_property(self, key: impl Into<String>, value: impl Into<Node>) -> Self {
        self.set(key, value);
        self
    }

    pub fn subject(&self) -> &T {
        &self.inner.subject
    }

    pub fn services(&self) -> &Arc<Services<T>> {
        &self.inner.services
    }

    pub fn platform(&self) -> &dyn Platform<T> {
        self.inner.services.platform()
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        self.inner.services.scheduler()
    }

    pub fn cooldowns(&self) -> &CooldownLedger {
        self.inner.services.cooldowns()
    }

    pub fn roll_chance(&self) -> f64 {
        self.inner.services.roll()
    }

    /// Resolve an external placeholder for this context's subject
    pub fn resolve_placeholder(&self, name: &str) -> Option<String> {
        self.platform().resolve_placeholder(self.subject(), name)
    }

    pub fn get(&self, key: &str) -> Option<Node> {
        self.inner
            .properties
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn get_text(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|node| match node {
            Node::Scalar(_) => node.text(),
            structured => Some(structured.to_json()),
        })
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|node| node.as_f64())
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Node>) -> Option<Node> {
        self.inner
            .properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Node> {
        self.inner
            .properties
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn location(&self) -> Option<Location> {
        let node = self.get(LOCATION_KEY)?;
        Some(Location {
            world: node.get("world")?.text()?,
            x: node.get("x")?.as_f64()?,
            y: node.get("y")?.as_f64()?,
            z: node.get("z")?.as_f64()?,
        })
    }

    pub fn set_location(&self, location: &Location) {
        let mut map = IndexMap::new();
        map.insert("world".to_string(), Node::from(location.world.as_str()));
        map.insert("x".to_string(), Node::from(location.x));
        map.insert("y".to_string(), Node::from(location.y));
        map.insert("z".to_string(), Node::from(location.z));
        self.set(LOCATION_KEY, Node::Map(map));
    }

    pub fn slot(&self) -> Option<i64> {
        self.get(SLOT_KEY).and_then(|node| node.as_i64())
    }

    pub fn set_slot(&self, slot: i64) {
        self.set(SLOT_KEY, slot);
    }

    /// Temporary broadcast targets, empty when the rule addresses only the
    /// subject
    pub fn targets(&self) -> Vec<Arc<T>> {
        self.inner
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_targets(&self, targets: Vec<Arc<T>>) {
        *self
            .inner
            .targets
            .write()
            .unwrap_or_else(PoisonError::into_inner) = targets;
    }

    pub fn clear_targets(&self) {
        self.set_targets(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NullPlatform;
    use crate::scheduler::TickScheduler;

    fn context() -> Context<String> {
        let services = Services::new(
            Arc::new(NullPlatform),
            Arc::new(TickScheduler::new()),
            Arc::new(CooldownLedger::new()),
        );
        Context::new(Arc::new("alice".to_string()), Arc::new(services))
    }

    #[test]
    fn test_clones_share_properties() {
        let ctx = context();
        let sibling = ctx.clone();

        ctx.set("viewer", "bob");
        assert_eq!(sibling.get_text("viewer").as_deref(), Some("bob"));

        sibling.remove("viewer");
        assert!(ctx.get("viewer").is_none());
    }

    #[test]
    fn test_location_round_trip() {
        let ctx = context();
        assert!(ctx.location().is_none());

        let location = Location::new("world_nether", 10.5, 64.0, -3.2);
        ctx.set_location(&location);
        assert_eq!(ctx.location(), Some(location));
    }

    #[test]
    fn test_slot_and_numbers() {
        let ctx = context().with_property("level", "12");
        ctx.set_slot(3);
        assert_eq!(ctx.slot(), Some(3));
        assert_eq!(ctx.get_f64("level"), Some(12.0));
    }

    #[test]
    fn test_targets() {
        let ctx = context();
        assert!(ctx.targets().is_empty());
        ctx.set_targets(vec![Arc::new("bob".to_string())]);
        assert_eq!(ctx.targets().len(), 1);
        ctx.clear_targets();
        assert!(ctx.targets().is_empty());
    }

    #[test]
    fn test_visible_from_other_thread() {
        let ctx = context();
        let remote = ctx.clone();
        std::thread::spawn(move || remote.set("from_thread", 1_i64))
            .join()
            .unwrap();
        assert_eq!(ctx.get_f64("from_thread"), Some(1.0));
    }

    #[test]
    fn test_seeded_rolls_repeat() {
        let make = || {
            Services::<String>::new(
                Arc::new(NullPlatform),
                Arc::new(TickScheduler::new()),
                Arc::new(CooldownLedger::new()),
            )
            .with_seed(7)
        };
        let a: Vec<f64> = (0..5).map(|_| make().roll()).collect();
        let first = make();
        let b: Vec<f64> = (0..5).map(|_| first.roll()).collect();
        assert_eq!(a[0], b[0]);
        assert!(b.iter().all(|r| (0.0..1.0).contains(r)));
    }
}
