//! Named and anonymous one-shot/periodic timers
//!
//! Each armed timer is a tokio task that posts its fire events back to
//! the engine task through the `on_fire` callback; stopping a timer
//! aborts the task. A fire that was already queued when its timer was
//! stopped is dropped by the engine because the id is no longer
//! registered.

use crate::condition::FuncRef;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Timer identifier; ids are positive and monotonically increasing,
/// 0 is reserved and never assigned
pub type TimerId = u64;

/// Intervals below this are clamped up
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

type FireFn = Arc<dyn Fn(TimerId) + Send + Sync>;
type RemoveHook = Box<dyn FnOnce() + Send>;

/// A registered timer
pub struct TimerEntry {
    pub id: TimerId,
    pub name: Option<String>,
    pub interval: Duration,
    pub periodic: bool,
    /// Callback for anonymous timers; named timers are fire-only and are
    /// observed through rule scans (`timers[name].firing`)
    pub callback: Option<FuncRef>,
    /// Script that started the timer
    pub owner: Option<PathBuf>,
    handle: JoinHandle<()>,
}

/// Registry of live timers
pub struct TimerRegistry {
    entries: HashMap<TimerId, TimerEntry>,
    by_name: HashMap<String, TimerId>,
    remove_hooks: HashMap<TimerId, Vec<RemoveHook>>,
    next_id: TimerId,
    /// Timer whose fire caused the scan currently running, if any
    firing: Option<TimerId>,
    rt: tokio::runtime::Handle,
    on_fire: FireFn,
}

impl TimerRegistry {
    #[must_use]
    pub fn new(rt: tokio::runtime::Handle, on_fire: FireFn) -> Self {
        Self {
            entries: HashMap::new(),
            by_name: HashMap::new(),
            remove_hooks: HashMap::new(),
            next_id: 1,
            firing: None,
            rt,
            on_fire,
        }
    }

    /// Arm a timer and return its id.
    ///
    /// Starting a named timer stops any existing timer of the same name
    /// first. Periodic timers re-arm from the time of the last fire; they
    /// are not drift-corrected against the wall clock.
    pub fn start(
        &mut self,
        name: Option<String>,
        interval: Duration,
        periodic: bool,
        callback: Option<FuncRef>,
        owner: Option<PathBuf>,
    ) -> TimerId {
        if let Some(name) = &name {
            self.stop_by_name(name);
        }
        let interval = interval.max(MIN_INTERVAL);

        let id = self.next_id;
        self.next_id += 1;

        let on_fire = Arc::clone(&self.on_fire);
        let handle = self.rt.spawn(async move {
            if periodic {
                loop {
                    tokio::time::sleep(interval).await;
                    on_fire(id);
                }
            } else {
                tokio::time::sleep(interval).await;
                on_fire(id);
            }
        });

        if let Some(name) = &name {
            self.by_name.insert(name.clone(), id);
        }
        self.entries.insert(
            id,
            TimerEntry {
                id,
                name,
                interval,
                periodic,
                callback,
                owner,
                handle,
            },
        );
        id
    }

    #[must_use]
    pub fn entry(&self, id: TimerId) -> Option<&TimerEntry> {
        self.entries.get(&id)
    }

    /// Number of armed timers.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn id_by_name(&self, name: &str) -> Option<TimerId> {
        self.by_name.get(name).copied()
    }

    /// Stop a timer by id, returning its callback (if any) so the host
    /// can release the captured function. Id 0 is reserved; stopping it
    /// is a logged no-op.
    pub fn stop_by_id(&mut self, id: TimerId) -> Option<FuncRef> {
        if id == 0 {
            tracing::warn!("timer id cannot be zero");
            return None;
        }
        match self.remove_entry(id) {
            Some(entry) => entry.callback,
            None => {
                tracing::debug!("stop of unknown timer {}", id);
                None
            }
        }
    }

    /// Stop the named timer if one is running.
    pub fn stop_by_name(&mut self, name: &str) -> Option<FuncRef> {
        let id = self.by_name.get(name).copied()?;
        self.remove_entry(id).and_then(|e| e.callback)
    }

    /// Stop every timer owned by the given script; used by reload
    /// cleanup. Returns the callbacks of the stopped timers.
    pub fn stop_owned(&mut self, owner: &Path) -> Vec<FuncRef> {
        let doomed: Vec<TimerId> = self
            .entries
            .values()
            .filter(|e| e.owner.as_deref() == Some(owner))
            .map(|e| e.id)
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| self.remove_entry(id).and_then(|e| e.callback))
            .collect()
    }

    /// Register a hook run when the timer dies for any reason.
    pub fn on_remove(&mut self, id: TimerId, hook: RemoveHook) {
        self.remove_hooks.entry(id).or_default().push(hook);
    }

    /// Drop a one-shot timer that has delivered its fire, returning its
    /// callback for release.
    pub fn complete_oneshot(&mut self, id: TimerId) -> Option<FuncRef> {
        if self.entries.get(&id).is_some_and(|e| !e.periodic) {
            return self.remove_entry(id).and_then(|e| e.callback);
        }
        None
    }

    /// Mark the timer whose fire induced the current scan.
    pub fn set_firing(&mut self, id: Option<TimerId>) {
        self.firing = id;
    }

    /// True only during scans caused by the named timer's own fire.
    #[must_use]
    pub fn is_firing(&self, name: &str) -> bool {
        self.firing
            .is_some_and(|id| self.by_name.get(name) == Some(&id))
    }

    fn remove_entry(&mut self, id: TimerId) -> Option<TimerEntry> {
        let entry = self.entries.remove(&id)?;
        entry.handle.abort();
        if let Some(name) = &entry.name {
            if self.by_name.get(name) == Some(&id) {
                self.by_name.remove(name);
            }
        }
        if let Some(hooks) = self.remove_hooks.remove(&id) {
            for hook in hooks {
                hook();
            }
        }
        Some(entry)
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        for entry in self.entries.values() {
            entry.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn registry() -> (TimerRegistry, Arc<Mutex<Vec<TimerId>>>) {
        let fires: Arc<Mutex<Vec<TimerId>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = fires.clone();
        let registry = TimerRegistry::new(
            tokio::runtime::Handle::current(),
            Arc::new(move |id| sink.lock().unwrap().push(id)),
        );
        (registry, fires)
    }

    #[tokio::test]
    async fn test_ids_are_positive_and_increasing() {
        let (mut registry, _) = registry();
        let a = registry.start(None, Duration::from_secs(60), false, Some(1), None);
        let b = registry.start(None, Duration::from_secs(60), false, Some(2), None);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[tokio::test]
    async fn test_interval_clamped() {
        let (mut registry, _) = registry();
        let id = registry.start(None, Duration::ZERO, false, Some(1), None);
        assert_eq!(registry.entry(id).unwrap().interval, MIN_INTERVAL);
    }

    #[tokio::test]
    async fn test_stop_zero_is_noop() {
        let (mut registry, _) = registry();
        registry.stop_by_id(0);
    }

    #[tokio::test]
    async fn test_named_timer_replaces_previous() {
        let (mut registry, _) = registry();
        let a = registry.start(
            Some("t".to_string()),
            Duration::from_secs(60),
            true,
            None,
            None,
        );
        let b = registry.start(
            Some("t".to_string()),
            Duration::from_secs(60),
            true,
            None,
            None,
        );
        assert!(registry.entry(a).is_none());
        assert_eq!(registry.id_by_name("t"), Some(b));
    }

    #[tokio::test]
    async fn test_periodic_fires_repeatedly() {
        let (registry, fires) = {
            let (mut registry, fires) = registry();
            registry.start(
                Some("tick".to_string()),
                Duration::from_millis(5),
                true,
                None,
                None,
            );
            (registry, fires)
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(fires.lock().unwrap().len() >= 3);
        drop(registry);
    }

    #[tokio::test]
    async fn test_stopped_timer_fires_no_more() {
        let (mut registry, fires) = registry();
        registry.start(
            Some("t".to_string()),
            Duration::from_millis(5),
            true,
            None,
            None,
        );
        registry.stop_by_name("t");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(fires.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_hooks_run_once() {
        let (mut registry, _) = registry();
        let count = Arc::new(AtomicUsize::new(0));
        let id = registry.start(None, Duration::from_secs(60), false, Some(1), None);
        let counter = count.clone();
        registry.on_remove(
            id,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        registry.stop_by_id(id);
        registry.stop_by_id(id);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_firing_flag() {
        let (mut registry, _) = registry();
        let id = registry.start(
            Some("t".to_string()),
            Duration::from_secs(60),
            true,
            None,
            None,
        );
        assert!(!registry.is_firing("t"));
        registry.set_firing(Some(id));
        assert!(registry.is_firing("t"));
        assert!(!registry.is_firing("u"));
        registry.set_firing(None);
        assert!(!registry.is_firing("t"));
    }

    #[tokio::test]
    async fn test_stop_owned() {
        let (mut registry, _) = registry();
        let owner = PathBuf::from("/scripts/a.js");
        let a = registry.start(
            None,
            Duration::from_secs(60),
            true,
            Some(1),
            Some(owner.clone()),
        );
        let b = registry.start(None, Duration::from_secs(60), true, Some(2), None);
        registry.stop_owned(&owner);
        assert!(registry.entry(a).is_none());
        assert!(registry.entry(b).is_some());
    }
}
