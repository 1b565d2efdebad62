// Lock manager (§4.2).
//
// One reentrant lock per event variant, ordered by a dependency DAG.
// Regardless of acquisition mode, every thread locks its required subset
// of variants in the same fixed global order (a topological layering of
// the DAG) so that no two threads can ever wait on each other's held
// locks in opposite directions (P5: deadlock freedom under concurrent
// stress). The mode only changes *which* variants are in the subset:
//
// - `AddDependencies` (Add operations): the variant plus everything it
//   depends on (its ancestors), so parent records exist before children
//   reference them.
// - `RemoveDependents` (Remove operations): the variant plus everything
//   that depends on it (its descendants), so no dependent record can be
//   concurrently created against something being removed.

use crate::event::Variant;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    AddDependencies,
    RemoveDependents,
}

struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

struct VariantLock {
    state: Mutex<LockState>,
    condvar: Condvar,
}

impl VariantLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(LockState { owner: None, depth: 0 }),
            condvar: Condvar::new(),
        }
    }

    fn acquire(&self, tid: ThreadId) {
        let mut state = self.state.lock();
        loop {
            match state.owner {
                Some(owner) if owner == tid => {
                    state.depth += 1;
                    return;
                }
                None => {
                    state.owner = Some(tid);
                    state.depth = 1;
                    return;
                }
                Some(_) => {
                    self.condvar.wait(&mut state);
                }
            }
        }
    }

    fn release(&self, tid: ThreadId) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(tid));
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.condvar.notify_one();
        }
    }

    fn is_held_by(&self, tid: ThreadId) -> bool {
        self.state.lock().owner == Some(tid)
    }
}

/// A held set of variant locks, released in reverse acquisition order on
/// drop.
pub struct LockGuardSet<'a> {
    manager: &'a LockManager,
    held: Vec<Variant>,
    tid: ThreadId,
}

impl<'a> Drop for LockGuardSet<'a> {
    fn drop(&mut self) {
        for variant in self.held.iter().rev() {
            self.manager.locks[variant].release(self.tid);
        }
    }
}

/// Registered dependency DAG plus the locks it governs.
pub struct LockManager {
    locks: HashMap<Variant, VariantLock>,
    /// variant -> direct parents (what it depends on)
    parents: HashMap<Variant, Vec<Variant>>,
    /// variant -> direct children (what depends on it)
    children: HashMap<Variant, Vec<Variant>>,
    /// Fixed global acquisition order: a topological layering of the DAG.
    global_order: Vec<Variant>,
}

impl LockManager {
    /// Builds the manager with the DAG fixed by §4.2:
    /// user -> (user-to-group, user-to-component, user-to-entity)
    /// group -> (user-to-group, group-to-group, group-to-component, group-to-entity)
    /// entity-type -> (entity, user-to-entity, group-to-entity)
    /// entity -> (user-to-entity, group-to-entity)
    pub fn new() -> Self {
        use Variant::*;

        let edges: &[(Variant, Variant)] = &[
            (User, UserToGroupMapping),
            (User, UserToComponentAccess),
            (User, UserToEntityMapping),
            (Group, UserToGroupMapping),
            (Group, GroupToGroupMapping),
            (Group, GroupToComponentAccess),
            (Group, GroupToEntityMapping),
            (EntityType, Entity),
            (EntityType, UserToEntityMapping),
            (EntityType, GroupToEntityMapping),
            (Entity, UserToEntityMapping),
            (Entity, GroupToEntityMapping),
        ];

        let mut parents: HashMap<Variant, Vec<Variant>> =
            Variant::ALL.iter().map(|v| (*v, Vec::new())).collect();
        let mut children: HashMap<Variant, Vec<Variant>> =
            Variant::ALL.iter().map(|v| (*v, Vec::new())).collect();

        for (parent, child) in edges {
            parents.get_mut(child).unwrap().push(*parent);
            children.get_mut(parent).unwrap().push(*child);
        }

        let global_order = topological_layering(&parents);

        let locks = Variant::ALL.iter().map(|v| (*v, VariantLock::new())).collect();

        Self { locks, parents, children, global_order }
    }

    fn ancestors(&self, variant: Variant) -> Vec<Variant> {
        let mut seen = Vec::new();
        let mut stack = vec![variant];
        while let Some(v) = stack.pop() {
            for parent in &self.parents[&v] {
                if !seen.contains(parent) {
                    seen.push(*parent);
                    stack.push(*parent);
                }
            }
        }
        seen
    }

    fn descendants(&self, variant: Variant) -> Vec<Variant> {
        let mut seen = Vec::new();
        let mut stack = vec![variant];
        while let Some(v) = stack.pop() {
            for child in &self.children[&v] {
                if !seen.contains(child) {
                    seen.push(*child);
                    stack.push(*child);
                }
            }
        }
        seen
    }

    /// Acquires `variant` plus the set implied by `mode`, in the fixed
    /// global order. Reentrant: if the current thread already holds a
    /// lock in the required set, it is not reacquired (depth is bumped
    /// instead), so recursive derived-event buffering never deadlocks
    /// against itself.
    pub fn acquire(&self, mode: AcquireMode, variant: Variant) -> LockGuardSet<'_> {
        let mut required = match mode {
            AcquireMode::AddDependencies => self.ancestors(variant),
            AcquireMode::RemoveDependents => self.descendants(variant),
        };
        required.push(variant);

        let tid = std::thread::current().id();
        let mut ordered: Vec<Variant> = self
            .global_order
            .iter()
            .copied()
            .filter(|v| required.contains(v))
            .collect();
        // global_order is a total layering; stable filter preserves the
        // fixed relative order for the required subset.
        ordered.dedup();

        let mut held = Vec::with_capacity(ordered.len());
        for v in ordered {
            self.locks[&v].acquire(tid);
            held.push(v);
        }

        LockGuardSet { manager: self, held, tid }
    }

    /// Predicate used by dependency-free variants to detect a re-entrant
    /// enqueue: true if the calling thread already holds `variant`'s lock.
    pub fn is_held_by_current(&self, variant: Variant) -> bool {
        self.locks[&variant].is_held_by(std::thread::current().id())
    }

    pub fn acquire_single_if_needed(&self, variant: Variant) -> Option<SingleLockGuard<'_>> {
        let tid = std::thread::current().id();
        if self.locks[&variant].is_held_by(tid) {
            return None;
        }
        self.locks[&variant].acquire(tid);
        Some(SingleLockGuard { manager: self, variant, tid })
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A single-variant guard used for the recursive "ensure dependency"
/// path, returned only when the lock was not already held (see
/// `is_held_by_current`).
pub struct SingleLockGuard<'a> {
    manager: &'a LockManager,
    variant: Variant,
    tid: ThreadId,
}

impl<'a> Drop for SingleLockGuard<'a> {
    fn drop(&mut self) {
        self.manager.locks[&self.variant].release(self.tid);
    }
}

/// Assigns each variant a layer equal to one more than the maximum layer
/// of its parents (roots are layer 0), then flattens layers into a
/// single ascending order. This is the "single global order, topological
/// over the DAG" required by §4.2/§5.
fn topological_layering(parents: &HashMap<Variant, Vec<Variant>>) -> Vec<Variant> {
    let mut layer: HashMap<Variant, u32> = HashMap::new();

    fn compute(v: Variant, parents: &HashMap<Variant, Vec<Variant>>, layer: &mut HashMap<Variant, u32>) -> u32 {
        if let Some(l) = layer.get(&v) {
            return *l;
        }
        let l = parents[&v]
            .iter()
            .map(|p| compute(*p, parents, layer) + 1)
            .max()
            .unwrap_or(0);
        layer.insert(v, l);
        l
    }

    for v in Variant::ALL {
        compute(v, parents, &mut layer);
    }

    let mut ordered: Vec<Variant> = Variant::ALL.to_vec();
    ordered.sort_by_key(|v| layer[v]);
    ordered
}
