//! Callback registries and the handles they hand out.
//!
//! A [`HookRegistry`] owns callbacks keyed by a monotonically increasing id.
//! Registering returns a [`HookHandle`] that keeps only a weak link back to
//! the registry, so handles never keep a module or parameter alive. Removing
//! a handle consumes it, which makes double release impossible.

use crate::error::HookError;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Extension point a hook is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Module backward hook: `(module, grad_input, grad_output)`.
    Backward,
    /// Parameter gradient hook: `(gradient)`.
    Gradient,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::Backward => write!(f, "backward"),
            HookKind::Gradient => write!(f, "gradient"),
        }
    }
}

trait HookSlots {
    fn remove(&mut self, id: u64) -> bool;
}

struct Slots<F> {
    next_id: u64,
    hooks: BTreeMap<u64, Rc<RefCell<F>>>,
}

impl<F> HookSlots for Slots<F> {
    fn remove(&mut self, id: u64) -> bool {
        self.hooks.remove(&id).is_some()
    }
}

/// Ordered set of callbacks for one extension point.
///
/// Clones share the same slot table. Callbacks run in registration order over
/// the hooks present when dispatch started, so a callback may inspect the
/// registry, and hooks it registers or removes take effect on the next
/// dispatch. A callback must not dispatch its own registry again.
pub struct HookRegistry<F> {
    kind: HookKind,
    slots: Rc<RefCell<Slots<F>>>,
}

impl<F: 'static> HookRegistry<F> {
    pub fn new(kind: HookKind) -> Self {
        Self {
            kind,
            slots: Rc::new(RefCell::new(Slots {
                next_id: 0,
                hooks: BTreeMap::new(),
            })),
        }
    }

    /// Store a callback and return the handle that releases it.
    pub fn register(&self, hook: F) -> HookHandle {
        let id = {
            let mut slots = self.slots.borrow_mut();
            let id = slots.next_id;
            slots.next_id += 1;
            slots.hooks.insert(id, Rc::new(RefCell::new(hook)));
            id
        };

        let shared: Rc<RefCell<dyn HookSlots>> = self.slots.clone();
        HookHandle {
            id,
            kind: self.kind,
            slots: Rc::downgrade(&shared),
        }
    }

    /// Invoke `call` on every registered callback, oldest first.
    pub fn dispatch(&self, mut call: impl FnMut(&mut F)) {
        let hooks: Vec<Rc<RefCell<F>>> = self.slots.borrow().hooks.values().cloned().collect();
        for hook in hooks {
            call(&mut *hook.borrow_mut());
        }
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<F> Clone for HookRegistry<F> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            slots: Rc::clone(&self.slots),
        }
    }
}

impl<F> fmt::Debug for HookRegistry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("kind", &self.kind)
            .field("registered", &self.slots.borrow().hooks.len())
            .finish()
    }
}

/// Token for one registered hook.
///
/// Dropping a handle without calling [`HookHandle::remove`] leaves the hook
/// registered.
#[must_use = "a hook stays registered until its handle is removed"]
pub struct HookHandle {
    id: u64,
    kind: HookKind,
    slots: Weak<RefCell<dyn HookSlots>>,
}

impl HookHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> HookKind {
        self.kind
    }

    /// Unregister the hook. Outside of a dispatch the callback is dropped
    /// before this returns.
    pub fn remove(self) -> Result<(), HookError> {
        let slots = self.slots.upgrade().ok_or(HookError::Detached)?;
        let removed = slots.borrow_mut().remove(self.id);
        if removed {
            Ok(())
        } else {
            Err(HookError::UnknownHook(self.id))
        }
    }
}

impl fmt::Debug for HookHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    type Counter = Box<dyn FnMut()>;

    #[test]
    fn test_register_and_dispatch_in_order() {
        let registry: HookRegistry<Box<dyn FnMut(&mut Vec<u32>)>> =
            HookRegistry::new(HookKind::Backward);
        let _first = registry.register(Box::new(|seen: &mut Vec<u32>| seen.push(1)));
        let _second = registry.register(Box::new(|seen: &mut Vec<u32>| seen.push(2)));

        let mut seen = Vec::new();
        registry.dispatch(|hook| hook(&mut seen));
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_releases_only_that_hook() {
        let hits = Rc::new(Cell::new(0));
        let registry: HookRegistry<Counter> = HookRegistry::new(HookKind::Gradient);

        let h1 = hits.clone();
        let first = registry.register(Box::new(move || h1.set(h1.get() + 1)));
        let h2 = hits.clone();
        let _second = registry.register(Box::new(move || h2.set(h2.get() + 10)));

        assert_eq!(first.kind(), HookKind::Gradient);
        first.remove().unwrap();
        registry.dispatch(|hook| hook());
        assert_eq!(hits.get(), 10);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_after_owner_dropped() {
        let registry: HookRegistry<Counter> = HookRegistry::new(HookKind::Gradient);
        let handle = registry.register(Box::new(|| {}));
        drop(registry);
        assert_eq!(handle.remove(), Err(HookError::Detached));
    }

    #[test]
    fn test_ids_are_not_reused() {
        let registry: HookRegistry<Counter> = HookRegistry::new(HookKind::Backward);
        let a = registry.register(Box::new(|| {}));
        let a_id = a.id();
        a.remove().unwrap();
        let b = registry.register(Box::new(|| {}));
        assert_ne!(a_id, b.id());
    }

    #[test]
    fn test_removed_callback_is_dropped() {
        let token = Rc::new(());
        let registry: HookRegistry<Counter> = HookRegistry::new(HookKind::Gradient);
        let captured = token.clone();
        let handle = registry.register(Box::new(move || {
            let _ = &captured;
        }));
        assert_eq!(Rc::strong_count(&token), 2);
        handle.remove().unwrap();
        assert_eq!(Rc::strong_count(&token), 1);
    }

    #[test]
    fn test_removal_during_dispatch_applies_next_time() {
        let hits = Rc::new(Cell::new(0));
        let registry: HookRegistry<Counter> = HookRegistry::new(HookKind::Gradient);
        let pending: Rc<RefCell<Option<HookHandle>>> = Rc::new(RefCell::new(None));

        let slot = pending.clone();
        let _remover = registry.register(Box::new(move || {
            if let Some(handle) = slot.borrow_mut().take() {
                handle.remove().unwrap();
            }
        }));
        let counter = hits.clone();
        *pending.borrow_mut() =
            Some(registry.register(Box::new(move || counter.set(counter.get() + 1))));

        registry.dispatch(|hook| hook());
        assert_eq!(hits.get(), 1);
        assert_eq!(registry.len(), 1);

        registry.dispatch(|hook| hook());
        assert_eq!(hits.get(), 1);
    }
}
