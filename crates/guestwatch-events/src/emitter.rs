use std::{
    borrow::Cow,
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt::Display,
    rc::Rc,
};

/// Identifies one registered listener for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Entry<L: ?Sized> {
    id: ListenerId,
    once: bool,
    label: Cow<'static, str>,
    listener: Rc<L>,
}

/// A multi-listener dispatcher keyed by a small per-emitter enum.
///
/// `L` is the unsized listener type (a `dyn Fn(...) -> Result<...>`);
/// emission goes through [`emit_with`] so each emitter decides how its
/// listeners are invoked. Listeners are held behind `Rc` and the sequence
/// is snapshotted before dispatch, so listeners added or removed during
/// emission do not affect the dispatch in progress. A failing listener is
/// logged and suppressed; its peers still fire.
///
/// [`emit_with`]: Emitter::emit_with
pub struct Emitter<K, L: ?Sized> {
    entries: RefCell<BTreeMap<K, Vec<Entry<L>>>>,
    next_id: Cell<u64>,
}

impl<K, L> Emitter<K, L>
where
    K: Ord + Copy + std::fmt::Debug,
    L: ?Sized,
{
    /// Creates an emitter with no listeners.
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(0),
        }
    }

    /// Registers a permanent listener for `key`.
    ///
    /// The label identifies the listener in logs when it fails.
    pub fn on(
        &self,
        key: K,
        label: impl Into<Cow<'static, str>>,
        listener: Rc<L>,
    ) -> ListenerId {
        self.add(key, false, label.into(), listener)
    }

    /// Registers a listener for `key` that is removed after it first fires.
    pub fn once(
        &self,
        key: K,
        label: impl Into<Cow<'static, str>>,
        listener: Rc<L>,
    ) -> ListenerId {
        self.add(key, true, label.into(), listener)
    }

    fn add(&self, key: K, once: bool, label: Cow<'static, str>, listener: Rc<L>) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.entries.borrow_mut().entry(key).or_default().push(Entry {
            id,
            once,
            label,
            listener,
        });
        id
    }

    /// Removes the listener identified by `id` for `key`, or every
    /// listener for `key` when `id` is `None`.
    ///
    /// Returns whether anything was removed.
    pub fn off(&self, key: K, id: Option<ListenerId>) -> bool {
        let mut entries = self.entries.borrow_mut();
        match id {
            None => entries.remove(&key).is_some(),
            Some(id) => {
                let Some(list) = entries.get_mut(&key) else {
                    return false;
                };
                let removed = match list.iter().position(|entry| entry.id == id) {
                    Some(index) => {
                        list.remove(index);
                        true
                    }
                    None => false,
                };
                if list.is_empty() {
                    entries.remove(&key);
                }
                removed
            }
        }
    }

    /// Whether any listener is registered for `key`.
    pub fn has_listeners(&self, key: K) -> bool {
        self.entries.borrow().contains_key(&key)
    }

    /// The number of listeners registered for `key`.
    pub fn listener_count(&self, key: K) -> usize {
        self.entries
            .borrow()
            .get(&key)
            .map_or(0, |list| list.len())
    }

    /// The keys with at least one listener.
    pub fn keys(&self) -> Vec<K> {
        self.entries.borrow().keys().copied().collect()
    }

    /// Dispatches to every listener registered for `key`, invoking each
    /// through `invoke`. Returns the number of listeners called.
    pub fn emit_with<E>(&self, key: K, mut invoke: impl FnMut(&L) -> Result<(), E>) -> usize
    where
        E: Display,
    {
        let snapshot: Vec<(ListenerId, bool, Cow<'static, str>, Rc<L>)> =
            match self.entries.borrow().get(&key) {
                Some(list) => list
                    .iter()
                    .map(|e| (e.id, e.once, e.label.clone(), Rc::clone(&e.listener)))
                    .collect(),
                None => return 0,
            };

        for (id, once, label, listener) in &snapshot {
            if let Err(err) = invoke(listener) {
                tracing::warn!(?key, listener = %label, error = %err, "ignoring listener error");
            }
            if *once {
                tracing::trace!(?key, listener = %label, "removing one-shot listener");
                self.off(key, Some(*id));
            }
        }
        snapshot.len()
    }
}

impl<K, L> Default for Emitter<K, L>
where
    K: Ord + Copy + std::fmt::Debug,
    L: ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, convert::Infallible};

    use super::*;

    type TestListener = dyn Fn(u32) -> Result<(), String>;

    fn fire(emitter: &Emitter<u8, TestListener>, key: u8, arg: u32) -> usize {
        emitter.emit_with(key, |l| l(arg))
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let emitter: Emitter<u8, TestListener> = Emitter::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = Rc::clone(&seen);
            emitter.on(
                0,
                tag,
                Rc::new(move |arg| {
                    seen.borrow_mut().push((tag, arg));
                    Ok(())
                }),
            );
        }

        assert_eq!(fire(&emitter, 0, 7), 3);
        assert_eq!(&*seen.borrow(), &[("a", 7), ("b", 7), ("c", 7)]);
    }

    #[test]
    fn once_listener_is_removed_after_firing() {
        let emitter: Emitter<u8, TestListener> = Emitter::new();
        let hits = Rc::new(Cell::new(0u32));

        let hits2 = Rc::clone(&hits);
        emitter.once(
            0,
            "one-shot",
            Rc::new(move |_| {
                hits2.set(hits2.get() + 1);
                Ok(())
            }),
        );

        assert_eq!(fire(&emitter, 0, 1), 1);
        assert_eq!(fire(&emitter, 0, 1), 0);
        assert_eq!(hits.get(), 1);
        assert!(!emitter.has_listeners(0));
    }

    #[test]
    fn failing_listener_does_not_break_its_peers() {
        let emitter: Emitter<u8, TestListener> = Emitter::new();
        let hits = Rc::new(Cell::new(0u32));

        emitter.on(0, "broken", Rc::new(|_| Err("boom".to_string())));
        let hits2 = Rc::clone(&hits);
        emitter.on(
            0,
            "working",
            Rc::new(move |_| {
                hits2.set(hits2.get() + 1);
                Ok(())
            }),
        );

        assert_eq!(fire(&emitter, 0, 1), 2);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn off_removes_one_or_all() {
        let emitter: Emitter<u8, TestListener> = Emitter::new();
        let a = emitter.on(0, "a", Rc::new(|_| Ok(())));
        emitter.on(0, "b", Rc::new(|_| Ok(())));

        assert!(emitter.off(0, Some(a)));
        assert_eq!(emitter.listener_count(0), 1);
        assert!(!emitter.off(0, Some(a)));

        assert!(emitter.off(0, None));
        assert!(!emitter.has_listeners(0));
        assert!(emitter.keys().is_empty());
    }

    #[test]
    fn mutation_during_emission_does_not_affect_current_dispatch() {
        let emitter: Rc<Emitter<u8, TestListener>> = Rc::new(Emitter::new());
        let hits = Rc::new(Cell::new(0u32));

        let em = Rc::clone(&emitter);
        let hits2 = Rc::clone(&hits);
        emitter.on(
            0,
            "adder",
            Rc::new(move |_| {
                let hits3 = Rc::clone(&hits2);
                em.on(
                    0,
                    "added-during-emit",
                    Rc::new(move |_| {
                        hits3.set(hits3.get() + 100);
                        Ok(())
                    }),
                );
                Ok(())
            }),
        );

        // The listener added during the dispatch must not fire this round.
        assert_eq!(fire(&emitter, 0, 1), 1);
        assert_eq!(hits.get(), 0);

        assert_eq!(fire(&emitter, 0, 1), 2);
        assert_eq!(hits.get(), 100);
    }

    #[test]
    fn infallible_invocations_work() {
        let emitter: Emitter<u8, dyn Fn(u32)> = Emitter::new();
        let hits = Rc::new(Cell::new(0u32));
        let hits2 = Rc::clone(&hits);
        emitter.on(
            3,
            "counter",
            Rc::new(move |n| hits2.set(hits2.get() + n)),
        );
        emitter.emit_with(3, |l| {
            l(5);
            Ok::<(), Infallible>(())
        });
        assert_eq!(hits.get(), 5);
    }
}
