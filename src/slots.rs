//! Fixed pools of engine object slots.
//!
//! An embedded target can only afford a handful of TLS sessions and
//! configurations. Each pool is an array of in-use flags; a [`Slot`] is the
//! token proving ownership of one entry. Acquiring never blocks: when every
//! flag is set the caller gets [`Error::Busy`] and decides whether to retry or
//! reject the connection.

use portable_atomic::{AtomicBool, Ordering};

use crate::{Error, Result};

/// What a pool hands out slots for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotKind {
    Session,
    Config,
    General,
}

/// Ownership token for one entry of a [`SlotPool`].
#[derive(Debug, PartialEq, Eq)]
pub struct Slot {
    index: usize,
    kind: SlotKind,
}

impl Slot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> SlotKind {
        self.kind
    }
}

/// A pool of `N` reusable slots.
pub struct SlotPool<const N: usize> {
    kind: SlotKind,
    in_use: [AtomicBool; N],
}

impl<const N: usize> SlotPool<N> {
    pub const fn new() -> Self {
        Self::with_kind(SlotKind::General)
    }

    /// A pool whose slots are tagged with `kind`. Slots of another kind are
    /// never accepted back.
    pub const fn with_kind(kind: SlotKind) -> Self {
        Self {
            kind,
            in_use: [const { AtomicBool::new(false) }; N],
        }
    }

    pub const fn kind(&self) -> SlotKind {
        self.kind
    }

    /// Take the first free slot. First caller wins; there is no queueing.
    pub fn acquire(&self) -> Result<Slot> {
        for (index, flag) in self.in_use.iter().enumerate() {
            if flag
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                trace!("Acquired slot {}", index);
                return Ok(Slot {
                    index,
                    kind: self.kind,
                });
            }
        }
        Err(Error::Busy)
    }

    /// Return a slot to the pool. Releasing a slot that is already free, or
    /// one of another kind, has no effect.
    pub fn release(&self, slot: Slot) {
        if slot.kind != self.kind {
            warn!(
                "Ignoring release of a {:?} slot into a {:?} pool",
                slot.kind,
                self.kind
            );
            return;
        }
        if let Some(flag) = self.in_use.get(slot.index) {
            if flag.swap(false, Ordering::Release) {
                trace!("Released slot {}", slot.index);
            }
        }
    }

    pub fn is_in_use(&self, index: usize) -> bool {
        self.in_use
            .get(index)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Number of slots currently held.
    pub fn in_use(&self) -> usize {
        self.in_use
            .iter()
            .filter(|flag| flag.load(Ordering::Acquire))
            .count()
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for SlotPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> core::fmt::Debug for SlotPool<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlotPool")
            .field("kind", &self.kind)
            .field("capacity", &N)
            .field("in_use", &self.in_use())
            .finish()
    }
}

/// Slot bookkeeping used by contexts and sessions.
///
/// Implemented by [`ResourceSlots`]; contexts keep a `&dyn SlotAllocator` so
/// the pool sizes do not leak into their type.
pub trait SlotAllocator: Sync {
    fn acquire_session_slot(&self) -> Result<Slot>;
    fn release_session_slot(&self, slot: Slot);
    fn acquire_config_slot(&self) -> Result<Slot>;
    fn release_config_slot(&self, slot: Slot);
}

/// Session and configuration pools for one application.
///
/// The defaults give one slot of each kind: at most one live [`Session`] and
/// one live [`Context`] per pool.
///
/// [`Session`]: crate::Session
/// [`Context`]: crate::Context
#[derive(Debug, Default)]
pub struct ResourceSlots<const SESSIONS: usize = 1, const CONFIGS: usize = 1> {
    sessions: SlotPool<SESSIONS>,
    configs: SlotPool<CONFIGS>,
}

impl<const SESSIONS: usize, const CONFIGS: usize> ResourceSlots<SESSIONS, CONFIGS> {
    pub const fn new() -> Self {
        Self {
            sessions: SlotPool::with_kind(SlotKind::Session),
            configs: SlotPool::with_kind(SlotKind::Config),
        }
    }

    pub fn sessions(&self) -> &SlotPool<SESSIONS> {
        &self.sessions
    }

    pub fn configs(&self) -> &SlotPool<CONFIGS> {
        &self.configs
    }
}

impl<const SESSIONS: usize, const CONFIGS: usize> SlotAllocator
    for ResourceSlots<SESSIONS, CONFIGS>
{
    fn acquire_session_slot(&self) -> Result<Slot> {
        self.sessions.acquire().inspect_err(|_| {
            warn!("No free session slot ({} in use)", SESSIONS);
        })
    }

    fn release_session_slot(&self, slot: Slot) {
        self.sessions.release(slot);
    }

    fn acquire_config_slot(&self) -> Result<Slot> {
        self.configs.acquire().inspect_err(|_| {
            warn!("No free configuration slot ({} in use)", CONFIGS);
        })
    }

    fn release_config_slot(&self, slot: Slot) {
        self.configs.release(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_slot_is_exclusive() {
        let pool = SlotPool::<1>::new();
        let slot = pool.acquire().unwrap();
        assert!(matches!(pool.acquire(), Err(Error::Busy)));
        assert_eq!(pool.in_use(), 1);

        pool.release(slot);
        assert_eq!(pool.in_use(), 0);
        let slot = pool.acquire().unwrap();
        assert_eq!(slot.index(), 0);
    }

    #[test]
    fn release_of_free_slot_is_a_noop() {
        let pool = SlotPool::<1>::new();
        pool.release(Slot {
            index: 0,
            kind: SlotKind::General,
        });
        pool.release(Slot {
            index: 0,
            kind: SlotKind::General,
        });
        assert!(!pool.is_in_use(0));

        let slot = pool.acquire().unwrap();
        pool.release(slot);
        pool.release(Slot {
            index: 0,
            kind: SlotKind::General,
        });
        assert!(pool.acquire().is_ok());
        assert!(pool.acquire().is_err());
    }

    #[test]
    fn out_of_range_release_is_ignored() {
        let pool = SlotPool::<2>::new();
        let held = pool.acquire().unwrap();
        pool.release(Slot {
            index: 7,
            kind: SlotKind::General,
        });
        assert!(pool.is_in_use(held.index()));
        assert!(!pool.is_in_use(7));
    }

    #[test]
    fn outstanding_acquires_never_exceed_capacity() {
        let pool = SlotPool::<3>::new();
        let mut held = Vec::new();
        for round in 0..20 {
            if round % 3 == 2 {
                if let Some(slot) = held.pop() {
                    pool.release(slot);
                }
            }
            if let Ok(slot) = pool.acquire() {
                held.push(slot);
            }
            assert!(held.len() <= pool.capacity());
            assert_eq!(held.len(), pool.in_use());
        }
    }

    #[test]
    fn concurrent_acquire_has_one_winner() {
        let pool = SlotPool::<1>::new();
        let winners = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| pool.acquire().ok().map(|slot| slot.index())))
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .count()
        });
        assert_eq!(winners, 1);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn resource_slots_keep_kinds_apart() {
        let slots: ResourceSlots = ResourceSlots::new();
        let session = slots.acquire_session_slot().unwrap();
        let config = slots.acquire_config_slot().unwrap();
        assert!(slots.acquire_session_slot().unwrap_err().is_resource_exhaustion());
        assert!(slots.acquire_config_slot().unwrap_err().is_resource_exhaustion());

        slots.release_session_slot(session);
        assert!(slots.configs().is_in_use(0));
        assert!(!slots.sessions().is_in_use(0));
        slots.release_config_slot(config);
        assert_eq!(slots.configs().in_use(), 0);
    }

    #[test]
    fn slot_of_another_kind_is_not_accepted() {
        let slots: ResourceSlots = ResourceSlots::new();
        let session = slots.acquire_session_slot().unwrap();
        let config = slots.acquire_config_slot().unwrap();
        assert_eq!(session.kind(), SlotKind::Session);
        assert_eq!(config.kind(), SlotKind::Config);

        slots.release_config_slot(session);
        assert!(slots.configs().is_in_use(0));
        assert!(slots.acquire_config_slot().unwrap_err().is_resource_exhaustion());
        assert!(slots.sessions().is_in_use(0));

        slots.release_session_slot(config);
        assert!(slots.configs().is_in_use(0));
        assert!(slots.sessions().is_in_use(0));
    }
}
