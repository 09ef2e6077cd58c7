//! The router's window → beam map.
//!
//! Each window that has seen an admitted record owns a [`WindowSlot`]. The
//! slot holds the beam in a [`OnceCell`], so the first caller to reach an
//! empty slot creates the beam and every concurrent caller waits for and
//! reuses that result. A failed creation leaves the cell empty and the next
//! caller tries again.
//!
//! Lookup-or-insert and the pending-send increment happen under one lock,
//! and eviction checks the pending count under the same lock. A slot that
//! has been handed out for a send can therefore never be evicted before the
//! send finishes, and an evicted slot is never reachable from the map again.
//!
//! Draining the map closes it: later lookups get no slot, and slots taken
//! out by eviction or draining are marked retired so a beam created on them
//! afterwards can be closed by whoever created it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OnceCell};

use crate::beam::Beam;
use crate::beam_factory::BeamFactory;
use crate::error::DiscoveryError;
use crate::window::Window;

/// One window's entry in the map.
pub(crate) struct WindowSlot {
  window: Window,
  generation: u64,
  beam: OnceCell<Arc<dyn Beam>>,
  pending: AtomicUsize,
  retired: AtomicBool,
  created_at: DateTime<Utc>,
  last_activity: StdMutex<DateTime<Utc>>,
}

impl WindowSlot {
  fn new(window: Window, generation: u64, now: DateTime<Utc>) -> Self {
    Self {
      window,
      generation,
      beam: OnceCell::new(),
      pending: AtomicUsize::new(0),
      retired: AtomicBool::new(false),
      created_at: now,
      last_activity: StdMutex::new(now),
    }
  }

  pub(crate) fn window(&self) -> Window {
    self.window
  }

  /// Returns the slot's beam, creating it on first use.
  ///
  /// The flag is true only for the caller whose factory call produced it.
  pub(crate) async fn beam(
    &self,
    factory: &dyn BeamFactory,
  ) -> Result<(Arc<dyn Beam>, bool), DiscoveryError> {
    let mut created = false;
    let beam = self
      .beam
      .get_or_try_init(|| async {
        let beam = factory.make_beam(&self.window).await?;
        created = true;
        Ok::<_, DiscoveryError>(beam)
      })
      .await?
      .clone();
    Ok((beam, created))
  }

  /// The beam, if one has been created.
  pub(crate) fn existing_beam(&self) -> Option<Arc<dyn Beam>> {
    self.beam.get().cloned()
  }

  pub(crate) fn pending(&self) -> usize {
    self.pending.load(Ordering::SeqCst)
  }

  /// Whether the slot has been taken out of the map.
  pub(crate) fn is_retired(&self) -> bool {
    self.retired.load(Ordering::SeqCst)
  }

  fn retire(&self) {
    self.retired.store(true, Ordering::SeqCst);
  }

  fn touch(&self, now: DateTime<Utc>) {
    let mut last = self
      .last_activity
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    if now > *last {
      *last = now;
    }
  }

  fn last_activity(&self) -> DateTime<Utc> {
    *self
      .last_activity
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// Keeps a slot's pending count raised while a send is in flight.
pub(crate) struct SlotGuard {
  slot: Arc<WindowSlot>,
}

impl SlotGuard {
  pub(crate) fn slot(&self) -> &WindowSlot {
    &self.slot
  }
}

impl Drop for SlotGuard {
  fn drop(&mut self) {
    self.slot.pending.fetch_sub(1, Ordering::SeqCst);
  }
}

/// Lifecycle state of a window present in the map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
  /// Still admitting records.
  Active,
  /// Closed for new records; waiting for outstanding sends or eviction.
  Draining,
}

/// Snapshot of one window in the map.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WindowInfo {
  /// The window.
  pub window: Window,
  /// Active or draining at the time of the snapshot.
  pub state: WindowState,
  /// Whether the beam has been created.
  pub has_beam: bool,
  /// Sends currently in flight.
  pub pending: usize,
  /// Incremented each time the window gets a fresh slot.
  pub generation: u64,
  /// When the slot was created.
  pub created_at: DateTime<Utc>,
  /// Last time a send was dispatched through the slot.
  pub last_activity: DateTime<Utc>,
}

#[derive(Default)]
struct Slots {
  by_window: BTreeMap<Window, Arc<WindowSlot>>,
  closed: bool,
}

#[derive(Default)]
pub(crate) struct WindowMap {
  slots: Mutex<Slots>,
  generations: AtomicU64,
}

impl WindowMap {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Looks up or inserts the slot for `window` and marks a send pending.
  ///
  /// Returns `None` once the map has been drained.
  pub(crate) async fn acquire(&self, window: Window, now: DateTime<Utc>) -> Option<SlotGuard> {
    let mut slots = self.slots.lock().await;
    if slots.closed {
      return None;
    }
    let slot = slots
      .by_window
      .entry(window)
      .or_insert_with(|| {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(WindowSlot::new(window, generation, now))
      })
      .clone();
    slot.pending.fetch_add(1, Ordering::SeqCst);
    slot.touch(now);
    Some(SlotGuard { slot })
  }

  /// Removes every slot for which `expired` holds and no send is pending.
  ///
  /// Closing the removed beams is left to the caller, outside the lock.
  pub(crate) async fn evict(&self, expired: impl Fn(&Window) -> bool) -> Vec<Arc<WindowSlot>> {
    let mut slots = self.slots.lock().await;
    let doomed: Vec<Window> = slots
      .by_window
      .iter()
      .filter(|(window, slot)| expired(window) && slot.pending() == 0)
      .map(|(window, _)| *window)
      .collect();
    doomed
      .into_iter()
      .filter_map(|window| slots.by_window.remove(&window))
      .inspect(|slot| slot.retire())
      .collect()
  }

  /// Removes every slot regardless of state and refuses new ones.
  pub(crate) async fn drain(&self) -> Vec<Arc<WindowSlot>> {
    let mut slots = self.slots.lock().await;
    slots.closed = true;
    let drained: Vec<Arc<WindowSlot>> = std::mem::take(&mut slots.by_window)
      .into_values()
      .collect();
    for slot in &drained {
      slot.retire();
    }
    drained
  }

  /// Whether `window` currently has a slot with a created beam.
  pub(crate) async fn has_beam(&self, window: &Window) -> bool {
    self
      .slots
      .lock()
      .await
      .by_window
      .get(window)
      .is_some_and(|slot| slot.existing_beam().is_some())
  }

  pub(crate) async fn len(&self) -> usize {
    self.slots.lock().await.by_window.len()
  }

  /// Snapshot of every slot, ordered by window.
  pub(crate) async fn snapshot(&self, closed: impl Fn(&Window) -> bool) -> Vec<WindowInfo> {
    let slots = self.slots.lock().await;
    slots
      .by_window
      .values()
      .map(|slot| WindowInfo {
        window: slot.window,
        state: if closed(&slot.window) {
          WindowState::Draining
        } else {
          WindowState::Active
        },
        has_beam: slot.existing_beam().is_some(),
        pending: slot.pending(),
        generation: slot.generation,
        created_at: slot.created_at,
        last_activity: slot.last_activity(),
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::granularity::Granularity;
  use chrono::TimeZone;

  fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
  }

  fn window(hour: u32) -> Window {
    Granularity::Hour.bucket(at(hour))
  }

  #[tokio::test]
  async fn test_acquire_reuses_slot() {
    let map = WindowMap::new();
    let a = map.acquire(window(10), at(10)).await.unwrap();
    let b = map.acquire(window(10), at(11)).await.unwrap();
    assert!(Arc::ptr_eq(&a.slot, &b.slot));
    assert_eq!(a.slot().pending(), 2);
    assert_eq!(a.slot().window(), window(10));
    assert_eq!(map.len().await, 1);
    drop(a);
    assert_eq!(b.slot().pending(), 1);
  }

  #[tokio::test]
  async fn test_evict_skips_pending_slots() {
    let map = WindowMap::new();
    let guard = map.acquire(window(10), at(10)).await.unwrap();
    drop(map.acquire(window(11), at(11)).await.unwrap());

    let evicted = map.evict(|_| true).await;
    assert_eq!(evicted.len(), 1);
    assert_eq!(evicted[0].window(), window(11));
    assert_eq!(map.len().await, 1);

    drop(guard);
    assert_eq!(map.evict(|_| true).await.len(), 1);
    assert_eq!(map.len().await, 0);
  }

  #[tokio::test]
  async fn test_reinserted_window_gets_new_generation() {
    let map = WindowMap::new();
    let first = map.acquire(window(10), at(10)).await.unwrap().slot.generation;
    map.evict(|_| true).await;
    let second = map.acquire(window(10), at(10)).await.unwrap().slot.generation;
    assert!(second > first);
  }

  #[tokio::test]
  async fn test_snapshot_states() {
    let map = WindowMap::new();
    drop(map.acquire(window(10), at(10)).await.unwrap());
    let _pending = map.acquire(window(11), at(11)).await.unwrap();

    let snapshot = map.snapshot(|w| *w == window(10)).await;
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].state, WindowState::Draining);
    assert_eq!(snapshot[1].state, WindowState::Active);
    assert_eq!(snapshot[1].pending, 1);
    assert!(!snapshot[0].has_beam);
    assert!(!map.has_beam(&window(10)).await);

    assert_eq!(map.drain().await.len(), 2);
    assert_eq!(map.len().await, 0);
  }

  #[tokio::test]
  async fn test_drained_map_refuses_new_slots() {
    let map = WindowMap::new();
    let guard = map.acquire(window(10), at(10)).await.unwrap();

    let drained = map.drain().await;
    assert_eq!(drained.len(), 1);
    assert!(guard.slot().is_retired());
    assert!(map.acquire(window(11), at(11)).await.is_none());
    assert_eq!(map.len().await, 0);
  }

  #[tokio::test]
  async fn test_evicted_slot_is_retired() {
    let map = WindowMap::new();
    let guard = map.acquire(window(10), at(10)).await.unwrap();
    let slot = guard.slot.clone();
    drop(guard);
    assert!(!slot.is_retired());
    map.evict(|_| true).await;
    assert!(slot.is_retired());
  }
}
