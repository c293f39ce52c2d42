//! Fixed-size slot table backing the workspace pool.
//!
//! Pure bookkeeping only: which slot is Busy with which task. Provisioning
//! the workspace on disk is the job of `io::workspace`.

use std::path::Path;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{Slot, SlotId, SlotInfo, SlotStatus, TaskId, task_branch};
use crate::error::{NoSlotAvailable, UnknownSlot};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    /// Create `size` Idle slots rooted at `workspaces_dir/slot-<n>`.
    pub fn init(size: u32, workspaces_dir: &Path) -> Self {
        let slots = (0..size)
            .map(|n| Slot {
                id: SlotId(n),
                status: SlotStatus::Idle,
                path: workspaces_dir.join(format!("slot-{n}")),
                branch: None,
                assigned_task: None,
                last_task: None,
            })
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn get(&self, id: SlotId) -> Option<&Slot> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    pub fn busy_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.status == SlotStatus::Busy)
            .count()
    }

    pub fn idle_count(&self) -> usize {
        self.slots.len() - self.busy_count()
    }

    /// Slot currently Busy with `task`, if any.
    pub fn slot_for_task(&self, task: TaskId) -> Option<&Slot> {
        self.slots
            .iter()
            .find(|slot| slot.status == SlotStatus::Busy && slot.assigned_task == Some(task))
    }

    /// Claim an Idle slot for `task` without blocking.
    ///
    /// Prefers the slot that last hosted `task` (so a retry lands on the
    /// same workspace), then the lowest Idle slot id.
    pub fn acquire(&mut self, task: TaskId) -> Result<SlotId> {
        if let Some(slot) = self.slot_for_task(task) {
            return Err(anyhow!("task {task} already holds slot {}", slot.id));
        }
        let preferred = self
            .slots
            .iter()
            .position(|slot| slot.status == SlotStatus::Idle && slot.last_task == Some(task));
        let index = match preferred {
            Some(index) => index,
            None => self
                .slots
                .iter()
                .position(|slot| slot.status == SlotStatus::Idle)
                .ok_or(NoSlotAvailable { task_id: task })?,
        };
        let slot = &mut self.slots[index];
        slot.status = SlotStatus::Busy;
        slot.assigned_task = Some(task);
        slot.branch = Some(task_branch(task));
        slot.last_task = Some(task);
        Ok(slot.id)
    }

    /// Return a slot to Idle, yielding the task it held.
    pub fn release(&mut self, id: SlotId) -> Result<Option<TaskId>> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.id == id)
            .ok_or(UnknownSlot(id))?;
        let task = slot.assigned_task.take();
        slot.status = SlotStatus::Idle;
        Ok(task)
    }

    pub fn status(&self) -> Vec<SlotInfo> {
        self.slots.iter().map(SlotInfo::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn table(size: u32) -> SlotTable {
        SlotTable::init(size, &PathBuf::from("/ws"))
    }

    #[test]
    fn init_creates_idle_slots_with_stable_paths() {
        let table = table(3);
        assert_eq!(table.len(), 3);
        assert_eq!(table.idle_count(), 3);
        assert_eq!(
            table.get(SlotId(2)).expect("slot").path,
            PathBuf::from("/ws/slot-2")
        );
    }

    #[test]
    fn acquire_is_non_blocking_and_reports_exhaustion() {
        let mut table = table(1);
        let slot = table.acquire(TaskId(1)).expect("acquire");
        assert_eq!(slot, SlotId(0));
        let err = table.acquire(TaskId(2)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<NoSlotAvailable>(),
            Some(&NoSlotAvailable { task_id: TaskId(2) })
        );
    }

    #[test]
    fn a_task_cannot_hold_two_slots() {
        let mut table = table(2);
        table.acquire(TaskId(1)).expect("acquire");
        assert!(table.acquire(TaskId(1)).is_err());
        assert_eq!(table.busy_count(), 1);
    }

    #[test]
    fn retries_prefer_the_slot_that_hosted_the_task() {
        let mut table = table(3);
        let first = table.acquire(TaskId(1)).expect("t1");
        let second = table.acquire(TaskId(2)).expect("t2");
        table.acquire(TaskId(3)).expect("t3");
        table.release(second).expect("release t2");
        table.release(first).expect("release t1");
        assert!(first < second, "slot {first} is the lowest idle slot");
        let retry = table.acquire(TaskId(2)).expect("t2 again");
        assert_eq!(retry, second);
        let slot = table.get(retry).expect("slot");
        assert_eq!(slot.branch.as_deref(), Some("foreman/task-2"));
    }

    #[test]
    fn release_returns_task_and_rejects_unknown_slots() {
        let mut table = table(1);
        let slot = table.acquire(TaskId(9)).expect("acquire");
        assert_eq!(table.release(slot).expect("release"), Some(TaskId(9)));
        assert_eq!(table.idle_count(), 1);
        assert!(table.release(SlotId(5)).is_err());
    }
}
