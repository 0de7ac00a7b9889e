use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex;

use crate::bus::BusMutex;

/// Plug-and-play lifecycle of a bus.
///
/// Transitions are driven by the surrounding PnP layer; the bus only
/// records them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusState {
    #[default]
    NotStarted,
    Started,
    StopPending,
    Stopped,
    RemovePending,
    SurpriseRemovePending,
    Deleted,
}

#[derive(Clone, Copy, Default)]
struct States {
    current: BusState,
    previous: BusState,
}

/// Current and previous state, updated together.
pub(crate) struct StateCell {
    states: Mutex<BusMutex, Cell<States>>,
}

impl StateCell {
    pub(crate) const fn new() -> Self {
        Self {
            states: Mutex::new(Cell::new(States {
                current: BusState::NotStarted,
                previous: BusState::NotStarted,
            })),
        }
    }

    pub(crate) fn current(&self) -> BusState {
        self.states.lock(|s| s.get().current)
    }

    pub(crate) fn previous(&self) -> BusState {
        self.states.lock(|s| s.get().previous)
    }

    /// Move to `next`, remembering the state being left. Returns it.
    pub(crate) fn set(&self, next: BusState) -> BusState {
        self.states.lock(|s| {
            let old = s.get().current;
            s.set(States { current: next, previous: old });
            old
        })
    }

    /// Go back to the previous state. Returns the state that was undone.
    pub(crate) fn restore(&self) -> BusState {
        self.states.lock(|s| {
            let States { current, previous } = s.get();
            s.set(States { current: previous, previous });
            current
        })
    }
}
