//! Code-cache eviction
//!
//! Keeps the number of units with loaded code near the configured ceiling.
//! Runs under the engine mutex whenever a unit is enqueued while the active
//! list is already at the ceiling.
//!
//! A pass has three steps:
//!
//! 1. Free every active unit whose method body was collected.
//! 2. Mark the units that appear on any live call stack or registered
//!    continuation. Those are never unloaded: their code may be executing.
//! 3. Unload the unmarked unit with the fewest calls, repeatedly, until the
//!    active list is down to `ceiling - ceiling / 10` or nothing unmarked is
//!    left.
//!
//! If everything left is on a stack the list stays above the ceiling until
//! a later pass.

use crate::continuation::ExecutionContext;
use crate::unit::{ListKind, UnitArena, UnitHandle};
use serde::Serialize;

/// Outcome of one eviction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    /// Units freed because their method body was collected
    pub collected: usize,
    /// Units unloaded to make room
    pub unloaded: usize,
    /// Units skipped because they are on a stack
    pub protected: usize,
    /// Active units left after the pass
    pub remaining: usize,
}

/// Active-list length a pass aims for
pub fn eviction_target(ceiling: usize) -> usize {
    ceiling - ceiling / 10
}

/// Number of units a pass wants to unload from `active_len` units
pub fn deletion_quota(active_len: usize, ceiling: usize) -> usize {
    active_len.saturating_sub(eviction_target(ceiling))
}

/// Free active units whose method bodies are gone
pub fn sweep_collected(units: &mut UnitArena) -> usize {
    let dead: Vec<UnitHandle> = units
        .iter(ListKind::Active)
        .filter(|h| units.get(*h).is_some_and(|u| u.method_collected()))
        .collect();
    for handle in &dead {
        units.unlink(*handle);
        if let Some(unit) = units.free(*handle) {
            tracing::trace!(unit_id = %unit.id(), "freeing unit of collected method");
        }
    }
    dead.len()
}

/// Recompute `used_code_p` for every active unit.
///
/// Clears the flag everywhere, then sets it for each active unit whose
/// method is executing in one of `contexts`. Returns how many are marked.
pub fn mark_used_units<'a, I>(units: &mut UnitArena, contexts: I) -> usize
where
    I: IntoIterator<Item = &'a dyn ExecutionContext>,
{
    for handle in units.handles(ListKind::Active) {
        if let Some(unit) = units.get_mut(handle) {
            unit.set_used_code_p(false);
        }
    }

    let mut on_stack = Vec::new();
    for context in contexts {
        context.for_each_frame(&mut |method_id| {
            if let Some(handle) = units.unit_for_method(method_id) {
                if units.list_of(handle) == Some(ListKind::Active) {
                    on_stack.push(handle);
                }
            }
        });
    }

    let mut marked = 0;
    for handle in on_stack {
        if let Some(unit) = units.get_mut(handle) {
            if !unit.used_code_p() {
                unit.set_used_code_p(true);
                marked += 1;
            }
        }
    }
    marked
}

/// Unmarked active unit with the lowest call count; first found wins ties
fn least_called_unmarked(units: &UnitArena) -> Option<(UnitHandle, u64)> {
    let mut worst: Option<(UnitHandle, u64)> = None;
    for handle in units.iter(ListKind::Active) {
        let Some(unit) = units.get(handle) else {
            continue;
        };
        if unit.used_code_p() {
            continue;
        }
        let calls = unit.total_calls().unwrap_or(0);
        if worst.map_or(true, |(_, worst_calls)| calls < worst_calls) {
            worst = Some((handle, calls));
        }
    }
    worst
}

/// Run one eviction pass over the active list
pub fn unload_units<'a, I>(units: &mut UnitArena, ceiling: usize, contexts: I) -> EvictionReport
where
    I: IntoIterator<Item = &'a dyn ExecutionContext>,
{
    let before = units.len(ListKind::Active);
    let collected = sweep_collected(units);
    let protected = mark_used_units(units, contexts);

    let target = eviction_target(ceiling);
    let mut unloaded = 0;
    while units.len(ListKind::Active) > target {
        let Some((handle, calls)) = least_called_unmarked(units) else {
            break;
        };
        units.unlink(handle);
        if let Some(unit) = units.free(handle) {
            assert!(unit.has_code(), "active unit {} without code", unit.id());
            tracing::debug!(unit_id = %unit.id(), calls, "unloading unit");
        }
        unloaded += 1;
    }

    let remaining = units.len(ListKind::Active);
    tracing::info!(
        unloaded = before - remaining,
        remaining,
        "too many JIT code, units unloaded"
    );
    EvictionReport {
        collected,
        unloaded,
        protected,
        remaining,
    }
}
