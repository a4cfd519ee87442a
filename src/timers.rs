use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

/// Timer ids are never reused within a queue's lifetime.
pub type TimerId = u32;

/// WHATWG clamps a `setTimeout`/`setInterval` delay to a signed 32-bit range;
/// anything outside it round-trips to the boundary rather than erroring.
const MAX_DELAY_MS: i64 = i32::MAX as i64;

/// Clamps a requested delay (milliseconds, possibly negative or absurdly
/// large) into the range timers actually schedule at. Negative or zero
/// delays fire on the next tick; delays above the 32-bit signed range clamp
/// to 1ms rather than to the max, matching the browser quirk where an
/// out-of-range delay is treated as "fire ASAP" instead of "fire very late".
fn clamp_delay_ms(delay_ms: i64) -> u64 {
    if delay_ms <= 0 {
        0
    } else if delay_ms > MAX_DELAY_MS {
        1
    } else {
        delay_ms as u64
    }
}

struct TimerEntry<T> {
    due: Instant,
    interval: Option<Duration>,
    referenced: bool,
    data: T,
}

/// An ordered-by-due-time collection of timers, generic over the payload
/// carried with each one (in production, a `v8::Global<Function>`; in tests,
/// anything `Clone`). Kept separate from `v8`/`JsRuntime` so the scheduling
/// logic — due-time ordering, per-instant FIFO, ref/unref, repeat rearming —
/// is testable without an isolate.
///
/// `due_order` generalizes a plain `BTreeMap<Instant, TimerId>`: two timers
/// legitimately share a due `Instant` (same delay, same tick), and a
/// single-slot map would silently drop one of them. Each due instant maps to
/// a FIFO queue of the ids due at that moment instead.
#[derive(Default)]
pub struct TimerQueue<T> {
    next_id: TimerId,
    entries: HashMap<TimerId, TimerEntry<T>>,
    due_order: BTreeMap<Instant, VecDeque<TimerId>>,
}

impl<T: Clone> TimerQueue<T> {
    pub fn new() -> Self {
        TimerQueue {
            next_id: 1,
            entries: HashMap::new(),
            due_order: BTreeMap::new(),
        }
    }

    /// Schedules `data` to fire `delay_ms` from `now`, optionally repeating
    /// every `delay_ms` thereafter. Returns the new timer's id.
    pub fn set(&mut self, now: Instant, delay_ms: i64, repeat: bool, data: T) -> TimerId {
        let delay = clamp_delay_ms(delay_ms);
        let due = now + Duration::from_millis(delay);
        let id = self.next_id;
        self.next_id += 1;

        self.entries.insert(
            id,
            TimerEntry {
                due,
                interval: repeat.then(|| Duration::from_millis(delay)),
                referenced: true,
                data,
            },
        );
        self.due_order.entry(due).or_default().push_back(id);
        id
    }

    /// Cancels a timer. A no-op (not an error) if the id is unknown or has
    /// already fired and was not repeating — mirroring `clearTimeout`.
    pub fn clear(&mut self, id: TimerId) {
        if let Some(entry) = self.entries.remove(&id) {
            self.remove_from_due_order(entry.due, id);
        }
    }

    fn remove_from_due_order(&mut self, due: Instant, id: TimerId) {
        if let Some(queue) = self.due_order.get_mut(&due) {
            queue.retain(|queued| *queued != id);
            if queue.is_empty() {
                self.due_order.remove(&due);
            }
        }
    }

    pub fn set_ref(&mut self, id: TimerId, referenced: bool) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.referenced = referenced;
        }
    }

    pub fn has(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Whether any live timer would keep the event loop alive on its own.
    pub fn has_ref_timers(&self) -> bool {
        self.entries.values().any(|entry| entry.referenced)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The earliest instant at which a timer is due, if any are scheduled.
    pub fn next_due(&self) -> Option<Instant> {
        self.due_order.keys().next().copied()
    }

    /// Removes and returns every timer due at or before `now`, oldest-due
    /// first and, within the same due instant, in registration order.
    /// Repeating timers are rearmed at the smallest `prev_due + k*interval`
    /// strictly after `now` (for a zero-delay repeat, that's `now` itself,
    /// the intended busy-reschedule): a tick that runs long doesn't queue
    /// up a backlog of catch-up fires, it just coalesces them into the
    /// next one, and a timer can never be handed back already due again
    /// within the same `pop_due` call.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TimerId, T)> {
        let mut fired = Vec::new();

        let due_instants: Vec<Instant> = self
            .due_order
            .range(..=now)
            .map(|(due, _)| *due)
            .collect();

        for due in due_instants {
            let ids = self.due_order.remove(&due).unwrap_or_default();
            for id in ids {
                let Some(mut entry) = self.entries.remove(&id) else {
                    continue;
                };
                fired.push((id, entry.data.clone()));

                if let Some(interval) = entry.interval {
                    // A zero-delay repeat is meant to come due again right
                    // away; anything longer must land strictly after `now`,
                    // or a timer that fell behind would fire twice for the
                    // same `pop_due(now)` call instead of coalescing.
                    let next_due = if interval.is_zero() {
                        now
                    } else {
                        let mut next_due = entry.due + interval;
                        while next_due <= now {
                            next_due += interval;
                        }
                        next_due
                    };
                    entry.due = next_due;
                    self.due_order.entry(next_due).or_default().push_back(id);
                    self.entries.insert(id, entry);
                }
            }
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_within_the_same_due_instant() {
        let mut queue: TimerQueue<&'static str> = TimerQueue::new();
        let now = Instant::now();
        queue.set(now, 10, false, "first");
        queue.set(now, 10, false, "second");

        let due = now + Duration::from_millis(10);
        let fired = queue.pop_due(due);
        assert_eq!(fired.iter().map(|(_, d)| *d).collect::<Vec<_>>(), vec!["first", "second"]);
    }

    #[test]
    fn negative_and_huge_delays_clamp() {
        assert_eq!(clamp_delay_ms(-5), 0);
        assert_eq!(clamp_delay_ms(0), 0);
        assert_eq!(clamp_delay_ms(MAX_DELAY_MS + 1), 1);
        assert_eq!(clamp_delay_ms(1000), 1000);
    }

    #[test]
    fn clear_removes_a_pending_timer() {
        let mut queue: TimerQueue<i32> = TimerQueue::new();
        let now = Instant::now();
        let id = queue.set(now, 1000, false, 1);
        queue.clear(id);
        assert!(!queue.has(id));
        assert!(queue.pop_due(now + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn repeating_timer_rearms_and_survives_its_own_fire() {
        let mut queue: TimerQueue<i32> = TimerQueue::new();
        let now = Instant::now();
        let id = queue.set(now, 10, true, 7);

        let first_fire = now + Duration::from_millis(10);
        let fired = queue.pop_due(first_fire);
        assert_eq!(fired, vec![(id, 7)]);
        assert!(queue.has(id));

        let second_fire = first_fire + Duration::from_millis(10);
        let fired_again = queue.pop_due(second_fire);
        assert_eq!(fired_again, vec![(id, 7)]);
    }

    #[test]
    fn a_slow_tick_coalesces_missed_repeats_instead_of_backlogging() {
        let mut queue: TimerQueue<i32> = TimerQueue::new();
        let now = Instant::now();
        queue.set(now, 10, true, 1);

        // Way past several would-be fires; only one fire should be reported.
        let late = now + Duration::from_millis(1000);
        let fired = queue.pop_due(late);
        assert_eq!(fired.len(), 1);

        // The timer should not be immediately due again right after `late`.
        assert!(queue.pop_due(late).is_empty());
    }

    #[test]
    fn ref_unref_controls_keep_alive() {
        let mut queue: TimerQueue<i32> = TimerQueue::new();
        let now = Instant::now();
        let id = queue.set(now, 10, false, 1);
        assert!(queue.has_ref_timers());
        queue.set_ref(id, false);
        assert!(!queue.has_ref_timers());
    }
}
