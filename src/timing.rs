//! Monotonic time, busy-waits and delays

use embedded_hal::blocking::delay::{DelayMs, DelayUs};

/// Microsecond instant
pub type Instant = fugit::TimerInstantU64<1_000_000>;

/// Microsecond duration
pub type Duration = fugit::MicrosDurationU64;

/// A free-running monotonic counter.
///
/// This is the only notion of time the driver has; it never sleeps, it only
/// spins while watching the counter.
pub trait Counter {
    fn get_counter(&self) -> Instant;
}

impl<C: Counter> Counter for &C {
    fn get_counter(&self) -> Instant {
        (**self).get_counter()
    }
}

/// Milliseconds elapsed since `start`
pub fn elapsed_ms<C: Counter>(timer: &C, start: Instant) -> u64 {
    timer
        .get_counter()
        .checked_duration_since(start)
        .map(|d| d.to_millis())
        .unwrap_or(0)
}

/// The budget of a [`wait_for`] ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub time_ms: u64,
}

/// Spin until `check` yields a value or `budget_ms` milliseconds pass.
///
/// `check` is always given one last chance after the budget is spent, so a
/// condition that became true while the counter was being read is not lost.
pub fn wait_for<C, T, F>(timer: &C, budget_ms: u64, mut check: F) -> Result<T, Expired>
where
    C: Counter,
    F: FnMut() -> Option<T>,
{
    let start_time = timer.get_counter();

    loop {
        if let Some(value) = check() {
            return Ok(value);
        }

        let time_delta = elapsed_ms(timer, start_time);

        if time_delta > budget_ms {
            return match check() {
                Some(value) => Ok(value),
                None => Err(Expired { time_ms: time_delta }),
            };
        }

        core::hint::spin_loop();
    }
}

/// Delay provider that spins on a [`Counter`]
pub struct Delay<'a, C: Counter> {
    timer: &'a C,
}

impl<'a, C: Counter> Delay<'a, C> {
    pub fn new(timer: &'a C) -> Self {
        Self { timer }
    }

    fn spin(&self, duration: Duration) {
        let start_time = self.timer.get_counter();

        while self
            .timer
            .get_counter()
            .checked_duration_since(start_time)
            .map(|d| d < duration)
            .unwrap_or(true)
        {
            core::hint::spin_loop();
        }
    }
}

impl<C: Counter> DelayUs<u32> for Delay<'_, C> {
    fn delay_us(&mut self, us: u32) {
        self.spin(Duration::micros(us as u64));
    }
}

impl<C: Counter> DelayMs<u32> for Delay<'_, C> {
    fn delay_ms(&mut self, ms: u32) {
        self.spin(Duration::millis(ms as u64));
    }
}

/// Counter built on the Cortex-M DWT cycle counter.
///
/// The cycle counter must already be enabled (`DCB::enable_trace` and
/// `DWT::enable_cycle_counter`). It is only 32 bits wide, so it has to be
/// read at least once per wrap for the extension to stay monotonic.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub struct DwtCounter {
    cycles_per_us: u32,
    last: core::cell::Cell<u32>,
    wraps: core::cell::Cell<u32>,
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
impl DwtCounter {
    pub fn new(sysclk_hz: u32) -> Self {
        Self {
            cycles_per_us: (sysclk_hz / 1_000_000).max(1),
            last: core::cell::Cell::new(cortex_m::peripheral::DWT::cycle_count()),
            wraps: core::cell::Cell::new(0),
        }
    }
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
impl Counter for DwtCounter {
    fn get_counter(&self) -> Instant {
        let now = cortex_m::peripheral::DWT::cycle_count();

        if now < self.last.get() {
            self.wraps.set(self.wraps.get().wrapping_add(1));
        }
        self.last.set(now);

        let cycles = ((self.wraps.get() as u64) << 32) | now as u64;
        Instant::from_ticks(cycles / self.cycles_per_us as u64)
    }
}
