//! # 8253/8254 Programmable Interval Timer
//!
//! Channel 0 drives IRQ 0, the scheduler tick.

use crate::ports::outb;

/// Input clock of the PIT in Hz.
pub const BASE_HZ: u32 = 1_193_182;

const CHANNEL0: u16 = 0x40;
const COMMAND: u16 = 0x43;

/// Channel 0, lobyte/hibyte, mode 3 (square wave), binary.
const MODE_SQUARE_WAVE: u8 = 0b0011_0110;

/// Reload value for a tick rate of `hz`, clamped to the counter range.
///
/// A reload of 0 means 65536 to the hardware and is never produced.
#[must_use]
pub const fn divisor_for(hz: u32) -> u16 {
    if hz == 0 {
        return u16::MAX;
    }
    let d = (BASE_HZ + hz / 2) / hz;
    if d == 0 {
        1
    } else if d > 0xFFFF {
        u16::MAX
    } else {
        #[allow(clippy::cast_possible_truncation)]
        {
            d as u16
        }
    }
}

/// Program channel 0 to fire at roughly `hz`.
///
/// # Safety
/// Ring 0, interrupts disabled.
pub unsafe fn start_periodic(hz: u32) {
    let divisor = divisor_for(hz);
    let [lo, hi] = divisor.to_le_bytes();
    unsafe {
        outb(COMMAND, MODE_SQUARE_WAVE);
        outb(CHANNEL0, lo);
        outb(CHANNEL0, hi);
    }
    log::debug!(
        "PIT: {hz} Hz requested, divisor {divisor}, actual {} Hz",
        BASE_HZ / u32::from(divisor)
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hundred_hz() {
        assert_eq!(divisor_for(100), 11932);
    }

    #[test]
    fn out_of_range_rates_are_clamped() {
        assert_eq!(divisor_for(1), u16::MAX);
        assert_eq!(divisor_for(0), u16::MAX);
        assert_eq!(divisor_for(5_000_000), 1);
    }
}
