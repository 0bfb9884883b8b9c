//! Radio signal strength to quality conversion.

use crate::platform::{Connectivity, SystemTimer};

/// Raw readings averaged per quality sample.
pub const STRENGTH_SAMPLES: i32 = 3;

/// Spacing between raw readings.
pub const STRENGTH_SAMPLE_SPACING_MS: u32 = 2;

/// Maps received strength in dBm onto a 0-100 quality percentage.
#[must_use]
pub const fn signal_quality(dbm: i32) -> u8 {
    if dbm <= -100 {
        0
    } else if dbm >= -50 {
        100
    } else {
        // -100 < dbm < -50, so the result lies in 2..=98.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let quality = (2 * (dbm + 100)) as u8;
        quality
    }
}

/// Integer mean of [`STRENGTH_SAMPLES`] readings spaced
/// [`STRENGTH_SAMPLE_SPACING_MS`] apart.
pub fn average_strength<R, T>(radio: &mut R, timer: &mut T) -> i32
where
    R: Connectivity,
    T: SystemTimer,
{
    let mut total = 0_i32;
    for _ in 0..STRENGTH_SAMPLES {
        total = total.saturating_add(radio.signal_strength());
        timer.delay_ms(STRENGTH_SAMPLE_SPACING_MS);
    }
    total / STRENGTH_SAMPLES
}
