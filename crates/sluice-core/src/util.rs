//! General conversion functions and utilities.

/// Returns the raw amplitude from the given decibel value.
#[inline]
pub fn db_to_amp(db: f32) -> f32 {
    10.0f32.powf(0.05 * db)
}

/// Returns the decibel value from the raw amplitude.
#[inline]
pub fn amp_to_db(amp: f32) -> f32 {
    20.0 * amp.log10()
}

/// Returns the raw amplitude from the given decibel value.
///
/// If `db <= -100.0`, then 0.0 will be returned instead (negative infinity gain).
#[inline]
pub fn db_to_amp_clamped_neg_100_db(db: f32) -> f32 {
    if db <= -100.0 {
        0.0
    } else {
        db_to_amp(db)
    }
}

/// Map a percent value (where `0.0` means mute and `100.0` means unity
/// gain) to the corresponding raw gain value (not decibels). Values above
/// `100.0` are allowed.
#[inline]
pub fn percent_volume_to_raw_gain(percent_volume: f32) -> f32 {
    let n = percent_volume.max(0.0) * (1.0 / 100.0);
    n * n
}

/// Add `src` into `dst`, sample by sample.
#[inline]
pub fn mix_into(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += *s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_conversions() {
        assert!((db_to_amp(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_amp(-6.0206) - 0.5).abs() < 1e-4);
        assert!((amp_to_db(0.5) + 6.0206).abs() < 1e-3);
        assert_eq!(db_to_amp_clamped_neg_100_db(-120.0), 0.0);
        assert_eq!(percent_volume_to_raw_gain(100.0), 1.0);
        assert_eq!(percent_volume_to_raw_gain(50.0), 0.25);
        assert_eq!(percent_volume_to_raw_gain(-5.0), 0.0);
    }

    #[test]
    fn mixing_adds_samples() {
        let mut dst = [1.0, 1.0, 1.0];
        mix_into(&mut dst, &[0.5, 0.25, 0.0]);
        assert_eq!(dst, [1.5, 1.25, 1.0]);
    }
}
