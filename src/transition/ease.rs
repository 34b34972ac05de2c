//! Easing and bounce curves for mode-transition geometry.
//!
//! Pure functions; the engine in the parent module drives them from the
//! frame clock.

use std::f32::consts::PI;

/// Dual power-based ease-in/ease-out.
///
/// The ease-in power shapes `t ∈ [0, 0.5]`, the ease-out power shapes
/// `t ∈ [0.5, 1]`, each half mapped to the unit interval and scaled back
/// into its own half. `f(0) = 0`, `f(0.5) = 0.5`, `f(1) = 1`, monotonically
/// non-decreasing for positive powers.
pub fn ease_in_out_pow(t: f32, ease_in_pow: f32, ease_out_pow: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    if t <= 0.5 {
        0.5 * (2.0 * t).powf(ease_in_pow)
    } else {
        1.0 - 0.5 * (2.0 * (1.0 - t)).powf(ease_out_pow)
    }
}

/// Amplitude decay of the `index`-th bounce out of `total`.
///
/// `decay(0) = 1`, strictly decreasing, `decay(total) = 0`, so each
/// successive bounce is smaller and the last one lands exactly at rest.
pub fn bounce_decay(index: u32, total: u32) -> f32 {
    if total == 0 {
        return 0.0;
    }
    let r = 1.0 - index.min(total) as f32 / total as f32;
    r * r
}

/// Signed bounce offset at `phase ∈ [0, 1]` within bounce `index`.
pub fn bounce_offset(phase: f32, index: u32, total: u32, intensity: f32) -> f32 {
    (phase.clamp(0.0, 1.0) * PI).sin() * intensity * bounce_decay(index, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ease_endpoints() {
        for &(p_in, p_out) in &[(1.0, 1.0), (2.0, 2.0), (2.0, 3.0), (0.5, 4.0)] {
            assert_eq!(ease_in_out_pow(0.0, p_in, p_out), 0.0);
            assert_eq!(ease_in_out_pow(1.0, p_in, p_out), 1.0);
            assert!((ease_in_out_pow(0.5, p_in, p_out) - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_ease_monotone() {
        let samples = [0.0, 0.25, 0.5, 0.75, 1.0];
        for &(p_in, p_out) in &[(1.0, 1.0), (2.0, 2.0), (3.0, 1.5), (0.7, 0.7)] {
            let mut prev = -1.0f32;
            for &t in &samples {
                let v = ease_in_out_pow(t, p_in, p_out);
                assert!(
                    v >= prev,
                    "ease not monotone at t={} (powers {}/{}): {} < {}",
                    t,
                    p_in,
                    p_out,
                    v,
                    prev
                );
                prev = v;
            }
        }
    }

    #[test]
    fn test_ease_clamps_out_of_range_input() {
        assert_eq!(ease_in_out_pow(-0.5, 2.0, 2.0), 0.0);
        assert_eq!(ease_in_out_pow(1.5, 2.0, 2.0), 1.0);
    }

    #[test]
    fn test_decay_monotone_and_terminal() {
        let total = 4;
        for i in 0..total {
            let here = bounce_decay(i, total);
            let next = bounce_decay(i + 1, total);
            assert!(here >= next, "decay({}) < decay({})", i, i + 1);
            assert!(next >= 0.0);
        }
        assert_eq!(bounce_decay(total, total), 0.0);
        assert_eq!(bounce_decay(0, total), 1.0);
    }

    #[test]
    fn test_bounce_offset_sign_matches_sine() {
        // Mid-bounce is the sine peak.
        let peak = bounce_offset(0.5, 0, 3, 0.05);
        assert!(peak > 0.0);
        // Bounce endpoints rest at zero.
        assert!(bounce_offset(0.0, 0, 3, 0.05).abs() < 1e-6);
        assert!(bounce_offset(1.0, 0, 3, 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_bounce_offset_decays_across_bounces() {
        let first = bounce_offset(0.5, 0, 3, 0.05);
        let second = bounce_offset(0.5, 1, 3, 0.05);
        let third = bounce_offset(0.5, 2, 3, 0.05);
        assert!(first > second && second > third && third > 0.0);
    }
}
