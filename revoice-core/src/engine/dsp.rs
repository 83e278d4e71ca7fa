//! Scalar DSP kernels used by the chunk processor.
//!
//! All routines operate on mono `f32` slices at a caller-chosen rate;
//! none of them allocate per-sample state across calls.

use crate::error::{Result, RevoiceError};

/// 5th-order Butterworth high-pass, 48 Hz cutoff at 16 kHz.
/// Coefficients from the bilinear transform of the analog prototype.
const HP_B: [f64; 6] = [
    0.969_960_645_183_844_7,
    -4.849_803_225_919_223,
    9.699_606_451_838_447,
    -9.699_606_451_838_447,
    4.849_803_225_919_223,
    -0.969_960_645_183_844_7,
];
const HP_A: [f64; 6] = [
    1.0,
    -4.939_001_819_168_364,
    9.757_863_526_739_54,
    -9.639_544_849_413_456,
    4.761_506_797_356_208,
    -0.940_823_653_205_46,
];

const HP_ORDER: usize = 5;
const PAD_LEN: usize = 3 * (HP_ORDER + 1);

/// Steady-state filter state for a unit step input, so the
/// forward/backward passes start without edge transients.
fn lfilter_zi() -> [f64; HP_ORDER] {
    // Solve (I - companion(a)^T) zi = b[1:] - a[1:] * b[0].
    let mut m = [[0.0f64; HP_ORDER]; HP_ORDER];
    let mut rhs = [0.0f64; HP_ORDER];
    for i in 0..HP_ORDER {
        m[i][0] = if i == 0 { 1.0 + HP_A[1] } else { HP_A[i + 1] };
        if i > 0 {
            m[i - 1][i] = -1.0;
            m[i][i] += 1.0;
        }
        rhs[i] = HP_B[i + 1] - HP_A[i + 1] * HP_B[0];
    }
    // Gaussian elimination with partial pivoting; the system is tiny.
    for col in 0..HP_ORDER {
        let pivot = (col..HP_ORDER)
            .max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot);
        rhs.swap(col, pivot);
        for row in col + 1..HP_ORDER {
            let factor = m[row][col] / m[col][col];
            for k in col..HP_ORDER {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }
    let mut zi = [0.0f64; HP_ORDER];
    for row in (0..HP_ORDER).rev() {
        let mut acc = rhs[row];
        for k in row + 1..HP_ORDER {
            acc -= m[row][k] * zi[k];
        }
        zi[row] = acc / m[row][row];
    }
    zi
}

/// Direct-form II transposed single pass, state seeded with `zi * x[0]`.
fn lfilter(x: &[f64], zi: &[f64; HP_ORDER]) -> Vec<f64> {
    let mut z = [0.0f64; HP_ORDER];
    for (s, v) in z.iter_mut().zip(zi.iter()) {
        *s = v * x[0];
    }
    let mut y = Vec::with_capacity(x.len());
    for &xv in x {
        let yv = HP_B[0] * xv + z[0];
        for j in 0..HP_ORDER - 1 {
            z[j] = HP_B[j + 1] * xv + z[j + 1] - HP_A[j + 1] * yv;
        }
        z[HP_ORDER - 1] = HP_B[HP_ORDER] * xv - HP_A[HP_ORDER] * yv;
        y.push(yv);
    }
    y
}

/// Odd extension at both edges, point-reflected about the edge samples.
/// The sample adjacent to an edge mirrors the sample just inside it:
/// `2*x[0] - x[1]` on the left, `2*x[n-1] - x[n-2]` on the right.
fn odd_ext(samples: &[f32], pad: usize) -> Vec<f64> {
    let n = samples.len();
    let first = samples[0] as f64;
    let last = samples[n - 1] as f64;
    let mut ext = Vec::with_capacity(n + 2 * pad);
    for i in (1..=pad).rev() {
        ext.push(2.0 * first - samples[i] as f64);
    }
    ext.extend(samples.iter().map(|&s| s as f64));
    for i in 1..=pad {
        ext.push(2.0 * last - samples[n - 1 - i] as f64);
    }
    ext
}

/// Zero-phase high-pass (forward-backward filtering) removing DC and
/// rumble below ~48 Hz before pitch analysis.
///
/// Inputs shorter than the edge padding are returned unchanged.
pub fn highpass_filtfilt(samples: &[f32]) -> Vec<f32> {
    if samples.len() <= PAD_LEN {
        return samples.to_vec();
    }

    let n = samples.len();
    let ext = odd_ext(samples, PAD_LEN);

    let zi = lfilter_zi();
    let forward = lfilter(&ext, &zi);
    let mut rev: Vec<f64> = forward.into_iter().rev().collect();
    rev = lfilter(&rev, &zi);
    rev.reverse();

    rev[PAD_LEN..PAD_LEN + n].iter().map(|&v| v as f32).collect()
}

/// Mirror `pad` samples (excluding the edge sample) onto both ends.
/// Pads wider than the input reflect repeatedly, bouncing between the
/// two edges the way `reflect` array padding does.
pub fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    if samples.is_empty() || pad == 0 {
        let mut out = vec![0.0; pad];
        out.extend_from_slice(samples);
        out.extend(std::iter::repeat(0.0).take(pad));
        return out;
    }
    if samples.len() == 1 {
        return vec![samples[0]; samples.len() + 2 * pad];
    }

    let n = samples.len() as isize;
    let period = 2 * (n - 1);
    let reflect_index = |i: isize| -> usize {
        let mut j = i.rem_euclid(period);
        if j >= n {
            j = period - j;
        }
        j as usize
    };

    let mut out = Vec::with_capacity(samples.len() + 2 * pad);
    for i in -(pad as isize)..n + pad as isize {
        out.push(samples[reflect_index(i)]);
    }
    out
}

/// Windowed RMS envelope, linearly interpolated to `out_len` points.
/// Window is half a second of audio at `rate`, hopped by half a window.
fn rms_envelope(samples: &[f32], rate: u32, out_len: usize) -> Vec<f32> {
    let frame = (rate as usize / 2).max(1);
    let hop = (frame / 2).max(1);

    let mut points = Vec::new();
    let mut start = 0usize;
    while start < samples.len() {
        let end = (start + frame).min(samples.len());
        let win = &samples[start..end];
        let mean_sq = win.iter().map(|s| s * s).sum::<f32>() / win.len() as f32;
        points.push(mean_sq.sqrt());
        start += hop;
    }
    if points.is_empty() {
        points.push(0.0);
    }

    if points.len() == 1 {
        return vec![points[0]; out_len];
    }
    let scale = (points.len() - 1) as f32 / (out_len.max(2) - 1) as f32;
    (0..out_len)
        .map(|i| {
            let pos = i as f32 * scale;
            let lo = pos.floor() as usize;
            let hi = (lo + 1).min(points.len() - 1);
            let frac = pos - lo as f32;
            points[lo] * (1.0 - frac) + points[hi] * frac
        })
        .collect()
}

/// Transfer the loudness envelope of `source` onto `output` in place.
///
/// `mix` = 1.0 keeps the synthesized envelope untouched; `mix` = 0.0
/// fully imposes the source envelope. Gain per sample is
/// `(rms_src / rms_out) ^ (1 - mix)`.
pub fn match_envelope(
    source: &[f32],
    source_rate: u32,
    output: &mut [f32],
    output_rate: u32,
    mix: f32,
) {
    if output.is_empty() || (mix - 1.0).abs() < f32::EPSILON {
        return;
    }
    let exponent = 1.0 - mix.clamp(0.0, 1.0);
    let rms_src = rms_envelope(source, source_rate, output.len());
    let rms_out = rms_envelope(output, output_rate, output.len());
    for ((sample, s), o) in output.iter_mut().zip(&rms_src).zip(&rms_out) {
        let gain = (s / o.max(1e-6)).powf(exponent);
        *sample *= gain;
    }
}

/// Scale down in place if the peak exceeds 0.99; quieter signals pass
/// through untouched.
pub fn limit_peak(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if peak > 0.99 {
        let gain = 0.99 / peak;
        for s in samples.iter_mut() {
            *s *= gain;
        }
    }
}

/// Output length the rate conversion of `input_len` samples must produce.
pub fn expected_output_len(input_len: usize, source_rate: u32, target_rate: u32) -> Result<usize> {
    if source_rate == 0 || target_rate == 0 {
        return Err(RevoiceError::InvalidRate(
            "sample rates must be nonzero".into(),
        ));
    }
    Ok((input_len as f64 * target_rate as f64 / source_rate as f64).round() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtfilt_removes_dc_offset() {
        let n = 2048;
        let input: Vec<f32> = (0..n)
            .map(|i| 0.5 + 0.3 * (std::f32::consts::TAU * 440.0 * i as f32 / 16_000.0).sin())
            .collect();
        let out = highpass_filtfilt(&input);
        assert_eq!(out.len(), n);
        let mean = out.iter().sum::<f32>() / n as f32;
        assert!(mean.abs() < 0.01, "residual DC: {mean}");
        // The 440 Hz content survives nearly intact.
        let rms = (out.iter().map(|s| s * s).sum::<f32>() / n as f32).sqrt();
        assert!(rms > 0.18, "tone attenuated: rms {rms}");
    }

    #[test]
    fn filtfilt_short_input_passthrough() {
        let input = vec![0.5f32; 10];
        assert_eq!(highpass_filtfilt(&input), input);
    }

    #[test]
    fn filtfilt_is_zero_phase_on_symmetric_input() {
        // A symmetric pulse stays roughly symmetric under forward-backward
        // filtering. The edge padding is short next to the filter's settling
        // time at this cutoff, so the tolerance is loose.
        let mut input = vec![0.0f32; 801];
        for (i, s) in input.iter_mut().enumerate() {
            let d = i as f32 - 400.0;
            *s = (-d * d / 2000.0).exp();
        }
        let out = highpass_filtfilt(&input);
        for i in 0..400 {
            assert!(
                (out[i] - out[800 - i]).abs() < 0.05,
                "asymmetry at {i}: {} vs {}",
                out[i],
                out[800 - i]
            );
        }
    }

    #[test]
    fn odd_extension_mirrors_outward_from_both_edges() {
        let ext = odd_ext(&[1.0, 2.0, 4.0, 7.0], 2);
        // Left: 2*1-4=-2, 2*1-2=0; right: 2*7-4=10, 2*7-2=12.
        assert_eq!(ext, vec![-2.0, 0.0, 1.0, 2.0, 4.0, 7.0, 10.0, 12.0]);
    }

    #[test]
    fn reflect_pad_mirrors_edges() {
        let out = reflect_pad(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(out, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]);
    }

    #[test]
    fn reflect_pad_wider_than_input() {
        let out = reflect_pad(&[1.0, 2.0, 3.0], 5);
        assert_eq!(out.len(), 13);
        // Bounces between both edges: ... 2 1 2 3 2 | 1 2 3 | 2 1 2 3 2
        assert_eq!(&out[..5], &[2.0, 1.0, 2.0, 3.0, 2.0]);
        assert_eq!(&out[8..], &[2.0, 1.0, 2.0, 3.0, 2.0]);
    }

    #[test]
    fn reflect_pad_single_sample_repeats() {
        assert_eq!(reflect_pad(&[0.7], 3), vec![0.7; 7]);
    }

    #[test]
    fn envelope_mix_one_is_identity() {
        let source = vec![0.5f32; 16_000];
        let mut output: Vec<f32> = (0..8000).map(|i| 0.01 * (i as f32 * 0.1).sin()).collect();
        let before = output.clone();
        match_envelope(&source, 16_000, &mut output, 40_000, 1.0);
        assert_eq!(output, before);
    }

    #[test]
    fn envelope_mix_zero_imposes_source_level() {
        let source: Vec<f32> = (0..16_000)
            .map(|i| 0.5 * (std::f32::consts::TAU * 200.0 * i as f32 / 16_000.0).sin())
            .collect();
        let mut output: Vec<f32> = (0..40_000)
            .map(|i| 0.05 * (std::f32::consts::TAU * 200.0 * i as f32 / 40_000.0).sin())
            .collect();
        match_envelope(&source, 16_000, &mut output, 40_000, 0.0);
        let rms = (output.iter().map(|s| s * s).sum::<f32>() / output.len() as f32).sqrt();
        // Pulled up towards the source RMS (~0.35), well above the original 0.035.
        assert!(rms > 0.2, "rms after envelope transfer: {rms}");
    }

    #[test]
    fn limit_peak_caps_loud_signal() {
        let mut samples = vec![0.0, 2.0, -1.5];
        limit_peak(&mut samples);
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!((peak - 0.99).abs() < 1e-6);
    }

    #[test]
    fn limit_peak_leaves_quiet_signal() {
        let mut samples = vec![0.1, -0.5, 0.3];
        let before = samples.clone();
        limit_peak(&mut samples);
        assert_eq!(samples, before);
    }

    #[test]
    fn expected_len_rounds() {
        assert_eq!(expected_output_len(1024, 48_000, 16_000).unwrap(), 341);
        assert_eq!(expected_output_len(341, 16_000, 48_000).unwrap(), 1023);
        assert_eq!(expected_output_len(160, 16_000, 40_000).unwrap(), 400);
        assert!(expected_output_len(100, 0, 48_000).is_err());
    }
}
