//! Real FFT resources of one partition level
//!
//! Plans plus the time, prep and frequency work buffers a level needs. All
//! buffers and scratch are allocated up front; transforms never allocate.

use pconv_core::{ConvError, ConvResult, Sample, try_filled};
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use std::sync::Arc;

pub type Bin = Complex<Sample>;

pub struct FftPlan {
    parsize: usize,
    r2c: Arc<dyn RealToComplex<Sample>>,
    c2r: Arc<dyn ComplexToReal<Sample>>,
    /// Input block / inverse output, 2 * parsize
    pub time_data: Vec<Sample>,
    /// Impulse segment staging, 2 * parsize
    pub prep_data: Vec<Sample>,
    /// Spectrum work buffer, parsize + 1 bins
    pub freq_data: Vec<Bin>,
    fwd_scratch: Vec<Bin>,
    inv_scratch: Vec<Bin>,
}

impl FftPlan {
    /// Plan transforms of size `2 * parsize`
    pub fn new(parsize: usize, measure: bool) -> ConvResult<Self> {
        if !parsize.is_power_of_two() {
            return Err(ConvError::BadParam(format!(
                "partition size {parsize} is not a power of two"
            )));
        }
        let mut planner = RealFftPlanner::<Sample>::new();
        let r2c = planner.plan_fft_forward(2 * parsize);
        let c2r = planner.plan_fft_inverse(2 * parsize);
        let fwd_scratch = try_filled(r2c.get_scratch_len(), Bin::default())?;
        let inv_scratch = try_filled(c2r.get_scratch_len(), Bin::default())?;

        let mut plan = Self {
            parsize,
            r2c,
            c2r,
            time_data: try_filled(2 * parsize, 0.0)?,
            prep_data: try_filled(2 * parsize, 0.0)?,
            freq_data: try_filled(parsize + 1, Bin::default())?,
            fwd_scratch,
            inv_scratch,
        };
        if measure {
            plan.prime();
        }
        Ok(plan)
    }

    #[inline]
    pub fn parsize(&self) -> usize {
        self.parsize
    }

    /// Number of bins per partition spectrum
    #[inline]
    pub fn spectrum_len(&self) -> usize {
        self.parsize + 1
    }

    /// Forward transform of `time_data` into `out`. Clobbers `time_data`.
    #[inline]
    pub fn forward_time(&mut self, out: &mut [Bin]) {
        self.r2c
            .process_with_scratch(&mut self.time_data, out, &mut self.fwd_scratch)
            .ok();
    }

    /// Forward transform of `prep_data` into `freq_data`. Clobbers `prep_data`.
    #[inline]
    pub fn forward_prep(&mut self) {
        self.r2c
            .process_with_scratch(&mut self.prep_data, &mut self.freq_data, &mut self.fwd_scratch)
            .ok();
    }

    /// Inverse transform of `freq_data` into `time_data`, unnormalised
    #[inline]
    pub fn inverse(&mut self) {
        // DC and Nyquist are real for a real signal
        self.freq_data[0].im = 0.0;
        self.freq_data[self.parsize].im = 0.0;
        self.c2r
            .process_with_scratch(&mut self.freq_data, &mut self.time_data, &mut self.inv_scratch)
            .ok();
    }

    /// Run one transform pair so the first real cycle starts warm
    fn prime(&mut self) {
        self.time_data.fill(0.0);
        self.time_data[0] = 1.0;
        self.r2c
            .process_with_scratch(&mut self.time_data, &mut self.freq_data, &mut self.fwd_scratch)
            .ok();
        self.inverse();
        self.time_data.fill(0.0);
        self.freq_data.fill(Bin::default());
    }
}

/// `acc += a * b` bin by bin
#[inline]
pub fn complex_mac(acc: &mut [Bin], a: &[Bin], b: &[Bin]) {
    for ((r, x), y) in acc.iter_mut().zip(a).zip(b) {
        *r += x * y;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(FftPlan::new(100, false).is_err());
    }

    #[test]
    fn test_forward_inverse_scales_by_size() {
        let mut plan = FftPlan::new(64, true).unwrap();
        let signal: Vec<Sample> = (0..128).map(|i| ((i * 7) % 13) as Sample - 6.0).collect();
        plan.time_data.copy_from_slice(&signal);

        let mut spectrum = vec![Bin::default(); plan.spectrum_len()];
        plan.forward_time(&mut spectrum);
        plan.freq_data.copy_from_slice(&spectrum);
        plan.inverse();

        for (y, x) in plan.time_data.iter().zip(&signal) {
            assert_relative_eq!(*y / 128.0, *x, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_complex_mac() {
        let mut acc = vec![Bin::new(1.0, 0.0); 2];
        let a = [Bin::new(0.0, 1.0), Bin::new(2.0, 0.0)];
        let b = [Bin::new(0.0, 1.0), Bin::new(0.5, 0.5)];
        complex_mac(&mut acc, &a, &b);
        assert_relative_eq!(acc[0].re, 0.0);
        assert_relative_eq!(acc[1].re, 2.0);
        assert_relative_eq!(acc[1].im, 1.0);
    }
}
