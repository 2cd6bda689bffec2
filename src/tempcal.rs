// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Temperature-dependent range offset.
//!
//! The sensor head reports raw ADC readings for the laser thermistor and
//! the VLDA rail in every metadata row. A sliding window of both is kept
//! per FOV; on frame completion the window statistic is converted to
//! volts with the FPGA's ADC calibration, the thermistor voltage to a
//! resistance through the board's divider, and the resistance to degrees
//! Celsius with a fixed Steinhart-Hart polynomial. The resulting offset
//! in meters is subtracted from every output range.

use crate::metadata::Metadata;
use tracing::error;

const MIN_VLDA_VOLTAGE: f32 = 10.0;
const MAX_VLDA_VOLTAGE: f32 = 25.0;
const FIFO_LENGTH: usize = 100;

/// Steinhart-Hart coefficients for the laser thermistor.
const COEFFS: [f32; 4] = [
    7.747_572e-4,
    2.885_116_9e-4,
    -4.016_805e-6,
    3.363_254_8e-7,
];

/// Which statistic of the ADC window feeds the conversion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Technique {
    Latest,
    Mean,
    Median,
}

/// Per-model ADC wiring and scaling.
struct ModelPreset {
    ref_resistance: f32,
    external_vref: f32,
    vlda_scale: f32,
    vlda_adc_idx: usize,
    laser_therm_adc_idx: usize,
}

const M20: ModelPreset = ModelPreset {
    ref_resistance: 41200.0,
    external_vref: 2.5,
    vlda_scale: 29.70 * 0.5,
    vlda_adc_idx: 3,
    laser_therm_adc_idx: 4,
};

const M25: ModelPreset = ModelPreset {
    ref_resistance: 7150.0,
    external_vref: 1.22,
    vlda_scale: 25.85,
    vlda_adc_idx: 6,
    laser_therm_adc_idx: 2,
};

const M30: ModelPreset = ModelPreset {
    ref_resistance: 7150.0,
    external_vref: 1.22,
    vlda_scale: 25.85,
    vlda_adc_idx: 6,
    laser_therm_adc_idx: 2,
};

pub struct TemperatureCalibration {
    disable: bool,
    technique: Technique,
    fifo_index: usize,
    preset: ModelPreset,

    adc_cal_gain: f32,
    adc_cal_offset: f32,
    mm_per_celsius: f32,
    mm_per_volt: f32,
    fixed_offset_mm: f32,

    laser_therm_values: Vec<f32>,
    vlda_values: Vec<f32>,

    range_offset_meters: f32,
}

impl Default for TemperatureCalibration {
    fn default() -> Self {
        Self::new()
    }
}

fn steinhart(res: f32) -> f32 {
    let ln = res.ln();
    let temp_k = 1.0 / (COEFFS[0] + COEFFS[1] * ln + COEFFS[2] * ln * ln + COEFFS[3] * ln * ln * ln);
    temp_k - 273.15
}

fn statistic(values: &[f32], technique: Technique, latest_idx: usize) -> f32 {
    match technique {
        Technique::Latest => values[latest_idx],
        Technique::Mean => values.iter().sum::<f32>() / values.len() as f32,
        Technique::Median => {
            let mut sorted = values.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            sorted[sorted.len() / 2]
        }
    }
}

impl TemperatureCalibration {
    pub fn new() -> Self {
        TemperatureCalibration {
            disable: false,
            technique: Technique::Median,
            fifo_index: 0,
            preset: M30,
            adc_cal_gain: 0.0,
            adc_cal_offset: 0.0,
            mm_per_celsius: 0.0,
            mm_per_volt: 0.0,
            fixed_offset_mm: 0.0,
            laser_therm_values: Vec::new(),
            vlda_values: Vec::new(),
            range_offset_meters: 0.0,
        }
    }

    pub fn set_technique(&mut self, technique: Technique) {
        self.technique = technique;
    }

    /// Capture this ROI's ADC values; recompute the offset when the FOV
    /// completes.
    pub fn set_adc_values(&mut self, mdat: &Metadata, fov: usize) {
        if !mdat.enable_temp_range_adjustment(fov) {
            self.range_offset_meters = 0.0;
            return;
        }

        if mdat.first_roi(fov) {
            if mdat.is_m20() {
                // Compensation is not supported on M20 hardware.
                self.preset = M20;
                self.disable = true;
                self.range_offset_meters = 0.0;
                return;
            }

            self.disable = false;
            self.adc_cal_gain = mdat.adc_cal_gain();
            self.adc_cal_offset = mdat.adc_cal_offset();
            self.mm_per_celsius = mdat.range_cal_mm_per_celsius();
            self.mm_per_volt = mdat.range_cal_mm_per_volt();
            self.fixed_offset_mm = mdat.range_cal_offset_mm();

            self.preset = if mdat.is_m25() { M25 } else { M30 };
        }

        if self.disable {
            return;
        }

        // Inconsistent metadata mid-FOV disables compensation outright.
        if self.adc_cal_gain != mdat.adc_cal_gain()
            || self.adc_cal_offset != mdat.adc_cal_offset()
            || self.mm_per_celsius != mdat.range_cal_mm_per_celsius()
            || self.mm_per_volt != mdat.range_cal_mm_per_volt()
            || self.fixed_offset_mm != mdat.range_cal_offset_mm()
            || self.adc_cal_gain == 0.0
        {
            self.range_offset_meters = 0.0;
            self.laser_therm_values.clear();
            self.vlda_values.clear();
            self.disable = true;
            return;
        }

        let therm = f32::from(mdat.adc(self.preset.laser_therm_adc_idx));
        let vlda = f32::from(mdat.adc(self.preset.vlda_adc_idx));
        if self.laser_therm_values.is_empty() || self.vlda_values.is_empty() {
            self.laser_therm_values = vec![therm; FIFO_LENGTH];
            self.vlda_values = vec![vlda; FIFO_LENGTH];
        }

        self.fifo_index = (self.fifo_index + 1) % FIFO_LENGTH;
        self.laser_therm_values[self.fifo_index] = therm;
        self.vlda_values[self.fifo_index] = vlda;

        if mdat.frame_completed(fov) {
            self.compute();
        }
    }

    fn compute(&mut self) {
        self.range_offset_meters = 0.0;
        if self.disable || self.vlda_values.is_empty() || self.laser_therm_values.is_empty() {
            return;
        }

        let therm_raw = statistic(&self.laser_therm_values, self.technique, self.fifo_index);
        let vlda_raw = statistic(&self.vlda_values, self.technique, self.fifo_index);

        let therm_volts = self.adc_cal_gain * therm_raw + self.adc_cal_offset;
        let therm_res = (self.preset.ref_resistance * therm_volts)
            / (self.preset.external_vref - therm_volts);
        let temp_celsius = steinhart(therm_res);

        if temp_celsius.is_nan() {
            error!("measured thermistor value is invalid, temperature compensation disabled");
            return;
        }

        let vlda_volts = (self.adc_cal_gain * vlda_raw + self.adc_cal_offset) * self.preset.vlda_scale;
        if !(MIN_VLDA_VOLTAGE..=MAX_VLDA_VOLTAGE).contains(&vlda_volts) {
            error!(
                vlda_volts,
                "measured VLDA voltage outside accepted range, temperature compensation disabled"
            );
            return;
        }

        let offset_mm =
            self.fixed_offset_mm + self.mm_per_celsius * temp_celsius - self.mm_per_volt * vlda_volts;
        self.range_offset_meters = 1.0e-3 * offset_mm;
    }

    /// The current range offset in meters; zero whenever compensation is
    /// disabled or the inputs were rejected.
    pub fn range_offset(&self) -> f32 {
        if self.disable {
            return 0.0;
        }
        self.range_offset_meters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{build, default_metadata_words};

    fn md_with(system_type: u16, therm: u16, vlda: u16, temp_adj: bool) -> Vec<u8> {
        let mut words = default_metadata_words();
        build::set(&mut words, build::SYSTEM_TYPE, system_type);
        // M30 preset: thermistor on ADC 2, VLDA on ADC 6.
        build::set(&mut words, build::ADC + 2, therm);
        build::set(&mut words, build::ADC + 6, vlda);
        if temp_adj {
            build::set_fov(
                &mut words,
                0,
                build::FOV_ALG_COMMON,
                build::ALG_COMMON_TEMP_ADJ,
            );
        }
        build::to_bytes(&words)
    }

    #[test]
    fn test_disabled_without_flag() {
        let mut cal = TemperatureCalibration::new();
        let bytes = md_with(3, 1000, 2000, false);
        let md = Metadata::new(&bytes).unwrap();
        cal.set_adc_values(&md, 0);
        assert_eq!(cal.range_offset(), 0.0);
    }

    #[test]
    fn test_m20_always_zero() {
        let mut cal = TemperatureCalibration::new();
        let bytes = md_with(1, 1000, 2000, true);
        let md = Metadata::new(&bytes).unwrap();
        cal.set_adc_values(&md, 0);
        assert_eq!(cal.range_offset(), 0.0);
    }

    #[test]
    fn test_m30_produces_offset() {
        let mut cal = TemperatureCalibration::new();
        // Default cal gain 402 * 2^-19 ~ 7.67e-4 V/count.
        // therm 800 counts -> ~0.66 V, below vref 1.22 V, sane resistance.
        // vlda 750 counts -> ~0.62 V * 25.85 ~ 16 V, inside [10, 25].
        let bytes = md_with(3, 800, 750, true);
        let md = Metadata::new(&bytes).unwrap();
        cal.set_adc_values(&md, 0);
        let offset = cal.range_offset();
        assert!(offset != 0.0);
        assert!(offset.abs() < 1.0, "offset should be centimeters-scale: {offset}");
    }

    #[test]
    fn test_vlda_out_of_range_rejected() {
        let mut cal = TemperatureCalibration::new();
        // vlda 4000 counts -> way above 25 V.
        let bytes = md_with(3, 800, 4000, true);
        let md = Metadata::new(&bytes).unwrap();
        cal.set_adc_values(&md, 0);
        assert_eq!(cal.range_offset(), 0.0);
    }

    #[test]
    fn test_technique_statistics() {
        let values = [1.0, 5.0, 3.0];
        assert_eq!(statistic(&values, Technique::Latest, 2), 3.0);
        assert_eq!(statistic(&values, Technique::Mean, 2), 3.0);
        assert_eq!(statistic(&values, Technique::Median, 2), 3.0);
    }
}
