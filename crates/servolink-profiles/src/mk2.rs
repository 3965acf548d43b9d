// Copyright 2026 Servolink Developers
// SPDX-License-Identifier: Apache-2.0

//! MK2 lock-box profile.
//!
//! The MK2 is an FPGA-based PID lock-box: a sweep generator and PID
//! controller share one output DAC, selected and reset through bits of the
//! system control register. Device status is not reported directly — it is
//! derived from the control flags and the sweep range.

use servolink_channel::{
    ChannelStatus, DeviceProfile, ErrorCondition, RegisterBank, RegisterDescriptor,
};

/// PID integrator reset, active low.
pub const PID_RST_N: u16 = 1 << 0;
/// Ramp generator reset, active low.
pub const RAMP_RST_N: u16 = 1 << 1;
/// Output DAC source: 0 = PID, 1 = sweep ramp.
pub const OUTPUT_SEL: u16 = 1 << 2;
/// PID sign flip.
pub const PID_POLARITY: u16 = 1 << 3;
/// Automatic relocking enabled.
pub const RELOCK_ON: u16 = 1 << 4;

/// Control bits that decide between sweeping and controlling.
pub const SWEEP_MASK: u16 = PID_RST_N | RAMP_RST_N | OUTPUT_SEL;
/// Flag combination while the device sweeps: PID held in reset, ramp
/// running, ramp on the output.
pub const SWEEP_STATE: u16 = RAMP_RST_N | OUTPUT_SEL;

/// Display names of the MK2's sample streams, by stream index.
pub const STREAM_NAMES: [&str; 4] = [
    "ADC (error signal)",
    "PID/ramp output",
    "Relock slow lowpass filter",
    "Relock filter difference",
];

const CLOCK_INTERVAL_SECS: f64 = 1.0 / 96e6;
const RAMP_COUNTER_WIDTH: u32 = 44;
const RAMP_OUTPUT_WIDTH: u32 = 16;

/// Register indices of the MK2 controller.
pub struct Mk2Registers;

impl Mk2Registers {
    pub const SYSTEM_CONTROL: u8 = 0;
    pub const SWEEP_CENTER: u8 = 1;
    pub const SWEEP_RANGE: u8 = 2;
    pub const SWEEP_FREQUENCY: u8 = 3;
    pub const INPUT_OFFSET: u8 = 4;
    pub const OUTPUT_OFFSET: u8 = 5;
    pub const P_GAIN: u8 = 6;
    pub const I_GAIN: u8 = 7;
    pub const D_GAIN: u8 = 8;
    pub const FILTER_RESPONSE: u8 = 9;
    pub const RELOCK_THRESHOLD: u8 = 10;
    pub const TTL_EXPONENT: u8 = 11;
    pub const SYSTEM_CONDITION: u8 = 30;
}

static ERROR_CONDITIONS: [ErrorCondition; 1] = [ErrorCondition::new(
    0b1,
    "ADC_RANGE",
    "Analog input out of range",
)];

/// Profile for second-generation lock-box controllers.
pub struct Mk2Profile;

impl DeviceProfile for Mk2Profile {
    fn registers(&self) -> Vec<RegisterDescriptor> {
        vec![
            RegisterDescriptor::signed(Mk2Registers::SWEEP_CENTER),
            RegisterDescriptor::unsigned(Mk2Registers::SWEEP_RANGE),
            RegisterDescriptor::unsigned(Mk2Registers::SWEEP_FREQUENCY),
            RegisterDescriptor::signed(Mk2Registers::INPUT_OFFSET),
            RegisterDescriptor::signed(Mk2Registers::OUTPUT_OFFSET),
            RegisterDescriptor::unsigned(Mk2Registers::P_GAIN),
            RegisterDescriptor::unsigned(Mk2Registers::I_GAIN),
            RegisterDescriptor::unsigned(Mk2Registers::D_GAIN),
            RegisterDescriptor::signed(Mk2Registers::FILTER_RESPONSE),
            RegisterDescriptor::unsigned(Mk2Registers::RELOCK_THRESHOLD),
            RegisterDescriptor::unsigned(Mk2Registers::TTL_EXPONENT),
            RegisterDescriptor::unsigned(Mk2Registers::SYSTEM_CONTROL),
            RegisterDescriptor::unsigned(Mk2Registers::SYSTEM_CONDITION),
        ]
    }

    fn condition_register(&self) -> Option<u8> {
        Some(Mk2Registers::SYSTEM_CONDITION)
    }

    fn error_conditions(&self) -> &[ErrorCondition] {
        &ERROR_CONDITIONS
    }

    fn status(&self, registers: &RegisterBank) -> ChannelStatus {
        decode_status(
            registers.value(Mk2Registers::SYSTEM_CONTROL),
            registers.value(Mk2Registers::SWEEP_RANGE),
        )
    }
}

/// Derive the device status from the control flags and the sweep range.
///
/// A sweeping device with zero range is effectively parked (idle); sweeping
/// with a range is the configuration view; anything else means the PID loop
/// is in control.
pub fn decode_status(control: i32, sweep_range: i32) -> ChannelStatus {
    if (control as u16) & SWEEP_MASK == SWEEP_STATE {
        if sweep_range == 0 {
            ChannelStatus::Idle
        } else {
            ChannelStatus::Configuring
        }
    } else {
        ChannelStatus::Running
    }
}

/// Duration of the up and down sweep ramps for a frequency register value.
///
/// The ramp counter is 44 bits wide with the top 16 driving the output; the
/// down ramp runs eight times as fast as the up ramp.
pub fn sweep_timings(frequency: i32) -> Option<(f64, f64)> {
    if frequency <= 0 {
        return None;
    }
    let counter_steps = (1u64 << (RAMP_COUNTER_WIDTH - RAMP_OUTPUT_WIDTH)) - 1;
    let up_secs = counter_steps as f64 / f64::from(frequency) * CLOCK_INTERVAL_SECS;
    let down_secs = (counter_steps / 8) as f64 / f64::from(frequency) * CLOCK_INTERVAL_SECS;
    Some((up_secs, down_secs))
}

/// Register writes that take the device out of lock and back to sweeping.
///
/// Writing all sweep bits (not only the ones known to differ) keeps the
/// device recoverable from inconsistent flag states.
pub fn unlock_writes(current_control: i32) -> [(u8, i32); 2] {
    let control =
        (current_control & !i32::from(SWEEP_MASK)) | i32::from(SWEEP_STATE);
    [
        (Mk2Registers::SWEEP_RANGE, 0),
        (Mk2Registers::SYSTEM_CONTROL, control),
    ]
}
