use bitflags::bitflags;

bitflags! {
    /// Axis status register, as reported in `STAT` telemetry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Status: u32 {
        const AMPLIFIERS_ENABLED = 1 << 0;
        const END_STOP = 1 << 1;
        const THERMAL_PROTECTION_1 = 1 << 2;
        const THERMAL_PROTECTION_2 = 1 << 3;
        const FORCE_ZERO = 1 << 4;
        const MOTOR_ON = 1 << 5;
        const CLOSED_LOOP = 1 << 6;
        const ENCODER_AT_INDEX = 1 << 7;
        const ENCODER_VALID = 1 << 8;
        const SEARCHING_INDEX = 1 << 9;
        const POSITION_REACHED = 1 << 10;
        const ERROR_COMPENSATION = 1 << 11;
        const ENCODER_ERROR = 1 << 12;
        const SCANNING = 1 << 13;
        const LEFT_END_STOP = 1 << 14;
        const RIGHT_END_STOP = 1 << 15;
        const ERROR_LIMIT = 1 << 16;
        const SEARCHING_OPTIMAL_FREQUENCY = 1 << 17;
        const SAFETY_TIMEOUT_TRIGGERED = 1 << 18;
        const ETHERCAT_ACKNOWLEDGE = 1 << 19;
        const EMERGENCY_STOP = 1 << 20;
        const POSITION_FAIL = 1 << 21;
    }
}

impl Status {
    /// Decode raw `STAT` telemetry. Bits outside the register are dropped.
    pub fn from_raw(raw: i64) -> Self {
        Status::from_bits_truncate(raw as u32)
    }
}
