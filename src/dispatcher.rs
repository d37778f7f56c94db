use crate::bitstream::NalUnit;
use crate::contract::AccessUnit;

/// Turns admitted units into timestamped access units. Timestamps advance by
/// a fixed interval per submitted unit, not by wall-clock time.
#[derive(Debug)]
pub struct AccessUnitDispatcher {
    frame_interval_us: u64,
    next_timestamp_us: u64,
}

impl AccessUnitDispatcher {
    pub fn new(frame_interval_us: u64) -> Self {
        Self {
            frame_interval_us: frame_interval_us.max(1),
            next_timestamp_us: 0,
        }
    }

    pub fn stamp(&mut self, unit: &NalUnit) -> AccessUnit {
        self.next_timestamp_us += self.frame_interval_us;
        AccessUnit {
            data: unit.data.clone(),
            timestamp_us: self.next_timestamp_us,
            is_key: unit.is_keyframe_candidate(),
            nal_type: unit.nal_type,
        }
    }

    /// Called on every decoder rebuild; the next unit is stamped one interval
    /// after zero again.
    pub fn reset(&mut self) {
        self.next_timestamp_us = 0;
    }
}
