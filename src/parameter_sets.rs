use log::{debug, warn};

use crate::bitstream::{NAL_TYPE_PPS, NAL_TYPE_SPS, NalUnit, split_annexb};

/// One usable SPS/PPS pair, both stored without their start codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

/// Collects SPS and PPS units in a buffer of their own until a complete pair
/// can be read back out of it.
#[derive(Debug)]
pub struct ParameterSetCache {
    buffer: Vec<u8>,
    max_buffer: usize,
}

impl ParameterSetCache {
    pub fn new(max_buffer: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer,
        }
    }

    /// Feeds one unit. Returns the most recent pair once both halves are
    /// present; the buffer is emptied at that point.
    pub fn observe(&mut self, unit: &NalUnit) -> Option<ParameterSets> {
        if !unit.is_parameter_set() {
            return None;
        }
        if unit.data.len() > self.max_buffer {
            warn!(
                "parameter set of {} bytes exceeds the {} byte buffer, ignoring it",
                unit.data.len(),
                self.max_buffer
            );
            return None;
        }
        if self.buffer.len() + unit.data.len() > self.max_buffer {
            debug!(
                "parameter set buffer full at {} bytes, restarting accumulation",
                self.buffer.len()
            );
            self.buffer.clear();
        }
        self.buffer.extend_from_slice(&unit.data);

        let mut sps = None;
        let mut pps = None;
        for nal in split_annexb(&self.buffer) {
            match nal.nal_type {
                NAL_TYPE_SPS => sps = Some(nal.payload().to_vec()),
                NAL_TYPE_PPS => pps = Some(nal.payload().to_vec()),
                _ => {}
            }
        }

        match (sps, pps) {
            (Some(sps), Some(pps)) => {
                self.buffer.clear();
                Some(ParameterSets { sps, pps })
            }
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
