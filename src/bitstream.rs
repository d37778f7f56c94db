use log::{debug, warn};

use crate::contract::StreamError;

pub const NAL_TYPE_UNSPECIFIED: u8 = 0;
pub const NAL_TYPE_IDR: u8 = 5;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;
/// Reserved type the sender uses for padding between pictures.
pub const NAL_TYPE_PADDING: u8 = 16;

/// Longest start code; also how many trailing bytes may hold a split one.
const START_CODE_TAIL: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    pub nal_type: u8,
    /// Annex-B bytes including the start code.
    pub data: Vec<u8>,
    pub start_code_len: usize,
}

impl NalUnit {
    fn from_annexb(data: Vec<u8>, start_code_len: usize) -> Self {
        let nal_type = data.get(start_code_len).map_or(0, |header| header & 0x1f);
        Self {
            nal_type,
            data,
            start_code_len,
        }
    }

    /// NAL bytes without the start code.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.start_code_len.min(self.data.len())..]
    }

    pub fn is_keyframe_candidate(&self) -> bool {
        self.nal_type == NAL_TYPE_IDR
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self.nal_type, NAL_TYPE_SPS | NAL_TYPE_PPS)
    }

    /// Padding and near-empty units that are never worth feeding a decoder.
    pub fn is_filler(&self) -> bool {
        self.nal_type == NAL_TYPE_PADDING
            || (self.nal_type == NAL_TYPE_UNSPECIFIED && self.data.len() <= 4)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScannerStats {
    pub units: u64,
    pub resyncs: u64,
    pub discarded_bytes: u64,
}

/// Carves complete NAL units out of an Annex-B byte stream that arrives in
/// arbitrary pieces. Whatever follows the last start code is kept until the
/// next start code shows up.
#[derive(Debug)]
pub struct AnnexBScanner {
    pending: Vec<u8>,
    /// Length of the start code `pending` begins with, if it begins with one.
    head_len: Option<usize>,
    /// Positions before this offset were already scanned and hold no start code.
    scan_from: usize,
    max_buffer: usize,
    stats: ScannerStats,
}

impl AnnexBScanner {
    pub fn new(max_buffer: usize) -> Self {
        Self {
            pending: Vec::new(),
            head_len: None,
            scan_from: 0,
            max_buffer: max_buffer.max(START_CODE_TAIL + 1),
            stats: ScannerStats::default(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<NalUnit> {
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        let mut boundaries: Vec<(usize, usize)> = self.head_len.map(|len| (0, len)).into_iter().collect();
        boundaries.extend(find_start_codes(&self.pending, self.scan_from));

        let Some(&(first, _)) = boundaries.first() else {
            self.scan_from = self.pending.len().saturating_sub(START_CODE_TAIL);
            self.enforce_cap();
            return Vec::new();
        };

        if first > 0 {
            debug!("discarding {first} bytes ahead of the first start code");
            self.stats.discarded_bytes += first as u64;
            self.pending.drain(..first);
            for boundary in &mut boundaries {
                boundary.0 -= first;
            }
        }

        let mut units = Vec::new();
        for window in boundaries.windows(2) {
            let (start, start_len) = window[0];
            let end = window[1].0;
            if end > start + start_len {
                units.push(NalUnit::from_annexb(
                    self.pending[start..end].to_vec(),
                    start_len,
                ));
            }
        }

        if let Some(&(last_start, last_len)) = boundaries.last() {
            self.pending.drain(..last_start);
            self.head_len = Some(last_len);
            self.scan_from = last_len.max(self.pending.len().saturating_sub(START_CODE_TAIL));
        }

        self.stats.units += units.len() as u64;
        self.enforce_cap();
        units
    }

    /// Emits the retained tail as a final unit. Only meaningful at end of stream.
    pub fn flush(&mut self) -> Option<NalUnit> {
        let unit = match self.head_len {
            Some(len) if self.pending.len() > len => Some(NalUnit::from_annexb(
                std::mem::take(&mut self.pending),
                len,
            )),
            _ => None,
        };
        if unit.is_some() {
            self.stats.units += 1;
        }
        self.reset();
        unit
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.head_len = None;
        self.scan_from = 0;
    }

    pub fn buffered_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> ScannerStats {
        self.stats
    }

    fn enforce_cap(&mut self) {
        if self.pending.len() <= self.max_buffer {
            return;
        }
        // Everything up to the cap was scanned without finding a usable
        // boundary. Keep only bytes that could start a split start code.
        let keep_from = self.pending.len() - START_CODE_TAIL;
        let err = StreamError::MalformedStream(format!(
            "no usable start code within {} bytes",
            self.max_buffer
        ));
        warn!("{err}, dropping {keep_from} bytes to resync");
        self.stats.resyncs += 1;
        self.stats.discarded_bytes += keep_from as u64;
        self.pending.drain(..keep_from);
        self.head_len = None;
        self.scan_from = 0;
    }
}

/// Splits a complete Annex-B buffer. The unit after the last start code is
/// treated as complete.
pub fn split_annexb(data: &[u8]) -> Vec<NalUnit> {
    let start_codes = find_start_codes(data, 0);
    let mut units = Vec::new();
    for (index, &(start, start_len)) in start_codes.iter().enumerate() {
        let end = start_codes
            .get(index + 1)
            .map_or(data.len(), |&(next, _)| next);
        if end > start + start_len {
            units.push(NalUnit::from_annexb(data[start..end].to_vec(), start_len));
        }
    }
    units
}

pub(crate) fn starts_with_start_code(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1])
}

/// Start codes as `(offset, length)`, preferring the 4-byte form at a position.
pub(crate) fn find_start_codes(data: &[u8], from: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut i = from;
    while i + 3 <= data.len() {
        if i + 4 <= data.len()
            && data[i] == 0
            && data[i + 1] == 0
            && data[i + 2] == 0
            && data[i + 3] == 1
        {
            out.push((i, 4));
            i += 4;
            continue;
        }
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            out.push((i, 3));
            i += 3;
            continue;
        }
        i += 1;
    }
    out
}
