use log::warn;

use crate::contract::{DecoderConfig, StreamError};
use crate::parameter_sets::ParameterSets;

/// Constrained Baseline 3.0, used whenever no usable SPS is at hand.
pub const FALLBACK_CODEC: &str = "avc1.42E01E";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

pub fn codec_string(profile_idc: u8, level_idc: u8) -> String {
    format!("avc1.{profile_idc:02X}00{level_idc:02X}")
}

pub fn fallback_decoder_config(coded_hint: (u32, u32)) -> DecoderConfig {
    DecoderConfig {
        codec: FALLBACK_CODEC.to_string(),
        description: None,
        coded_width: coded_hint.0,
        coded_height: coded_hint.1,
    }
}

/// Builds the decoder configuration for a parameter-set pair. A pair that
/// cannot be packed into a configuration record degrades to the Baseline
/// fallback without description.
pub fn build_decoder_config(sets: &ParameterSets, coded_hint: (u32, u32)) -> DecoderConfig {
    let record = match avc_decoder_configuration_record(sets) {
        Ok(record) => record,
        Err(err) => {
            warn!("{err}; using {FALLBACK_CODEC} without description");
            return fallback_decoder_config(coded_hint);
        }
    };

    let (coded_width, coded_height) = match parse_sps(&sets.sps) {
        Some(info) if info.width > 0 && info.height > 0 => (info.width, info.height),
        _ => coded_hint,
    };

    DecoderConfig {
        codec: codec_string(sets.sps[1], sets.sps[3]),
        description: Some(record),
        coded_width,
        coded_height,
    }
}

/// ISO/IEC 14496-15 AVCDecoderConfigurationRecord with one SPS, one PPS and
/// 4-byte NALU lengths.
pub fn avc_decoder_configuration_record(sets: &ParameterSets) -> Result<Vec<u8>, StreamError> {
    let sps = &sets.sps;
    let pps = &sets.pps;
    if sps.len() < 4 {
        return Err(StreamError::Configuration(format!(
            "SPS too short ({} bytes)",
            sps.len()
        )));
    }
    if pps.is_empty() {
        return Err(StreamError::Configuration("empty PPS".to_string()));
    }
    let sps_len = u16::try_from(sps.len())
        .map_err(|_| StreamError::Configuration(format!("SPS of {} bytes", sps.len())))?;
    let pps_len = u16::try_from(pps.len())
        .map_err(|_| StreamError::Configuration(format!("PPS of {} bytes", pps.len())))?;

    let mut record = Vec::with_capacity(11 + sps.len() + pps.len());
    record.push(0x01);
    record.extend_from_slice(&sps[1..4]);
    record.push(0xFF);
    record.push(0xE1);
    record.extend_from_slice(&sps_len.to_be_bytes());
    record.extend_from_slice(sps);
    record.push(0x01);
    record.extend_from_slice(&pps_len.to_be_bytes());
    record.extend_from_slice(pps);
    Ok(record)
}

/// Reads profile, level and the cropped picture size from an SPS NAL unit
/// (header byte included, no start code).
pub fn parse_sps(sps: &[u8]) -> Option<SpsInfo> {
    if sps.len() < 4 {
        return None;
    }
    let rbsp = strip_emulation_prevention(&sps[1..]);
    let mut bits = BitReader::new(&rbsp);

    let profile_idc = bits.read_bits(8)? as u8;
    let constraint_flags = bits.read_bits(8)? as u8;
    let level_idc = bits.read_bits(8)? as u8;
    bits.read_ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = bits.read_ue()?;
        if chroma_format_idc == 3 {
            bits.skip(1)?; // separate_colour_plane_flag
        }
        bits.read_ue()?; // bit_depth_luma_minus8
        bits.read_ue()?; // bit_depth_chroma_minus8
        bits.skip(1)?; // qpprime_y_zero_transform_bypass_flag
        if bits.read_flag()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for index in 0..lists {
                if bits.read_flag()? {
                    skip_scaling_list(&mut bits, if index < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    bits.read_ue()?; // log2_max_frame_num_minus4
    match bits.read_ue()? {
        0 => {
            bits.read_ue()?;
        }
        1 => {
            bits.skip(1)?;
            bits.read_se()?;
            bits.read_se()?;
            let cycle = bits.read_ue()?;
            for _ in 0..cycle {
                bits.read_se()?;
            }
        }
        _ => {}
    }
    bits.read_ue()?; // max_num_ref_frames
    bits.skip(1)?; // gaps_in_frame_num_value_allowed_flag

    let width_mbs = bits.read_ue()?.checked_add(1)?;
    let height_map_units = bits.read_ue()?.checked_add(1)?;
    let frame_mbs_only = bits.read_flag()?;
    if !frame_mbs_only {
        bits.skip(1)?; // mb_adaptive_frame_field_flag
    }
    bits.skip(1)?; // direct_8x8_inference_flag

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if bits.read_flag()? {
        crop_left = bits.read_ue()?;
        crop_right = bits.read_ue()?;
        crop_top = bits.read_ue()?;
        crop_bottom = bits.read_ue()?;
    }

    let field_factor = if frame_mbs_only { 1 } else { 2 };
    let width = width_mbs.checked_mul(16)?;
    let height = height_map_units.checked_mul(16 * field_factor)?;
    let (crop_unit_x, crop_unit_y) = match chroma_format_idc {
        0 | 3 => (1, field_factor),
        2 => (2, field_factor),
        _ => (2, 2 * field_factor),
    };

    Some(SpsInfo {
        profile_idc,
        constraint_flags,
        level_idc,
        width: width.saturating_sub(crop_left.saturating_add(crop_right).saturating_mul(crop_unit_x)),
        height: height.saturating_sub(crop_top.saturating_add(crop_bottom).saturating_mul(crop_unit_y)),
    })
}

fn skip_scaling_list(bits: &mut BitReader<'_>, size: usize) -> Option<()> {
    let mut last_scale = 8i64;
    let mut next_scale = 8i64;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = i64::from(bits.read_se()?);
            next_scale = (last_scale + delta + 256).rem_euclid(256);
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Some(())
}

/// Drops the `03` in every `00 00 03` sequence.
pub fn strip_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_flag(&mut self) -> Option<bool> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Some(bit == 1)
    }

    fn read_bits(&mut self, count: u32) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | u32::from(self.read_flag()?);
        }
        Some(value)
    }

    fn skip(&mut self, count: usize) -> Option<()> {
        if self.pos + count > self.data.len() * 8 {
            return None;
        }
        self.pos += count;
        Some(())
    }

    fn read_ue(&mut self) -> Option<u32> {
        let mut leading_zeros = 0u32;
        while !self.read_flag()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return None;
            }
        }
        let suffix = self.read_bits(leading_zeros)?;
        Some(((1u64 << leading_zeros) - 1 + u64::from(suffix)) as u32)
    }

    fn read_se(&mut self) -> Option<i32> {
        let code = i64::from(self.read_ue()?);
        let magnitude = (code + 1) / 2;
        let value = if code % 2 == 0 { -magnitude } else { magnitude };
        i32::try_from(value).ok()
    }
}
