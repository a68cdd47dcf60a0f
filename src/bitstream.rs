// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bit-level and exponential-Golomb reading for H.264/H.265 RBSP syntax,
//! plus emulation-prevention byte handling.
//!
//! Built atop `bitreader::BitReader`, which gives us arbitrary-width
//! unsigned reads; exponential-Golomb codes (`ue(v)`/`se(v)` in the H.264/
//! H.265 spec text) are implemented on top of that primitive since no crate
//! in our dependency graph provides them directly.

use bitreader::BitReader;

/// Removes emulation-prevention bytes (every `0x03` that immediately
/// follows `0x00 0x00` within a NAL unit payload), yielding the raw RBSP
/// bitstream that SPS/PPS/SEI parsing operates on.
///
/// NAL unit header bytes should already be stripped before calling this;
/// it operates purely on the payload.
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zero_run = 0u32;
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if zero_run >= 2 && b == 0x03 {
            // Drop the emulation-prevention byte; don't count it toward
            // a following zero run (the standard guarantees it's non-zero
            // lookahead already, but reset defensively).
            zero_run = 0;
            i += 1;
            continue;
        }
        out.push(b);
        if b == 0 {
            zero_run += 1;
        } else {
            zero_run = 0;
        }
        i += 1;
    }
    out
}

/// A bit cursor over RBSP bytes with exponential-Golomb helpers layered on
/// top of [`bitreader::BitReader`].
pub struct RbspReader<'a> {
    r: BitReader<'a>,
}

/// Errors surfaced while parsing H.264/H.265 RBSP syntax: truncation or a
/// Golomb code whose leading-zero run exceeds what fits in a `u32`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BitstreamError {
    #[error("unexpected end of bitstream")]
    Eof,
    #[error("exponential-Golomb code too long")]
    GolombOverflow,
}

impl From<bitreader::BitReaderError> for BitstreamError {
    fn from(_: bitreader::BitReaderError) -> Self {
        BitstreamError::Eof
    }
}

impl<'a> RbspReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            r: BitReader::new(data),
        }
    }

    pub fn read_bit(&mut self) -> Result<bool, BitstreamError> {
        Ok(self.r.read_bool()?)
    }

    pub fn read_bits(&mut self, n: u8) -> Result<u32, BitstreamError> {
        Ok(self.r.read_u32(n)?)
    }

    pub fn read_u8(&mut self, n: u8) -> Result<u8, BitstreamError> {
        Ok(self.r.read_u8(n)?)
    }

    /// `ue(v)`: unsigned exponential-Golomb.
    pub fn read_ue(&mut self) -> Result<u32, BitstreamError> {
        let mut leading_zeros = 0u32;
        while !self.r.read_bool()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(BitstreamError::GolombOverflow);
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let suffix = self.r.read_u32(leading_zeros as u8)?;
        Ok((1u32 << leading_zeros) - 1 + suffix)
    }

    /// `se(v)`: signed exponential-Golomb, mapped from the unsigned code
    /// per the standard's `(-1)^(k+1) * ceil(k/2)` convention.
    pub fn read_se(&mut self) -> Result<i32, BitstreamError> {
        let ue = self.read_ue()?;
        let k = ue as i64;
        let v = if k % 2 == 0 { -(k / 2) } else { (k + 1) / 2 };
        Ok(v as i32)
    }

    /// Skips `n` bits without interpreting them.
    pub fn skip_bits(&mut self, n: u32) -> Result<(), BitstreamError> {
        let mut remaining = n;
        while remaining > 32 {
            self.r.read_u32(32)?;
            remaining -= 32;
        }
        if remaining > 0 {
            self.r.read_u32(remaining as u8)?;
        }
        Ok(())
    }

    /// Skips a single `ue(v)` code without retaining its value.
    pub fn skip_ue(&mut self) -> Result<(), BitstreamError> {
        self.read_ue().map(|_| ())
    }

    pub fn skip_se(&mut self) -> Result<(), BitstreamError> {
        self.read_se().map(|_| ())
    }

    /// True if there's more RBSP data before the trailing
    /// `rbsp_stop_one_bit` and padding, per the `more_rbsp_data()` pseudo
    /// syntax function used throughout the spec text.
    pub fn more_rbsp_data(&self) -> bool {
        // Conservative: treat "more than one bit remains" as more data.
        // The final stop bit plus zero padding is at most one partial byte.
        self.r.remaining() > 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulation_prevention_strips_only_guarded_threes() {
        let input = [0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x02, 0x00, 0x00, 0x01];
        let out = remove_emulation_prevention(&input);
        assert_eq!(out, vec![0x00, 0x00, 0x01, 0x00, 0x00, 0x02, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn emulation_prevention_leaves_unrelated_threes_alone() {
        let input = [0x01, 0x03, 0x02];
        assert_eq!(remove_emulation_prevention(&input), vec![0x01, 0x03, 0x02]);
    }

    #[test]
    fn golomb_round_trip_small_values() {
        // ue(v) codes for 0, 1, 2, 3 are 1, 010, 011, 00100 respectively.
        let bits = [0b1_010_011, 0b00100_000];
        let mut r = RbspReader::new(&bits);
        assert_eq!(r.read_ue().unwrap(), 0);
        assert_eq!(r.read_ue().unwrap(), 1);
        assert_eq!(r.read_ue().unwrap(), 2);
        assert_eq!(r.read_ue().unwrap(), 3);
    }

    #[test]
    fn signed_golomb_mapping() {
        // ue=0 -> se=0, ue=1 -> se=1, ue=2 -> se=-1, ue=3 -> se=2, ue=4 -> se=-2
        let bits = [0b1_010_011, 0b00100_00100, 0b0_0000_0000];
        let mut r = RbspReader::new(&bits);
        assert_eq!(r.read_se().unwrap(), 0);
        assert_eq!(r.read_se().unwrap(), 1);
        assert_eq!(r.read_se().unwrap(), -1);
        assert_eq!(r.read_se().unwrap(), 2);
    }
}
