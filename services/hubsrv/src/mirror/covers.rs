//! Cover timing encoding
//!
//! A cover runs in one of two directions (outputs A and B); only one of them
//! carries a travel time, the polarity bit says which. Times up to 255 s are
//! squeezed into one byte with an interpolation factor chosen by magnitude.

use errors::HubResult;
use serde::{Deserialize, Serialize};
use tracing::error;

use super::layout::{MirrorIndex, COVER_COUNT};

/// Travel and blade times of one cover, in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverTimes {
    pub t_a: u16,
    pub t_b: u16,
    pub blade_a: u8,
    pub blade_b: u8,
}

impl CoverTimes {
    /// Positive polarity: direction A carries the time
    pub fn positive(&self) -> bool {
        self.t_b == 0
    }
}

/// Raw mirror representation of one cover time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverEncoding {
    pub raw: u8,
    pub interp: u8,
    pub positive: bool,
}

/// Interpolation factor for a travel time
pub fn interpolation_factor(t: u16) -> u8 {
    match t {
        0..=24 => 1,
        25..=50 => 2,
        51..=126 => 5,
        _ => 10,
    }
}

/// Encode a cover's two direction times
///
/// Exactly one direction may carry a time. Anything else is logged and
/// `t_b` is dropped so the cover keeps working with `t_a`.
pub fn encode_cover_settings(module: u8, t_a: u16, mut t_b: u16) -> HubResult<CoverEncoding> {
    let pos_polarity = t_b == 0;
    let neg_polarity = t_a == 0;
    if !(pos_polarity || neg_polarity) {
        error!(
            "Error with cover times in module {}, one value must be zero!",
            module
        );
        t_b = 0;
    }
    let t_cover = t_a + t_b;
    if t_cover > 255 {
        return Err(errors::range_error!(
            "Error: cover time {} out of range 0..255",
            t_cover
        ));
    }
    let interp = interpolation_factor(t_cover);
    let raw = (f64::from(t_cover) * 10.0 / f64::from(interp)).round() as u8;
    Ok(CoverEncoding {
        raw,
        interp,
        positive: t_b == 0,
    })
}

/// Travel time in seconds from its raw byte and factor
pub fn decode_cover_time(raw: u8, interp: u8) -> u16 {
    (f64::from(raw) * f64::from(interp) / 10.0).round() as u16
}

fn polarity_mask(status: &[u8]) -> u16 {
    u16::from_le_bytes([
        status[MirrorIndex::COVER_POL],
        status[MirrorIndex::COVER_POL + 1],
    ])
}

/// Decode all covers from a full mirror
pub fn read_covers(status: &[u8]) -> [CoverTimes; COVER_COUNT] {
    let mask = polarity_mask(status);
    let mut covers = [CoverTimes::default(); COVER_COUNT];
    for (ci, cover) in covers.iter_mut().enumerate() {
        let t = decode_cover_time(
            status[MirrorIndex::COVER_T + ci],
            status[MirrorIndex::COVER_INTERP + ci],
        );
        let blade = status[MirrorIndex::BLAD_T + ci];
        *cover = if mask & (1 << (2 * ci)) != 0 {
            CoverTimes {
                t_a: t,
                blade_a: blade,
                ..Default::default()
            }
        } else {
            CoverTimes {
                t_b: t,
                blade_b: blade,
                ..Default::default()
            }
        };
    }
    covers
}

/// Write all covers into a full mirror in place
pub fn write_covers(module: u8, status: &mut [u8], covers: &[CoverTimes; COVER_COUNT]) -> HubResult<()> {
    let mut mask = polarity_mask(status);
    for (ci, cover) in covers.iter().enumerate() {
        let enc = encode_cover_settings(module, cover.t_a, cover.t_b)?;
        status[MirrorIndex::COVER_T + ci] = enc.raw;
        status[MirrorIndex::COVER_INTERP + ci] = enc.interp;
        let bit = 1u16 << (2 * ci);
        if enc.positive {
            mask |= bit;
            status[MirrorIndex::BLAD_T + ci] = cover.blade_a;
        } else {
            mask &= !bit;
            status[MirrorIndex::BLAD_T + ci] = cover.blade_b;
        }
    }
    status[MirrorIndex::COVER_POL..MirrorIndex::COVER_POL + 2].copy_from_slice(&mask.to_le_bytes());
    Ok(())
}

/// Per-direction time table used for the settings CRC
///
/// 8 cover pairs followed by 8 blade pairs, each `(a, b)` with the unused
/// direction zero. Times above 255 s cannot occur after decoding.
pub fn cover_time_table(status: &[u8]) -> Vec<u8> {
    let covers = read_covers(status);
    let mut cover_part = Vec::with_capacity(2 * COVER_COUNT);
    let mut blade_part = Vec::with_capacity(2 * COVER_COUNT);
    for cover in &covers {
        cover_part.extend_from_slice(&[cover.t_a.min(255) as u8, cover.t_b.min(255) as u8]);
        blade_part.extend_from_slice(&[cover.blade_a, cover.blade_b]);
    }
    cover_part.extend(blade_part);
    cover_part
}
