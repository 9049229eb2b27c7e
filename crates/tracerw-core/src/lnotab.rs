//! Line-table codec: `(offset-delta, line-delta)` byte pairs.
//!
//! Each pair advances the byte offset, then the line. A pair with a non-zero
//! offset-delta closes the current line run; decoding reports a
//! [`LineStart`] whenever a run closes on a new line, plus the final open run.
//! An empty table therefore decodes to a single start at `(0, first_line)`.
//!
//! Encoding is canonical: a transition `(d_off, d_line)` becomes
//! `(255, 0)*` offset chunks, a last offset chunk that carries the first line
//! chunk, then `(0, k)*` line chunks. No other pair sequence with the same
//! decoding is shorter, and `encode(decode(blob))` reproduces any canonical
//! blob byte for byte.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult};

const MAX_OFFSET_DELTA: u32 = 255;

/// Absolute position where a new source line begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LineStart {
    /// Byte offset of the first instruction of the run.
    pub offset: u32,
    /// Source line of the run.
    pub line: u32,
}

impl LineStart {
    /// Builds a line start.
    pub const fn new(offset: u32, line: u32) -> Self { Self { offset, line } }
}

/// Move from one line start to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Transition {
    /// Bytes between the previous start and this one.
    pub offset_delta: u32,
    /// Line change (may be negative).
    pub line_delta: i64,
}

impl Transition {
    /// Builds a transition.
    pub const fn new(offset_delta: u32, line_delta: i64) -> Self { Self { offset_delta, line_delta } }
}

/// How the line byte of a pair is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum SignConvention {
    /// Two's complement byte, −128..=127.
    #[default]
    Signed,
    /// Plain byte, 0..=255; lines may only move forward.
    Unsigned,
}

impl SignConvention {
    const fn bounds(self) -> (i64, i64) {
        match self {
            SignConvention::Signed => (-128, 127),
            SignConvention::Unsigned => (0, 255),
        }
    }

    const fn read(self, b: u8) -> i64 {
        match self {
            SignConvention::Signed => b as i8 as i64,
            SignConvention::Unsigned => b as i64,
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    const fn write(self, v: i64) -> u8 {
        match self {
            SignConvention::Signed => v as i8 as u8,
            SignConvention::Unsigned => v as u8,
        }
    }
}

/// Stateless encoder/decoder for one sign convention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineTableCodec {
    /// Interpretation of line bytes.
    pub sign: SignConvention,
}

impl LineTableCodec {
    /// Codec for `sign`.
    pub const fn new(sign: SignConvention) -> Self { Self { sign } }

    /// Decodes a table into absolute line starts relative to `first_line`.
    pub fn decode(&self, blob: &[u8], first_line: u32) -> CoreResult<Vec<LineStart>> {
        self.decode_relative(blob)?
            .into_iter()
            .map(|(offset, rel)| {
                let line = i64::from(first_line) + rel;
                u32::try_from(line)
                    .map(|line| LineStart { offset, line })
                    .map_err(|_| CoreError::line_table(format!("line {line} at offset {offset} out of range")))
            })
            .collect()
    }

    /// Encodes absolute line starts. Consecutive starts on the same line are
    /// merged; offsets must begin at 0 and strictly increase.
    pub fn encode(&self, starts: &[LineStart], first_line: u32) -> CoreResult<Vec<u8>> {
        self.encode_transitions(&transitions(starts, first_line)?)
    }

    /// Encodes raw transitions with the canonical split.
    pub fn encode_transitions(&self, transitions: &[Transition]) -> CoreResult<Vec<u8>> {
        let mut out = Vec::with_capacity(transitions.len() * 2);
        for t in transitions {
            self.push_transition(&mut out, *t)?;
        }
        Ok(out)
    }

    /// Decodes a table into transitions (line deltas relative to the table start).
    pub fn decode_transitions(&self, blob: &[u8]) -> CoreResult<Vec<Transition>> {
        let mut prev = (0u32, 0i64);
        let mut out = Vec::new();
        for (offset, line) in self.decode_relative(blob)? {
            let t = Transition::new(offset - prev.0, line - prev.1);
            if t != Transition::new(0, 0) {
                out.push(t);
            }
            prev = (offset, line);
        }
        Ok(out)
    }

    fn decode_relative(&self, blob: &[u8]) -> CoreResult<Vec<(u32, i64)>> {
        if blob.len() % 2 != 0 {
            return Err(CoreError::line_table(format!("odd table length {}", blob.len())));
        }
        let mut out = Vec::with_capacity(blob.len() / 2 + 1);
        let mut last: Option<i64> = None;
        let mut line = 0i64;
        let mut addr = 0u32;
        for pair in blob.chunks_exact(2) {
            let (b, d) = (pair[0], pair[1]);
            if b != 0 {
                if last != Some(line) {
                    out.push((addr, line));
                    last = Some(line);
                }
                addr = addr
                    .checked_add(u32::from(b))
                    .ok_or_else(|| CoreError::line_table("offset exceeds u32"))?;
            }
            line += self.sign.read(d);
        }
        if last != Some(line) {
            out.push((addr, line));
        }
        Ok(out)
    }

    fn push_transition(&self, out: &mut Vec<u8>, t: Transition) -> CoreResult<()> {
        let (lo, hi) = self.sign.bounds();
        if t.line_delta < lo && self.sign == SignConvention::Unsigned {
            return Err(CoreError::overflow(format!(
                "negative line delta {} with unsigned line bytes",
                t.line_delta
            )));
        }

        let mut off = t.offset_delta;
        while off > MAX_OFFSET_DELTA {
            out.extend_from_slice(&[u8::MAX, 0]);
            off -= MAX_OFFSET_DELTA;
        }

        let mut line = t.line_delta;
        let first = line.clamp(lo, hi);
        if off > 0 || first != 0 {
            #[allow(clippy::cast_possible_truncation)]
            out.extend_from_slice(&[off as u8, self.sign.write(first)]);
        }
        line -= first;
        while line != 0 {
            let chunk = line.clamp(lo, hi);
            out.extend_from_slice(&[0, self.sign.write(chunk)]);
            line -= chunk;
        }
        Ok(())
    }
}

/// Converts absolute starts into transitions from `(0, first_line)`.
pub fn transitions(starts: &[LineStart], first_line: u32) -> CoreResult<Vec<Transition>> {
    let Some(head) = starts.first() else { return Ok(Vec::new()) };
    if head.offset != 0 {
        return Err(CoreError::line_table(format!("first line start at offset {}, expected 0", head.offset)));
    }
    let mut out = Vec::with_capacity(starts.len());
    let mut anchor = LineStart::new(0, first_line);
    let mut seen: Option<u32> = None;
    for s in starts {
        if let Some(prev) = seen {
            if s.offset <= prev {
                return Err(CoreError::line_table(format!("offset {} after {prev} does not increase", s.offset)));
            }
        }
        seen = Some(s.offset);
        if s.line == anchor.line {
            continue;
        }
        out.push(Transition::new(s.offset - anchor.offset, i64::from(s.line) - i64::from(anchor.line)));
        anchor = *s;
    }
    Ok(out)
}

/// Rebuilds absolute starts from transitions taken from `(0, first_line)`.
pub fn from_transitions(transitions: &[Transition], first_line: u32) -> CoreResult<Vec<LineStart>> {
    let mut offset = 0u32;
    let mut line = i64::from(first_line);
    let mut out: Vec<LineStart> = Vec::with_capacity(transitions.len() + 1);
    for t in transitions {
        offset = offset
            .checked_add(t.offset_delta)
            .ok_or_else(|| CoreError::overflow("offset exceeds u32"))?;
        line += t.line_delta;
        let line = u32::try_from(line).map_err(|_| CoreError::overflow(format!("line {line} out of range")))?;
        match out.last_mut() {
            Some(last) if last.offset == offset => last.line = line,
            _ => out.push(LineStart::new(offset, line)),
        }
    }
    if out.first().map_or(true, |s| s.offset != 0) {
        out.insert(0, LineStart::new(0, first_line));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn starts(v: &[(u32, u32)]) -> Vec<LineStart> { v.iter().map(|&(o, l)| LineStart::new(o, l)).collect() }

    #[test]
    fn small_table_roundtrips() -> CoreResult<()> {
        let codec = LineTableCodec::default();
        let s = starts(&[(0, 2), (4, 3), (10, 4)]);
        let blob = codec.encode(&s, 1)?;
        assert_eq!(blob, vec![0, 1, 4, 1, 6, 1]);
        assert_eq!(codec.decode(&blob, 1)?, s);
        Ok(())
    }

    #[test]
    fn empty_table_decodes_to_first_line() -> CoreResult<()> {
        let codec = LineTableCodec::default();
        assert_eq!(codec.decode(&[], 7)?, starts(&[(0, 7)]));
        assert_eq!(codec.encode(&starts(&[(0, 7)]), 7)?, Vec::<u8>::new());
        Ok(())
    }

    #[test]
    fn long_offset_is_split_before_line_change() -> CoreResult<()> {
        let codec = LineTableCodec::default();
        let s = starts(&[(0, 1), (600, 2)]);
        let blob = codec.encode(&s, 1)?;
        assert_eq!(blob, vec![255, 0, 255, 0, 90, 1]);
        assert_eq!(codec.decode(&blob, 1)?, s);
        Ok(())
    }

    #[test]
    fn long_line_jump_is_split_after_offset() -> CoreResult<()> {
        let codec = LineTableCodec::default();
        let s = starts(&[(0, 1), (3, 300), (5, 10)]);
        let blob = codec.encode(&s, 1)?;
        // +299 = 127 + 127 + 45 ; −290 = −128 − 128 − 34
        assert_eq!(blob, vec![3, 127, 0, 127, 0, 45, 2, 0x80, 0, 0x80, 0, (-34i8) as u8]);
        assert_eq!(codec.decode(&blob, 1)?, s);
        Ok(())
    }

    #[test]
    fn negative_delta_overflows_unsigned_tables() {
        let codec = LineTableCodec::new(SignConvention::Unsigned);
        let err = codec.encode(&starts(&[(0, 5), (2, 4)]), 5).unwrap_err();
        assert!(err.is_overflow());
    }

    #[test]
    fn unsigned_tables_use_full_byte() -> CoreResult<()> {
        let codec = LineTableCodec::new(SignConvention::Unsigned);
        let s = starts(&[(0, 1), (2, 201)]);
        let blob = codec.encode(&s, 1)?;
        assert_eq!(blob, vec![2, 200]);
        assert_eq!(codec.decode(&blob, 1)?, s);
        Ok(())
    }

    #[test]
    fn same_line_runs_are_merged() -> CoreResult<()> {
        let codec = LineTableCodec::default();
        let blob = codec.encode(&starts(&[(0, 3), (4, 3), (8, 4)]), 3)?;
        assert_eq!(codec.decode(&blob, 3)?, starts(&[(0, 3), (8, 4)]));
        Ok(())
    }

    #[test]
    fn non_monotonic_offsets_are_rejected() {
        let codec = LineTableCodec::default();
        assert!(codec.encode(&starts(&[(0, 1), (8, 2), (4, 3)]), 1).is_err());
        assert!(codec.encode(&starts(&[(2, 1)]), 1).is_err());
    }

    #[test]
    fn odd_blob_is_malformed() {
        let err = LineTableCodec::default().decode(&[1, 2, 3], 1).unwrap_err();
        assert!(matches!(err, CoreError::LineTable(_)));
    }

    #[test]
    fn line_below_zero_is_malformed() {
        let err = LineTableCodec::default().decode(&[0, 0xFE, 2, 0], 1).unwrap_err();
        assert!(matches!(err, CoreError::LineTable(_)));
    }

    #[test]
    fn transitions_helpers_agree() -> CoreResult<()> {
        let s = starts(&[(0, 4), (6, 2), (9, 40)]);
        let ts = transitions(&s, 1)?;
        assert_eq!(ts, vec![Transition::new(0, 3), Transition::new(6, -2), Transition::new(3, 38)]);
        assert_eq!(from_transitions(&ts, 1)?, s);
        Ok(())
    }

    fn valid_starts() -> impl Strategy<Value = (u32, Vec<LineStart>)> {
        (1u32..2_000, prop::collection::vec((1u32..700, -400i64..400), 0..40)).prop_map(|(first, steps)| {
            let mut out = vec![LineStart::new(0, first)];
            let (mut off, mut line) = (0u32, i64::from(first));
            for (d_off, d_line) in steps {
                let next = (line + d_line).max(0);
                if next == line {
                    continue;
                }
                off += d_off;
                line = next;
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                out.push(LineStart::new(off, line as u32));
            }
            (first, out)
        })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode((first, s) in valid_starts()) {
            let codec = LineTableCodec::default();
            let blob = codec.encode(&s, first).unwrap();
            prop_assert_eq!(codec.decode(&blob, first).unwrap(), s.clone());
            prop_assert_eq!(codec.encode(&codec.decode(&blob, first).unwrap(), first).unwrap(), blob);
        }

        #[test]
        fn transitions_survive_the_codec((first, s) in valid_starts()) {
            let codec = LineTableCodec::default();
            let ts = transitions(&s, first).unwrap();
            let blob = codec.encode_transitions(&ts).unwrap();
            prop_assert_eq!(codec.decode_transitions(&blob).unwrap(), ts);
        }
    }
}
