// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Extends wrapping 32-bit RTP timestamps into [`Timestamp`]s.

use std::num::NonZeroU32;

use crate::Timestamp;

/// Per-stream RTP timestamp extender.
///
/// The first timestamp seen (or the `rtptime` from `RTP-Info`, if supplied)
/// becomes the stream start. Each later timestamp is interpreted as the
/// nearest wrap of the previous one, so `0x0000_0005` after `0xffff_fff0` is
/// a step forward of 21 ticks.
#[derive(Debug)]
pub struct Timeline {
    latest: i64,
    start: Option<u32>,
    clock_rate: NonZeroU32,

    /// Largest allowed forward step, in ticks. `None` disables the check.
    max_forward_jump: Option<i64>,
}

impl Timeline {
    /// Creates a timeline for a stream with the given clock rate.
    ///
    /// `max_forward_jump_secs` enables enforcement: backward steps and forward
    /// steps of that many seconds or more are errors.
    pub fn new(
        start: Option<u32>,
        clock_rate: u32,
        max_forward_jump_secs: Option<NonZeroU32>,
    ) -> Result<Self, String> {
        let clock_rate =
            NonZeroU32::new(clock_rate).ok_or_else(|| "clock rate must be non-zero".to_owned())?;
        let max_forward_jump = match max_forward_jump_secs {
            None => None,
            Some(secs) => {
                let ticks = u64::from(secs.get()) * u64::from(clock_rate.get());
                if ticks > i32::MAX as u64 {
                    return Err(format!(
                        "clock rate {clock_rate} too high for a {secs}-second jump limit"
                    ));
                }
                Some(ticks as i64)
            }
        };
        Ok(Timeline {
            latest: start.map(i64::from).unwrap_or(0),
            start,
            clock_rate,
            max_forward_jump,
        })
    }

    /// Moves the timeline to `rtp_timestamp` and returns it as a [`Timestamp`].
    pub fn advance_to(&mut self, rtp_timestamp: u32) -> Result<Timestamp, String> {
        let start = *self.start.get_or_insert_with(|| {
            self.latest = i64::from(rtp_timestamp);
            rtp_timestamp
        });
        let delta = i64::from((rtp_timestamp as i32).wrapping_sub(self.latest as i32));
        if let Some(max) = self.max_forward_jump {
            if !(0..max).contains(&delta) {
                return Err(format!(
                    "RTP timestamp jumped {delta} ticks ({:.03} sec) from {} to {rtp_timestamp}; \
                     allowed range is [0, {max}) ticks",
                    delta as f64 / f64::from(self.clock_rate.get()),
                    self.latest as u32,
                ));
            }
        }
        let extended = self
            .latest
            .checked_add(delta)
            .ok_or_else(|| format!("timestamp {} + {delta} overflows", self.latest))?;
        let ts = Timestamp::new(extended, self.clock_rate, start)
            .ok_or_else(|| format!("timestamp {extended} - start {start} underflows"))?;
        self.latest = extended;
        Ok(ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_FORWARD_JUMP_SECS: u32 = 10;

    fn enforced(start: Option<u32>) -> Timeline {
        Timeline::new(start, 90_000, NonZeroU32::new(MAX_FORWARD_JUMP_SECS)).unwrap()
    }

    #[test]
    fn rejects_bad_clock_rates() {
        Timeline::new(None, 0, None).unwrap_err();
        Timeline::new(None, u32::MAX, NonZeroU32::new(MAX_FORWARD_JUMP_SECS)).unwrap_err();
        Timeline::new(None, u32::MAX, None).unwrap();
    }

    #[test]
    fn enforcement() {
        enforced(Some(100)).advance_to(100 + 10 * 90_000).unwrap_err();
        enforced(Some(100)).advance_to(99).unwrap_err();

        let mut t = Timeline::new(Some(100), 90_000, None).unwrap();
        assert_eq!(t.advance_to(99).unwrap().elapsed(), -1);
        assert_eq!(t.advance_to(100 + 10 * 90_000).unwrap().elapsed(), 10 * 90_000);
    }

    #[test]
    fn steady_progress() {
        let mut t = enforced(Some(42));
        assert_eq!(t.advance_to(42).unwrap().elapsed(), 0);
        assert_eq!(t.advance_to(3042).unwrap().elapsed(), 3000);
        let ts = t.advance_to(6042).unwrap();
        assert_eq!(ts.elapsed(), 6000);
        assert_eq!(ts.start(), 42);
        assert_eq!(ts.clock_rate().get(), 90_000);
    }

    #[test]
    fn wraparound() {
        let mut t = enforced(Some(0xffff_fff0));
        let ts = t.advance_to(5).unwrap();
        assert_eq!(ts.elapsed(), 21);
        assert_eq!(ts.timestamp(), 0x1_0000_0005);
    }

    #[test]
    fn start_from_first_packet() {
        let mut t = enforced(None);
        assert_eq!(t.advance_to(218_250_000).unwrap().elapsed(), 0);
        assert_eq!(t.advance_to(218_253_000).unwrap().elapsed(), 3000);
    }
}
