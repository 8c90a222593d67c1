use std::fmt::{Display, Formatter};

/// Rational tick duration of a stream, in seconds per tick (`num / den`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Timebase {
    num: i32,
    den: i32,
}

/// One tick per millisecond.
pub const MILLIS: Timebase = Timebase::new(1, 1000);

impl Timebase {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn num(&self) -> i32 {
        self.num
    }

    pub fn den(&self) -> i32 {
        self.den
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn to_millis(&self, ts: i64) -> i64 {
        rescale(ts, *self, MILLIS)
    }

    pub fn as_secs_f64(&self, ts: i64) -> f64 {
        ts as f64 * self.num as f64 / self.den as f64
    }
}

impl Display for Timebase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Rescales `value` from `from` ticks to `to` ticks, rounding to nearest with ties away
/// from zero. Exact: the product is carried in 128 bits, so repeated calls never drift.
/// Results outside the `i64` range saturate.
pub fn rescale(value: i64, from: Timebase, to: Timebase) -> i64 {
    let num = value as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    if den == 0 {
        return value;
    }
    let q = div_round(num, den);
    q.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

pub fn rescale_opt(value: Option<i64>, from: Timebase, to: Timebase) -> Option<i64> {
    value.map(|v| rescale(v, from, to))
}

fn div_round(num: i128, den: i128) -> i128 {
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    if num >= 0 {
        (2 * num + den) / (2 * den)
    } else {
        -((-2 * num + den) / (2 * den))
    }
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Rational> for Timebase {
    fn from(value: ffmpeg_next::Rational) -> Self {
        Self::new(value.numerator(), value.denominator())
    }
}

#[cfg(feature = "ffmpeg")]
impl From<Timebase> for ffmpeg_next::Rational {
    fn from(value: Timebase) -> Self {
        ffmpeg_next::Rational::new(value.num, value.den)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_video_to_mpegts_clock() {
        let from = Timebase::new(1, 30);
        let to = Timebase::new(1, 90000);
        assert_eq!(rescale(0, from, to), 0);
        assert_eq!(rescale(1, from, to), 3000);
        assert_eq!(rescale(299, from, to), 897000);
    }

    #[test]
    fn test_rescale_rounds_to_nearest() {
        // 1/48000 -> 1/1000: 1024 samples = 21.333 ms
        let from = Timebase::new(1, 48000);
        assert_eq!(rescale(1024, from, MILLIS), 21);
        // 1.5 rounds away from zero
        assert_eq!(rescale(3, Timebase::new(1, 2), Timebase::new(1, 1)), 2);
        assert_eq!(rescale(-3, Timebase::new(1, 2), Timebase::new(1, 1)), -2);
        assert_eq!(rescale(1, Timebase::new(1, 3), Timebase::new(1, 1)), 0);
        assert_eq!(rescale(2, Timebase::new(1, 3), Timebase::new(1, 1)), 1);
    }

    #[test]
    fn test_rescale_does_not_drift() {
        // Accumulating per-packet rescales of 1/30 into 1/1000 would drift with floats;
        // rescaling the absolute pts never does.
        let from = Timebase::new(1, 30);
        for pts in 0..10_000_i64 {
            let expected = (pts * 1000 * 2 + 30) / 60;
            assert_eq!(rescale(pts, from, MILLIS), expected, "pts {}", pts);
        }
    }

    #[test]
    fn test_rescale_large_values_saturate() {
        let v = rescale(i64::MAX, Timebase::new(1, 1), Timebase::new(1, 90000));
        assert_eq!(v, i64::MAX);
    }

    #[test]
    fn test_timebase_helpers() {
        let tb = Timebase::new(1, 48000);
        assert!(tb.is_valid());
        assert!(!Timebase::new(0, 1).is_valid());
        assert_eq!(tb.to_millis(48000), 1000);
        assert_eq!(tb.to_string(), "1/48000");
        assert!((tb.as_secs_f64(24000) - 0.5).abs() < f64::EPSILON);
        assert_eq!(rescale_opt(None, tb, MILLIS), None);
    }
}
