// Timing and burst metadata exchanged with the application.

/// A point in device time: whole seconds plus a fractional part in `[0, 1)`.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct TimeSpec {
    pub full_secs: i64,
    pub frac_secs: f64,
}

impl TimeSpec {
    pub fn new(full_secs: i64, frac_secs: f64) -> Self {
        let carry = frac_secs.floor();
        Self {
            full_secs: full_secs + carry as i64,
            frac_secs: frac_secs - carry,
        }
    }

    pub fn from_secs(secs: f64) -> Self {
        Self::new(0, secs)
    }

    /// Convert a tick count at `tick_rate` back into a time spec.
    pub fn from_ticks(ticks: i64, tick_rate: f64) -> Self {
        let rate_i = tick_rate as i64;
        if rate_i <= 0 || (tick_rate - rate_i as f64) != 0.0 {
            return Self::from_secs(ticks as f64 / tick_rate);
        }
        let full = ticks.div_euclid(rate_i);
        let rem = ticks.rem_euclid(rate_i);
        Self::new(full, rem as f64 / tick_rate)
    }

    /// Ticks at `tick_rate`, rounded to nearest.
    ///
    /// The whole-second part is scaled by the integer rate separately so
    /// large absolute times keep sub-tick precision.
    pub fn to_ticks(&self, tick_rate: f64) -> i64 {
        let rate_i = tick_rate as i64;
        let rate_f = tick_rate - rate_i as f64;
        let ticks_full = self.full_secs * rate_i;
        let ticks_error = self.full_secs as f64 * rate_f;
        let ticks_frac = self.frac_secs * tick_rate;
        ticks_full + (ticks_error + ticks_frac).round() as i64
    }

    pub fn real_secs(&self) -> f64 {
        self.full_secs as f64 + self.frac_secs
    }
}

impl std::ops::Add for TimeSpec {
    type Output = TimeSpec;

    fn add(self, rhs: TimeSpec) -> TimeSpec {
        TimeSpec::new(self.full_secs + rhs.full_secs, self.frac_secs + rhs.frac_secs)
    }
}

/// Per-call transmit metadata.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct TxMetadata {
    pub start_of_burst: bool,
    pub end_of_burst: bool,
    pub has_time_spec: bool,
    pub time_spec: TimeSpec,
}

impl TxMetadata {
    /// Metadata for a burst starting at `time`.
    pub fn burst_at(time: TimeSpec) -> Self {
        Self {
            start_of_burst: true,
            end_of_burst: false,
            has_time_spec: true,
            time_spec: time,
        }
    }

    /// Metadata closing the current burst.
    pub fn end_of_burst() -> Self {
        Self {
            end_of_burst: true,
            ..Self::default()
        }
    }
}

/// Event reported by the device on the asynchronous feedback path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AsyncEventCode {
    BurstAck,
    Underflow,
    SeqError,
    TimeError,
    UnderflowInPacket,
    SeqErrorInBurst,
    UserPayload,
}

/// Asynchronous feedback message for one channel.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AsyncMetadata {
    pub channel: usize,
    pub has_time_spec: bool,
    pub time_spec: TimeSpec,
    pub event_code: AsyncEventCode,
    pub user_payload: [u32; 4],
}
