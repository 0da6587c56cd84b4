/// Render a human-friendly transfer speed string.
#[must_use]
pub fn format_speed(bytes_per_sec: f32) -> String {
    const KIB: f32 = 1024.0;
    const MIB: f32 = KIB * 1024.0;

    if bytes_per_sec < KIB {
        format!("{bytes_per_sec:.0} B/s")
    } else if bytes_per_sec < MIB {
        format!("{:.1} KB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / MIB)
    }
}

/// Compute transfer progress as a fraction in `[0.0, 1.0]`.
///
/// Returns `None` when the total is unknown so callers never report made-up progress.
#[must_use]
pub fn progress_fraction(done: u64, total: Option<u64>) -> Option<f32> {
    match total {
        Some(total) if total > 0 => Some((done as f32 / total as f32).clamp(0.0, 1.0)),
        _ => None,
    }
}

/// Forwards progress values to a sink only when they move forward.
pub struct MonotonicProgress<'a> {
    sink: &'a mut (dyn FnMut(f32) + Send),
    last: Option<f32>,
}

impl<'a> MonotonicProgress<'a> {
    pub fn new(sink: &'a mut (dyn FnMut(f32) + Send)) -> Self {
        Self { sink, last: None }
    }

    /// Emit `value` if it is strictly greater than the last emitted value.
    pub fn report(&mut self, value: f32) {
        let value = value.clamp(0.0, 1.0);
        if self.last.is_none_or(|last| value > last) {
            self.last = Some(value);
            (self.sink)(value);
        }
    }

    pub fn last(&self) -> Option<f32> {
        self.last
    }
}
