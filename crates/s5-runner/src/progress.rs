//! Progress extraction from engine output

/// Returns the last `<digits>.<digits>%` token on the line.
pub fn parse_percent(line: &str) -> Option<f64> {
    let bytes = line.as_bytes();
    let mut found = None;

    for (i, &b) in bytes.iter().enumerate() {
        if b != b'%' {
            continue;
        }
        let mut frac_start = i;
        while frac_start > 0 && bytes[frac_start - 1].is_ascii_digit() {
            frac_start -= 1;
        }
        if frac_start == i || frac_start == 0 || bytes[frac_start - 1] != b'.' {
            continue;
        }
        let dot = frac_start - 1;
        let mut int_start = dot;
        while int_start > 0 && bytes[int_start - 1].is_ascii_digit() {
            int_start -= 1;
        }
        if int_start == dot {
            continue;
        }
        if let Ok(value) = line[int_start..i].parse::<f64>() {
            found = Some(value);
        }
    }

    found
}

/// Monotonic percentage in `[0, 100]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProgressTracker {
    value: f64,
}

impl ProgressTracker {
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Records a reading; returns the new value only when it moved forward.
    pub fn observe(&mut self, percent: f64) -> Option<f64> {
        if !percent.is_finite() {
            return None;
        }
        let clamped = percent.clamp(0.0, 100.0);
        if clamped > self.value {
            self.value = clamped;
            Some(clamped)
        } else {
            None
        }
    }
}
