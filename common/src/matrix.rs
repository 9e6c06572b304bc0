use crate::types::KEYPAD_LAYOUT;

pub const MATRIX_ROWS: usize = KEYPAD_LAYOUT.len();
pub const MATRIX_COLS: usize = KEYPAD_LAYOUT[0].len();
/// Consecutive identical scans before a key counts as pressed.
pub const DEBOUNCE_SCANS: u8 = 3;

pub fn key_at(row: usize, col: usize) -> Option<char> {
    KEYPAD_LAYOUT.get(row)?.get(col).copied()
}

/// Turns raw matrix samples into one press per physical key-down.
///
/// A sample is the single key seen during a scan, or `None` when no key (or
/// more than one) is down. A key fires once it has been seen for
/// [`DEBOUNCE_SCANS`] scans in a row and does not fire again until the matrix
/// has been released.
#[derive(Debug, Default, Clone)]
pub struct KeyDebouncer {
    candidate: Option<char>,
    stable_scans: u8,
    latched: bool,
}

impl KeyDebouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, raw: Option<char>) -> Option<char> {
        if raw != self.candidate {
            self.candidate = raw;
            self.stable_scans = 0;
            self.latched = false;
        }

        let key = self.candidate?;
        if self.latched {
            return None;
        }

        self.stable_scans = self.stable_scans.saturating_add(1);
        if self.stable_scans >= DEBOUNCE_SCANS {
            self.latched = true;
            return Some(key);
        }
        None
    }
}
