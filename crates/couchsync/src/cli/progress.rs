//! Terminal progress indicator using OSC 9;4 escape sequences.
//!
//! Terminals without support ignore the sequences.

use std::io::{self, Write};

/// Progress bar state values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressState {
    Hidden = 0,
    Error = 2,
    Indeterminate = 3,
}

fn set_progress(state: ProgressState) {
    // OSC 9;4 sequence: ESC ] 9 ; 4 ; <state> BEL
    let seq = format!("\x1b]9;4;{}\x07", state as u8);
    let _ = io::stderr().write_all(seq.as_bytes());
    let _ = io::stderr().flush();
}

/// Show a spinner while a replication runs.
pub fn show_running() {
    set_progress(ProgressState::Indeterminate);
}

/// Mark the indicator as failed.
pub fn show_error() {
    set_progress(ProgressState::Error);
}

/// Clear the indicator.
pub fn hide() {
    set_progress(ProgressState::Hidden);
}
