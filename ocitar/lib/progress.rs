//! Progress reporting interface consumed by the pull pipeline.
//!
//! The core drives a small callback surface at well-defined points of a
//! layer pull (pulling, downloading, extracting, complete); how those
//! callbacks are rendered is up to the implementation. The CLI uses the
//! terminal implementation unless `--silent` or `--verbose` is given.

use indicatif::{ProgressBar, ProgressStyle};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Callbacks invoked while a layer blob is pulled.
pub trait PullProgress: Send + Sync {
    /// Replaces the short description shown next to the progress state.
    fn update_description(&self, description: &str);

    /// Sets the total number of bytes of the current phase.
    fn set_size(&self, size: u64);

    /// Reports the number of bytes processed so far.
    fn write(&self, done: u64);

    /// Finishes the current phase with a closing message.
    fn flush(&self, message: &str);
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A progress implementation that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyProgressBar;

/// A terminal progress bar rendered with `indicatif`.
#[derive(Debug)]
pub struct TermProgressBar {
    bar: ProgressBar,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TermProgressBar {
    /// Creates a terminal progress bar.
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{prefix:.bold.dim} {bar:40.green/green.dim} {bytes:.bold} / {total_bytes:.dim}",
        )
        .expect("progress template is valid")
        .progress_chars("=+-");
        bar.set_style(style);

        Self { bar }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PullProgress for EmptyProgressBar {
    fn update_description(&self, _description: &str) {}

    fn set_size(&self, _size: u64) {}

    fn write(&self, _done: u64) {}

    fn flush(&self, _message: &str) {}
}

impl PullProgress for TermProgressBar {
    fn update_description(&self, description: &str) {
        self.bar.set_prefix(description.to_string());
    }

    fn set_size(&self, size: u64) {
        self.bar.set_length(size);
    }

    fn write(&self, done: u64) {
        self.bar.set_position(done);
    }

    fn flush(&self, message: &str) {
        self.bar.println(message);
        self.bar.reset();
    }
}

impl Default for TermProgressBar {
    fn default() -> Self {
        Self::new()
    }
}
