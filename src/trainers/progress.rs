//! Step progress on the local main process

#[cfg(feature = "progress-bar")]
use indicatif::{ProgressBar, ProgressStyle};

/// Shows optimizer steps out of the total budget. Hidden on every process but
/// the local main one.
pub struct StepProgress {
    #[cfg(feature = "progress-bar")]
    bar: ProgressBar,
    #[cfg(not(feature = "progress-bar"))]
    visible: bool,
    #[cfg(not(feature = "progress-bar"))]
    total: u64,
}

impl StepProgress {
    #[cfg(feature = "progress-bar")]
    pub fn new(total_steps: usize, position: usize, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(total_steps as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::with_template("Steps {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta}] {msg}") {
            bar.set_style(style);
        }
        bar.set_position(position as u64);
        Self { bar }
    }

    #[cfg(not(feature = "progress-bar"))]
    pub fn new(total_steps: usize, _position: usize, visible: bool) -> Self {
        Self {
            visible,
            total: total_steps as u64,
        }
    }

    #[cfg(feature = "progress-bar")]
    pub fn advance(&self, step: usize) {
        self.bar.set_position(step as u64);
    }

    #[cfg(not(feature = "progress-bar"))]
    pub fn advance(&self, step: usize) {
        if self.visible && (step % 10 == 0 || step as u64 == self.total) {
            log::info!("Steps {}/{}", step, self.total);
        }
    }

    #[cfg(feature = "progress-bar")]
    pub fn set_postfix(&self, loss: f32, lr: f64) {
        self.bar.set_message(format!("loss={:.4} lr={:.2e}", loss, lr));
    }

    #[cfg(not(feature = "progress-bar"))]
    pub fn set_postfix(&self, _loss: f32, _lr: f64) {}

    #[cfg(feature = "progress-bar")]
    pub fn finish(&self) {
        self.bar.finish();
    }

    #[cfg(not(feature = "progress-bar"))]
    pub fn finish(&self) {}
}
