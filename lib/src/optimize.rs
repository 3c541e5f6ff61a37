//! The pixel optimization loop.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use log::{debug, info};
use ndarray::Array4;

use crate::{
    adam::Adam,
    loss::{LossRecord, LossWeights},
    model::TruncatedModel,
    Error,
};

/// Why the loop stopped
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The whole iteration budget was spent
    Completed,
    /// The cancel flag was raised
    Cancelled,
    /// The time limit ran out
    TimedOut,
}

#[derive(Clone, Debug)]
pub struct OptimizeParams {
    pub iterations: u32,
    pub weights: LossWeights,
    pub learning_rate: f32,
    /// Losses are logged every this many iterations
    pub log_interval: u32,
    pub time_limit: Option<Duration>,
}

impl Default for OptimizeParams {
    fn default() -> Self {
        Self {
            iterations: 50000,
            weights: LossWeights::default(),
            learning_rate: 1e-4,
            log_interval: 10000,
            time_limit: None,
        }
    }
}

/// What a finished loop reports besides the image itself
#[derive(Clone, Debug)]
pub struct Outcome {
    pub stop_reason: StopReason,
    /// The number of optimizer steps applied to the image
    pub iterations: u32,
    /// The losses of the last evaluated forward pass, empty if no step ran
    pub final_losses: LossRecord,
}

/// Helper struct for passing progress information to external callers
pub struct ProgressStat {
    /// The current amount of work that has been done
    pub current: usize,
    /// The total amount of work to do
    pub total: usize,
}

/// The state of the image after an optimizer step
pub struct ProgressUpdate<'a> {
    /// The image after the step, not yet clamped
    pub image: &'a Array4<f32>,
    /// The iterations done so far out of the budget
    pub iterations: ProgressStat,
    /// The losses the step was computed from
    pub losses: &'a LossRecord,
    /// The weighted sum of `losses`
    pub total_loss: f32,
}

/// Allows the optimizer to update external callers with the current
/// progress of the transfer
pub trait GeneratorProgress {
    fn update(&mut self, info: ProgressUpdate<'_>);
}

impl<G> GeneratorProgress for G
where
    G: FnMut(ProgressUpdate<'_>) + Send,
{
    fn update(&mut self, info: ProgressUpdate<'_>) {
        self(info)
    }
}

/// Forces every pixel into `[0, 1]`.
pub fn clamp(image: &mut Array4<f32>) {
    image.mapv_inplace(|v| v.max(0.0).min(1.0));
}

/// Optimizes the pixels of `image` so the weighted losses of `model` go down.
///
/// The image is clamped before every forward pass and once more before
/// returning, also when the loop stops early because `cancel` was raised or
/// the time limit ran out. A non finite loss aborts the run.
pub fn optimize(
    model: &TruncatedModel,
    image: &mut Array4<f32>,
    params: &OptimizeParams,
    mut progress: Option<&mut dyn GeneratorProgress>,
    cancel: Option<&AtomicBool>,
) -> Result<Outcome, Error> {
    let weights = params.weights;
    let log_interval = params.log_interval.max(1);
    let dims = image.dim();
    let mut adam = Adam::new([dims.0, dims.1, dims.2, dims.3], params.learning_rate);

    let started = Instant::now();
    let mut stop_reason = StopReason::Completed;
    let mut final_losses = LossRecord::default();
    let mut run = 0;

    while run < params.iterations {
        if cancel.map_or(false, |c| c.load(Ordering::Relaxed)) {
            stop_reason = StopReason::Cancelled;
            break;
        }

        if let Some(limit) = params.time_limit {
            if started.elapsed() >= limit {
                stop_reason = StopReason::TimedOut;
                break;
            }
        }

        clamp(image);

        let (losses, grad) = model.gradient(image, weights)?;
        let total_loss = losses.weighted_total(weights);

        if !losses.is_finite() || !total_loss.is_finite() {
            return Err(Error::NonFiniteLoss { iteration: run + 1 });
        }

        adam.step(image, &grad)?;
        run += 1;

        if run % log_interval == 0 {
            info!(
                "run {}: style loss {:.4} content loss {:.4}",
                run,
                weights.style * losses.style_total(),
                weights.content * losses.content_total()
            );
        }

        if let Some(progress) = progress.as_mut() {
            progress.update(ProgressUpdate {
                image,
                iterations: ProgressStat {
                    current: run as usize,
                    total: params.iterations as usize,
                },
                losses: &losses,
                total_loss,
            });
        }

        final_losses = losses;
    }

    clamp(image);

    debug!(
        "optimization stopped after {} iteration(s) in {:?}: {:?}",
        run,
        started.elapsed(),
        stop_reason
    );

    Ok(Outcome {
        stop_reason,
        iterations: run,
        final_losses,
    })
}
