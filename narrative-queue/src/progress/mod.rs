//! Pipeline progress: weighted two-phase completion per SKU.

pub mod tracker;
pub mod weights;

pub use tracker::{GraphStepUpdate, ProgressTracker};
pub use weights::{ProgressWeights, StepWeight};
