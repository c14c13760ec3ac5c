pub mod combiner;
pub mod ensemble;
pub mod estimator;
pub mod preprocess;
pub mod sampler;

pub use combiner::{group_live_events, ForecastCombiner, LiveEvent, Opportunity, Slate};
pub use ensemble::{CombinedForecast, PosteriorEnsemble, TimeInterpolatedEnsemble, WeightTrajectory};
pub use estimator::WeightEstimator;
pub use preprocess::{LeadTimeWindow, ObservationPreprocessor, TrainingSet};
pub use sampler::SamplerSettings;
