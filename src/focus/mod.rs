//! Autofocus: masked sharpness scoring, coarse-to-fine search, per-object engine.

pub mod engine;
pub mod metric;
pub mod search;

pub use engine::{
    score_object, AutofocusEngine, AutofocusError, AutofocusJob, AutofocusOutcome,
    AutofocusResult, EngineState, ObjectFailure, SecondaryCapture, StartRejected,
};
pub use metric::{MetricWeights, RegionView, SharpnessComponents, SharpnessMetric};
pub use search::{
    search, FnProbe, FocusProbe, FocusSample, SearchError, SearchOutcome, SearchParams,
    SearchPhase,
};
