pub mod config;
pub mod dataset;
pub mod error;
pub mod fairness;
pub mod math;
pub mod network;
pub mod optim;
#[cfg(feature = "plot")]
pub mod plot;
pub mod serialization;
pub mod stats;
pub mod synthetic;
pub mod training;

pub use config::TrainingConfig;
pub use dataset::{Dataset, Standardizer};
pub use error::{Error, Result};
pub use fairness::FairnessReport;
pub use training::{run_train, FairClassifier, TrainOutcome};
