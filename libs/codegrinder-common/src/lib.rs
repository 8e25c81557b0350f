pub mod config;
pub mod signing;
pub mod types;

pub use config::Config;
pub use types::{
    ActionConfig, Commit, CommitBundle, DaycareRegistration, EventMessage, ProblemType,
    ReportCard, ReportCardResult, ReportParser, ResultOutcome, Version,
};
