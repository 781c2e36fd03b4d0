//! Application services: credit ledger, job and report stores, generation
//! clients, the report pipeline, and the orchestrator that ties them
//! together.

pub mod corpus;
pub mod embed;
pub mod generate;
pub mod jobs;
pub mod ledger;
pub mod link_search;
pub mod object_store;
pub mod orchestrator;
pub mod refine;
pub mod report;
pub mod reports;
pub mod sections;

pub use generate::{GenerateClient, GenerateError};
pub use jobs::{AccessLevel, JobState, JobStore, Progress, ReportJob};
pub use ledger::{CreditBucket, CreditLedger};
pub use object_store::{FsObjectStore, ObjectStore};
pub use orchestrator::{JobParams, JobStatus, Orchestrator, StatusError, SubmitError};
pub use refine::{RefineOutcome, RefineService};
pub use reports::{ReportRecord, ReportStore};
