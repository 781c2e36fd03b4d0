//! Admission-controlled report generation.
//!
//! A request to turn a short business idea into a long multi-section report
//! is gated behind a prepaid credit balance, executed asynchronously by a
//! job orchestrator, fanned out into parallel section-generation tasks, and
//! later made queryable through a content-addressed retrieval index built
//! over the job's output artifacts.

pub mod app;
pub mod config;
pub mod constants;
pub mod error;
pub mod index;
pub mod paths;
pub mod services;

pub use app::App;
pub use error::AppError;
