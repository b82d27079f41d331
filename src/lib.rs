//! Core grading engine for a competitive-programming judge.
//!
//! Given a contestant submission and a content-addressed problem
//! archive, the engine compiles the submission, executes it against
//! every test case inside an external sandbox, validates the outputs
//! under the problem's comparison policy, and aggregates exact-rational
//! scores by case group.

pub mod archive;
pub mod checker;
pub mod config;
pub mod grader;
pub mod input;
pub mod languages;
pub mod layout;
pub mod sandbox;
pub mod settings;
pub mod verdict;
