//! External tool abstractions
//!
//! Trait-based abstractions for subprocess execution and the git CLI,
//! enabling testable code through dependency injection and mock
//! implementations. Pure decision logic lives in `refinery`; everything
//! that touches a process boundary goes through here.

pub mod command;
pub mod git;

pub use command::{CommandError, CommandExecutor, CommandOutput, ProcessCommandExecutor};
pub use git::{BranchName, CommitSha, GitAdapter, GitError};
