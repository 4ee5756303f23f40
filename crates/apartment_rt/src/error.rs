// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// A specialized `Result` type for synchronous, fallible setup APIs (flow validation, runtime
/// construction, observer registration) that return an [`Error`][enum@Error] on failure.
///
/// This is distinct from [`AsyncResult`][crate::result::AsyncResult], which is the three-state
/// value/error/not-yet-completed outcome that flows through the future graph itself.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in the apartment runtime's synchronous setup surface.
///
/// This is an umbrella type for programming errors caught at registration time - invalid task
/// graphs, duplicate names, or use of an API out of sequence. It never appears inside the future
/// graph; async bodies report failure via [`ErrorCode`][crate::result::ErrorCode] instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller of some API made a mistake (e.g. supplied an invalid task graph or called an
    /// operation out of sequence).
    #[error("{0}")]
    Programming(String),

    /// We are re-packaging an error from the Rust standard library I/O logic
    /// without adding further details in the runtime layer.
    #[error(transparent)]
    StdIo(#[from] std::io::Error),

    /// We are re-packaging an error we obtained from some downstream mechanism
    /// without adding further details in the runtime layer.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}
