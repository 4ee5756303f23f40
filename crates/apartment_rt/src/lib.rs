// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A cooperative, non-preemptive async execution runtime.
//!
//! [`apartment`] provides the execution contexts work runs on, [`context`] carries cancellation
//! and ambient priority across hops between them, [`future`] is the composable future/promise
//! graph built on top of both, and [`flow`] is a named-task DAG engine built on top of that.

pub mod apartment;
pub mod context;
mod error;
pub mod flow;
pub mod future;
pub mod notification;
mod pattern;
pub mod result;

pub use error::{Error, Result};

pub use apartment::Apartment;
pub use context::AsyncContext;
pub use flow::Flow;
pub use future::{Future, Promise};
pub use result::{AsyncError, AsyncResult, ErrorCode};

// Not re-exported because the module name is an important identifying factor.
mod non_blocking_thread;

// These are just special.
mod macros;

#[cfg(feature = "macros")]
pub use macros::{main, test};
