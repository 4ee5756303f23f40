// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Marks a function to be executed by the apartment runtime.
///
/// The function must be synchronous and take a single [`Apartment`][crate::Apartment] argument -
/// a default multi-threaded apartment named `"main"`, already started. The apartment is stopped
/// and waited on after the function returns, so the process does not exit out from under any
/// work it scheduled.
///
/// # Usage
///
/// ```
/// use apartment_rt::{Apartment, main};
///
/// #[main]
/// fn main(apartment: Apartment) {
///     println!("Hello, world!");
/// }
/// ```
#[cfg(feature = "macros")]
pub use apartment_rt_macros::__macro_runtime_main as main;
/// Marks a test function to be executed by the apartment runtime.
/// Usage is similar to [`main`] macro (see above).
#[cfg(feature = "macros")]
pub use apartment_rt_macros::__macro_runtime_test as test;
