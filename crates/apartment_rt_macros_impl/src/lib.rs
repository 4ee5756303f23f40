// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! <div class="warning">This crate is a private dependency of <b>apartment_rt</b> crate.</div>

#![doc(hidden)]
#![doc(html_no_source)]

pub mod runtime;
pub mod syn_helpers;
