// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! <div class="warning">This crate is a private dependency of <b>apartment_rt</b> crate.</div>

#![doc(hidden)]
#![doc(html_no_source)]

use proc_macro::TokenStream;

#[proc_macro_attribute]
pub fn __macro_runtime_main(attr: TokenStream, item: TokenStream) -> TokenStream {
    apartment_rt_macros_impl::runtime::impl_runtime_main(attr.into(), item.into()).into()
}

#[proc_macro_attribute]
pub fn __macro_runtime_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    apartment_rt_macros_impl::runtime::impl_runtime_test(attr.into(), item.into()).into()
}
