// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use proc_macro2::TokenStream;
use syn::parse_quote;

use super::entrypoint_common::common_codegen;

#[must_use]
pub fn impl_runtime_main(args: TokenStream, item: TokenStream) -> TokenStream {
    common_codegen(args, item, false, parse_quote!(::apartment_rt))
}
