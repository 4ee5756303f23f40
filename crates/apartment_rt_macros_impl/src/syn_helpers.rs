// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This module contains helper functions for consuming and producing Rust syntax elements.

use proc_macro2::TokenStream;
use quote::quote;
use syn::spanned::Spanned;
use syn::{GenericArgument, PathArguments, Type};

/// Combines a token stream with a syn-originating contextual error message that contains
/// all the necessary metadata to emit rich errors (with red underlines and all that).
///
/// Also preserves the original token stream, merely appending the error instead of replacing.
#[must_use]
#[expect(
    clippy::needless_pass_by_value,
    reason = "Convention for syn-based code"
)]
pub fn token_stream_and_error(s: TokenStream, e: syn::Error) -> TokenStream {
    let error = e.to_compile_error();

    // We preserve both the original input and emit the compiler error message.
    // This ensures that we do not cause extra problems by removing the original input
    // from the code file (which would result in "trait not found" and similar errors).
    quote! {
        #s
        #error
    }
}

/// Return compiler error with a message at the specified span.
/// Use this macro to return a compiler error from a function that returns `TokenStream`.
/// If there is an input token stream that you want to return as is
/// (for example, when mutating existing code by attribute macro), add it as a first macro argument.
///
/// ## Examples
/// ```ignore
/// # use proc_macro2::TokenStream;
/// use syn::Stmt;
/// # use oxidizer_macros_impl::bail;
///
/// fn example() -> proc_macro2::TokenStream {
///     let span: Stmt = syn::parse_quote! { let x = 5; };
///     bail!(span, "This is a test error message.");
/// }
///
/// fn example2() -> proc_macro2::TokenStream {
///     let input_code = TokenStream::new();
///     let span: Stmt = syn::parse_quote! { let x = 5; };
///     bail!(input_code, span, "This is a test error message.");
///  }
///
/// # let result = example();
/// # let result = example2();
/// ```
///
macro_rules! bail {
    ($input:expr_2021, $span:expr_2021, $msg:expr_2021) => {{
        let error = ::syn::Error::new_spanned($span, $msg).to_compile_error();
        let input = $input;
        return ::quote::quote! {
            #input
            #error
        };
    }};
    ($span:expr_2021, $msg:expr_2021) => {{
        bail! { ::proc_macro2::TokenStream::new(), $span, $msg }
    }};
}
pub(crate) use bail;

/// Attempts to identify any compile-time error in the token stream. This is useful for unit
/// testing macros - if the macro is expected to produce a compile-time error, we can check
/// whether one exists.
///
/// We deliberately do not take an error message as input here. Testing for error messages is
/// fragile and creates maintenance headaches - be satisfied with OK/NOK testing and keep it simple.
#[cfg(test)]
#[must_use]
pub fn contains_compile_error(tokens: &TokenStream) -> bool {
    // String-based implementation, so vulnerable to false positives in very unlikely cases.
    tokens.to_string().contains(":: core :: compile_error ! {")
}

pub fn extract_inner_generic_type(type_path: &Type) -> Result<&Type, syn::Error> {
    if let Type::Path(type_path) = type_path {
        let path = &type_path.path;

        // We expect to have either Option<T> or Vec<T> or equivalent.
        if path.segments.len() != 1 {
            return Err(syn::Error::new(
                path.span(),
                "expected a single segment in the type path - multi::level::type::names are not supported",
            ));
        }

        let first_segment = path
            .segments
            .first()
            .expect("we already verified there is at least one segment");

        // Retrieve the generic argument (T).
        if let PathArguments::AngleBracketed(params) = &first_segment.arguments {
            if params.args.len() != 1 {
                return Err(syn::Error::new(
                    params.span(),
                    "expected a single generic argument in the type path",
                ));
            }

            if let Some(GenericArgument::Type(ty)) = params.args.first() {
                return Ok(ty);
            }
        }
    }

    Err(syn::Error::new(
        type_path.span(),
        "expected a type path with a single generic argument like Option<T> or Vec<T>",
    ))
}
