// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use darling::FromMeta;
use darling::ast::NestedMeta;
use proc_macro2::TokenStream;
use quote::quote;
use syn::{ItemFn, Path, parse_quote, parse2};

use crate::syn_helpers::bail;

#[derive(Debug, FromMeta)]
struct Args {
    /// Path to the runtime crate (for situations where it is reexported or aliased).
    /// Default `None` means `::apartment_rt`.
    /// Example: `::reexporting_crate::apartment_rt`
    runtime_path: Option<Path>,
}

#[expect(
    clippy::needless_pass_by_value,
    reason = "Convention for syn-based code"
)]
pub fn common_codegen(
    args: TokenStream,
    item: TokenStream,
    test: bool,
    default_runtime_path: Path,
) -> TokenStream {
    let mut input: ItemFn = match parse2(item.clone()) {
        Ok(v) => v,
        Err(e) => {
            return e.to_compile_error();
        }
    };

    let mut attrs = input.attrs;
    let vis = &input.vis;
    let sig = &mut input.sig;
    let body = &input.block;

    let arg_list = match NestedMeta::parse_meta_list(args.clone()) {
        Ok(v) => v,
        Err(e) => {
            return darling::Error::from(e).write_errors();
        }
    };

    let macro_args = match Args::from_list(&arg_list) {
        Ok(v) => v,
        Err(e) => {
            return e.write_errors();
        }
    };

    let runtime_path = macro_args.runtime_path.unwrap_or(default_runtime_path);

    if sig.asyncness.is_some() {
        bail!(
            item,
            sig.fn_token,
            "function must not be async: the apartment runtime schedules work cooperatively, it does not poll futures"
        );
    }

    let mut inputs = sig.inputs.iter();
    let Some(syn::FnArg::Typed(apartment_arg)) = inputs.next() else {
        bail!(item, sig.fn_token, "function must take an Apartment argument");
    };
    if inputs.next().is_some() {
        bail!(item, &sig.inputs, "function must take exactly one argument");
    }

    let syn::Pat::Ident(apartment_ident) = apartment_arg.pat.as_ref() else {
        bail!(item, &apartment_arg.pat, "argument must have an identifier");
    };
    let apartment_ty = &apartment_arg.ty;

    if test {
        attrs.push(parse_quote!(#[::core::prelude::v1::test]));
    }

    let apartment_name = if test { "test" } else { "main" };
    let thread_count = quote! {
        ::std::thread::available_parallelism()
            .map(::std::num::NonZeroUsize::get)
            .unwrap_or(1)
    };

    sig.inputs.clear();

    quote! {
        #(#attrs)*
        #vis #sig {
            let #apartment_ident: #apartment_ty =
                #runtime_path::apartment::spawn_mta(#apartment_name, #thread_count);
            #apartment_ident.start();
            let __apartment_rt_result = (move || #body)();
            #apartment_ident.async_stop();
            #apartment_ident.wait();
            __apartment_rt_result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syn_helpers::contains_compile_error;

    fn assert_codegen_pass(input: TokenStream, args: TokenStream) {
        for test in [true, false] {
            let output = common_codegen(args.clone(), input.clone(), test, parse_quote!(::apartment_rt));
            assert!(
                !contains_compile_error(&output),
                "Failed for test = {test:?} \n \n {output}"
            );
        }
    }

    #[test]
    fn smoke_test() {
        let input = quote! {
            fn my_test(apartment: Apartment) {
                println!("Hello, world!");
            }
        };
        assert_codegen_pass(input, TokenStream::new());
    }

    #[test]
    fn smoke_test_result() {
        let input = quote! {
            fn my_test(apartment: Apartment) -> AsyncResult<()> {
                Ok(())
            }
        };
        assert_codegen_pass(input, TokenStream::new());
    }

    #[test]
    fn rejects_async_functions() {
        let input = quote! {
            async fn my_test(apartment: Apartment) {}
        };
        let output = common_codegen(TokenStream::new(), input, false, parse_quote!(::apartment_rt));
        assert!(contains_compile_error(&output));
    }

    #[test]
    fn rejects_extra_arguments() {
        let input = quote! {
            fn my_test(apartment: Apartment, extra: u32) {}
        };
        let output = common_codegen(TokenStream::new(), input, false, parse_quote!(::apartment_rt));
        assert!(contains_compile_error(&output));
    }

    #[test]
    fn honors_runtime_path_override() {
        let input = quote! {
            fn my_test(apartment: Apartment) {}
        };
        let args = parse_quote!(runtime_path = ::reexported::apartment_rt);
        assert_codegen_pass(input, args);
    }
}
