// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Attribute macro backing `test_with_tracing::test`.

use quote::quote;
use syn::Error;
use syn::ItemFn;
use syn::parse_macro_input;
use syn::spanned::Spanned;

/// Marks a test whose `tracing` output should be captured.
///
/// Behaves like `#[test]`, but installs the test subscriber first. An
/// `async fn` body is driven to completion with `futures::executor::block_on`.
#[proc_macro_attribute]
pub fn test(
    _attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let item = parse_macro_input!(item as ItemFn);
    make_test(item)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn make_test(item: ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    if !item.sig.inputs.is_empty() {
        return Err(Error::new(item.sig.inputs.span(), "expected 0 arguments"));
    }

    let name = &item.sig.ident;
    let return_type = &item.sig.output;
    let attrs = &item.attrs;
    let call = if item.sig.asyncness.is_some() {
        quote!(::test_with_tracing::block_on(#name()))
    } else {
        quote!(#name())
    };

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        fn #name() #return_type {
            #item
            ::test_with_tracing::init();
            #call
        }
    })
}
