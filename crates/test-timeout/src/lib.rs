//! `#[tokio_timeout_test]` runs an async test on its own Tokio runtime and
//! fails it when it has not finished within a deadline.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(secs = 10, workers = 2)]
//! async fn proxy_round_trip() { /* ... */ }
//! ```
//!
//! `secs` defaults to 30 and `workers` to 1 (a current-thread runtime).
//! The runtime lives on a separate thread so a wedged runtime still fails
//! the test instead of hanging the harness.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

struct TestArgs {
    secs: u64,
    workers: usize,
}

impl Default for TestArgs {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            workers: 1,
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = TestArgs::default();
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("secs") {
            let lit: LitInt = meta.value()?.parse()?;
            args.secs = lit.base10_parse()?;
            if args.secs == 0 {
                return Err(meta.error("secs must be greater than zero"));
            }
            Ok(())
        } else if meta.path.is_ident("workers") {
            let lit: LitInt = meta.value()?.parse()?;
            args.workers = lit.base10_parse()?;
            if args.workers == 0 {
                return Err(meta.error("workers must be greater than zero"));
            }
            Ok(())
        } else {
            Err(meta.error("expected `secs = N` or `workers = N`"))
        }
    });
    parse_macro_input!(attr with parser);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let secs = args.secs;
    let runtime = if args.workers == 1 {
        quote! { tokio::runtime::Builder::new_current_thread() }
    } else {
        let workers = args.workers;
        quote! {
            {
                let mut builder = tokio::runtime::Builder::new_multi_thread();
                builder.worker_threads(#workers);
                builder
            }
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #runtime
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime for test");
                    runtime.block_on(async move #block);
                }));
                let _ = sender.send(outcome);
            });
            match receiver.recv_timeout(deadline) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test did not finish within {} seconds", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` would register the function twice.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
