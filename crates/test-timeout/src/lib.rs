use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Attribute, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Options accepted by `#[tokio_timeout_test(...)]`.
///
/// `#[tokio_timeout_test]`, `#[tokio_timeout_test(10)]`,
/// `#[tokio_timeout_test(paused)]` and `#[tokio_timeout_test(10, paused)]`
/// are all valid. `paused` starts the runtime with tokio's clock frozen so
/// timers auto-advance once every task is idle; the timeout is then measured
/// on the wall clock only.
struct TestOptions {
    timeout_secs: u64,
    paused: bool,
}

enum TestOption {
    Seconds(LitInt),
    Flag(Ident),
}

impl Parse for TestOption {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            Ok(TestOption::Seconds(input.parse()?))
        } else {
            Ok(TestOption::Flag(input.parse()?))
        }
    }
}

impl Parse for TestOptions {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut options = TestOptions {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        let parsed: Punctuated<TestOption, Token![,]> = Punctuated::parse_terminated(input)?;
        for option in parsed {
            match option {
                TestOption::Seconds(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(
                            lit,
                            "timeout must be greater than zero",
                        ));
                    }
                    options.timeout_secs = secs;
                }
                TestOption::Flag(ident) if ident == "paused" => options.paused = true,
                TestOption::Flag(ident) => {
                    return Err(syn::Error::new_spanned(
                        &ident,
                        format!("unknown tokio_timeout_test option `{ident}`"),
                    ));
                }
            }
        }
        Ok(options)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = parse_macro_input!(attr as TestOptions);

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

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = options.timeout_secs;
    // A paused clock auto-advances, so only the wall-clock guard below applies.
    let (pause_clock, body) = if options.paused {
        (
            quote! { builder.start_paused(true); },
            quote! { async move #block.await; },
        )
    } else {
        (
            quote! {},
            quote! {
                tokio::time::timeout(timeout_duration, async move #block)
                    .await
                    .expect("test timed out");
            },
        )
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut builder = tokio::runtime::Builder::new_current_thread();
                    builder.enable_all();
                    #pause_clock
                    let runtime = builder.build().expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        #body
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
