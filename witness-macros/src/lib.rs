
use proc_macro::TokenStream;

/// Attributes:
/// * start_paused: runs on a current-thread runtime with tokio's clock paused, so backoff sleeps resolve instantly
#[proc_macro_attribute]
pub fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    test::test_macro(args.into(), item.into()).into()
}
