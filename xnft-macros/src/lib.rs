
use proc_macro::TokenStream;

/// Runs an async test against a freshly started simulated network, once for each RNG seed.
///
/// The test function must take a single `Network` argument. Seeds are read from `XNFT_TEST_RNG_SEED` (one seed) or
/// `XNFT_TEST_SAMPLES` (seeds `0..n`, default 1).
#[proc_macro_attribute]
pub fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    test::test_macro(args.into(), item.into()).into()
}
