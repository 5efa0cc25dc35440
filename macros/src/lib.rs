use proc_macro::TokenStream;
use syn_utils::into_macro_output;

#[macro_use]
mod syn_utils;

mod timeout_impl;

/// Fails a test function that runs longer than the given duration.
///
/// Works on both synchronous and asynchronous functions. A synchronous body runs on its own
/// thread so that a deadlocked store cannot hang the test binary.
///
/// # Arguments
///
/// Any expression implementing
/// [`IntoTimeoutDuration`](statetree::utils::timer::IntoTimeoutDuration), or a string
/// literal with one of the following suffixes, which is checked at compile time.
///
/// | Suffix | Equivalent to                      |
/// |--------|----------------------------------- |
/// | `ms`   | `Duration::from_millis(n)`         |
/// | `s`    | `Duration::from_secs(n)`           |
/// | `m`    | `Duration::from_secs(n * 60)`      |
///
/// # Behavior
///
/// - If the function returns `Result<T, E>`, a timeout returns `Err` with
///   [`TimeoutError`](statetree::utils::timer::TimeoutError) converted via `Into::into`.
/// - Otherwise a timeout panics.
///
/// # Examples
///
/// ```ignore
/// #[test]
/// #[timeout("1s")]
/// fn flushes_after_poll_interval() {
///     // ...
/// }
/// ```
#[proc_macro_attribute]
pub fn timeout(attr: proc_macro::TokenStream, item: proc_macro::TokenStream) -> TokenStream {
    into_macro_output(timeout_impl::timeout(attr.into(), item.into()))
}
