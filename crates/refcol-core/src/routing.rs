//! Routing helpers for namespaced symbols.
//!
//! Backends are registered under a logical name, and a fully-qualified
//! symbol such as `orders.v1.Order` is owned by the backend named `orders`
//! when the symbol starts with the name followed by `.`. These helpers
//! centralise the prefix logic so every call site behaves identically.

/// Separator between a backend name and the rest of a symbol
pub const NAMESPACE_SEPARATOR: char = '.';

/// Returns true when `symbol` lives in the namespace of `backend`.
///
/// ```
/// # use refcol_core::routing::owns_symbol;
/// assert!(owns_symbol("orders", "orders.v1.Order"));
/// assert!(!owns_symbol("orders", "ordersx.Order"));
/// assert!(!owns_symbol("orders", "orders"));
/// ```
pub fn owns_symbol(backend: &str, symbol: &str) -> bool {
    symbol
        .strip_prefix(backend)
        .is_some_and(|rest| rest.starts_with(NAMESPACE_SEPARATOR))
}

/// Names (from `names`) that own `symbol`, preserving input order.
///
/// An empty result means no backend claims the namespace and every
/// backend is a candidate.
pub fn symbol_owners<'a, I>(names: I, symbol: &str) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .filter(|name| owns_symbol(name, symbol))
        .collect()
}
