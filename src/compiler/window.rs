//! Pagination and ordering parameters.
//!
//! The api has no offset, only `page`/`per_page`. A window `[low, high)` is
//! mapped onto a page size dividing both bounds, so the window starts on an
//! exact page boundary. The greatest common divisor gives the largest such
//! size, keeping the number of requests minimal.

use crate::{
    error::RestError,
    query::{OrderBy, Query},
};

use super::{alias::AliasResolver, predicate::Params};

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while a % b != 0 {
        (a, b) = (b, a % b);
    }
    b
}

/// The resolved pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub page: u64,
    pub per_page: u64,
}

/// map a `[low, high)` row window onto page parameters.
///
/// `None` means the query is unbounded and pagination is driven purely by
/// the response metadata. How far past the first page fetching may go is
/// decided later against the page size the server actually applied.
pub fn build_window(low_mark: u64, high_mark: Option<u64>) -> Option<Window> {
    let high = high_mark?;
    if low_mark == 0 {
        return Some(Window {
            page: 1,
            per_page: high,
        });
    }
    let per_page = gcd(high, low_mark);
    Some(Window {
        page: low_mark / per_page + 1,
        per_page,
    })
}

pub fn write_window_params(window: &Window, params: &mut Params) {
    // the first page is implicit
    if window.page > 1 {
        params.insert("page".to_owned(), vec![window.page.to_string()]);
    }
    params.insert("per_page".to_owned(), vec![window.per_page.to_string()]);
}

/// compile the ordering into `sort[]` values, most significant first.
pub fn build_sort_params(
    resolver: &AliasResolver<'_>,
    order_by: &[OrderBy],
    params: &mut Params,
) -> Result<(), RestError> {
    if order_by.is_empty() {
        return Ok(());
    }
    let mut sorts = Vec::with_capacity(order_by.len());
    for order in order_by {
        let path = resolver.rest_path(&order.column)?;
        sorts.push(if order.descending {
            format!("-{}", path)
        } else {
            path
        });
    }
    params.insert("sort[]".to_owned(), sorts);
    Ok(())
}

/// true when the query window is empty and no request should be made.
pub fn window_is_empty(query: &Query) -> bool {
    match query.high_mark {
        Some(high) => high <= query.low_mark,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_offset_is_a_single_page() {
        let window = build_window(0, Some(10)).unwrap();
        assert_eq!(window.page, 1);
        assert_eq!(window.per_page, 10);
    }

    #[test]
    fn offset_window_starts_on_a_page_boundary() {
        // rows [10, 30) with gcd 10: pages 2 and 3 of size 10
        let window = build_window(10, Some(30)).unwrap();
        assert_eq!(window.per_page, 10);
        assert_eq!(window.page, 2);
    }

    #[test]
    fn coprime_bounds_degrade_to_single_rows() {
        let window = build_window(7, Some(10)).unwrap();
        assert_eq!(window.per_page, 1);
        assert_eq!(window.page, 8);
    }

    #[test]
    fn unbounded_query_has_no_window() {
        assert_eq!(build_window(0, None), None);
    }
}
