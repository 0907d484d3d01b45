//! Page-window arithmetic shared by the room-list and message-retrieve
//! endpoints. A negative page index counts from the end of the list; results
//! are emitted newest first by the callers.

/// Clamp `(page_index, page_size)` to a `[start, end)` window over a list of
/// `total` items.
pub fn page_range(total: usize, page_index: i64, page_size: i64) -> (usize, usize) {
    let total = total as i64;
    let mut start = if page_index >= 0 {
        page_index.saturating_mul(page_size)
    } else {
        total.saturating_add(page_index.saturating_mul(page_size))
    };
    let mut end = start.saturating_add(page_size);
    if start < 0 {
        start = 0;
    }
    if end > total {
        end = total;
    }
    if start > end {
        return (0, 0);
    }
    (start as usize, end as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_pages_clamp_to_total() {
        assert_eq!(page_range(5, 0, 3), (0, 3));
        assert_eq!(page_range(5, 1, 3), (3, 5));
        assert_eq!(page_range(5, 2, 3), (0, 0));
    }

    #[test]
    fn negative_index_counts_from_the_end() {
        assert_eq!(page_range(5, -1, 3), (2, 5));
        assert_eq!(page_range(5, -2, 3), (0, 2));
        assert_eq!(page_range(5, -3, 3), (0, 0));
    }

    #[test]
    fn empty_and_degenerate_inputs() {
        assert_eq!(page_range(0, 0, 10), (0, 0));
        assert_eq!(page_range(5, 0, 0), (0, 0));
        assert_eq!(page_range(5, i64::MAX, i64::MAX), (0, 0));
    }
}
