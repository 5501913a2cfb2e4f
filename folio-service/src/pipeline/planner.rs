//! Chunk planning: order-preserving partition of a page range.

use crate::error::{ServiceError, ServiceResult};

use super::types::{Chunk, PageRange};

/// Partition pages `1..=total_pages` into consecutive windows of `chunk_size`.
///
/// A signed page count is accepted so that a negative count coming from a
/// reader is reported as a planning error rather than wrapping.
pub fn plan(total_pages: i64, chunk_size: usize) -> ServiceResult<Vec<Chunk>> {
    if total_pages < 0 {
        return Err(ServiceError::Planning {
            message: format!("page count must not be negative, got {}", total_pages),
        });
    }
    let last = u32::try_from(total_pages).map_err(|_| ServiceError::Planning {
        message: format!("page count {} is out of range", total_pages),
    })?;

    plan_range(&PageRange::inclusive(1, last), chunk_size)
}

/// Partition an arbitrary ordered page range into windows of `chunk_size`.
///
/// Pages are not checked against the document; the reader drops indices it
/// does not have.
pub fn plan_range(pages: &PageRange, chunk_size: usize) -> ServiceResult<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(ServiceError::Planning {
            message: "chunk size must be at least 1".to_string(),
        });
    }

    Ok(pages
        .as_slice()
        .chunks(chunk_size)
        .map(|window| Chunk::new(window.to_vec()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pages_of(chunks: &[Chunk]) -> Vec<Vec<u32>> {
        chunks.iter().map(|c| c.pages.as_slice().to_vec()).collect()
    }

    #[test]
    fn test_five_pages_in_pairs() {
        let chunks = plan(5, 2).unwrap();
        assert_eq!(pages_of(&chunks), vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn test_zero_pages_is_empty_plan() {
        assert!(plan(0, 2).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            plan(-1, 2),
            Err(ServiceError::Planning { .. })
        ));
        assert!(matches!(plan(3, 0), Err(ServiceError::Planning { .. })));
    }

    #[test]
    fn test_non_contiguous_range_keeps_order() {
        let chunks = plan_range(&PageRange::from(vec![3, 5, 9, 10, 42]), 2).unwrap();
        assert_eq!(pages_of(&chunks), vec![vec![3, 5], vec![9, 10], vec![42]]);
    }

    #[test]
    fn test_planner_does_not_clamp() {
        let chunks = plan_range(&PageRange::from(vec![1, 500]), 1).unwrap();
        assert_eq!(chunks[1].key(), 500);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn test_plan_partitions_every_page_once(
            total in 0i64..300,
            chunk_size in 1usize..40
        ) {
            let chunks = plan(total, chunk_size).unwrap();

            let flattened: Vec<u32> = chunks.iter().flat_map(|c| c.pages.iter()).collect();
            let expected: Vec<u32> = (1..=total as u32).collect();
            prop_assert_eq!(flattened, expected);

            for chunk in &chunks {
                prop_assert!(chunk.pages.first().is_some());
                prop_assert!(chunk.pages.len() <= chunk_size);
            }
            for pair in chunks.windows(2) {
                prop_assert!(pair[0].key() < pair[1].key());
            }
            // Only the last chunk may be short
            for chunk in chunks.iter().rev().skip(1) {
                prop_assert_eq!(chunk.pages.len(), chunk_size);
            }
        }

        #[test]
        fn test_plan_is_deterministic(total in 0i64..200, chunk_size in 1usize..20) {
            prop_assert_eq!(plan(total, chunk_size).unwrap(), plan(total, chunk_size).unwrap());
        }
    }
}
