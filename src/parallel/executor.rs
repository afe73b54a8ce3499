//! Fork/join over leaves
//!
//! Uses Rayon for work-stealing parallelism with configurable limits.

use crate::error::{Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Configuration for parallel execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Maximum number of worker threads (default: num_cpus)
    pub max_parallelism: usize,
    /// Minimum number of leaves handed to one worker at a time
    pub grain_size: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_parallelism: num_cpus::get(),
            grain_size: 1,
        }
    }
}

/// Apply `mapper` to every item on a dedicated pool, failing on the first error
///
/// Results keep the order of `items`. Every item is processed by exactly one
/// worker, so items may carry exclusive borrows of disjoint data.
pub fn parallel_map<T, R, F>(items: Vec<T>, mapper: F, config: &ParallelConfig) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R> + Send + Sync,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }

    // Single item - no parallelism needed
    if items.len() == 1 || config.max_parallelism <= 1 {
        return items.into_iter().map(mapper).collect();
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.max_parallelism.min(items.len()))
        .build()
        .map_err(|e| Error::execution(format!("failed to create thread pool: {}", e)))?;

    let grain = config.grain_size.max(1);
    pool.install(|| {
        items
            .into_par_iter()
            .with_min_len(grain)
            .map(&mapper)
            .collect::<Result<Vec<R>>>()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_map_basic() {
        let results = parallel_map(vec![1, 2, 3], |v| Ok(v * 2), &ParallelConfig::default()).unwrap();
        assert_eq!(results, vec![2, 4, 6]);
    }

    #[test]
    fn test_parallel_map_empty() {
        let results: Vec<i32> =
            parallel_map(Vec::<i32>::new(), Ok, &ParallelConfig::default()).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_parallel_map_mutable_items() {
        let mut data = vec![vec![1], vec![2], vec![3], vec![4]];
        let items: Vec<&mut Vec<i32>> = data.iter_mut().collect();
        let config = ParallelConfig {
            max_parallelism: 4,
            grain_size: 2,
        };
        parallel_map(
            items,
            |v| {
                v.push(0);
                Ok(())
            },
            &config,
        )
        .unwrap();
        assert!(data.iter().all(|v| v.len() == 2));
    }

    #[test]
    fn test_parallel_map_error_fail_fast() {
        let result = parallel_map(
            vec![1, -1, 3],
            |v| {
                if v < 0 {
                    Err(Error::execution("negative"))
                } else {
                    Ok(v)
                }
            },
            &ParallelConfig::default(),
        );
        assert!(result.is_err());
    }
}
