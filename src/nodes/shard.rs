//! Splitting an execution's load across its nodes.
//!
//! Thread count, iteration count and both ramp thread counts are each divided
//! by the node count on their own; the first shard takes the remainder of
//! every one of them. Ramp durations and the run duration apply per node
//! unchanged.

use crate::execution::{RampConfig, ThreadConfig};

/// The share of `config` that one of `node_count` nodes runs.
pub fn shard(config: &ThreadConfig, node_count: u32, first_shard: bool) -> ThreadConfig {
    if node_count <= 1 {
        return *config;
    }

    let split = |value: u32| {
        let base = value / node_count;
        if first_shard {
            base + value % node_count
        } else {
            base
        }
    };

    ThreadConfig {
        thread_count: split(config.thread_count),
        iteration_count: split(config.iteration_count),
        ramp: config.ramp.map(|ramp| RampConfig {
            ramp_up_threads: split(ramp.ramp_up_threads),
            ramp_down_threads: split(ramp.ramp_down_threads),
            ..ramp
        }),
        duration_secs: config.duration_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threads: u32, iterations: u32, ramp: Option<(u32, u32)>) -> ThreadConfig {
        ThreadConfig {
            thread_count: threads,
            iteration_count: iterations,
            ramp: ramp.map(|(up, down)| RampConfig {
                ramp_up_threads: up,
                ramp_down_threads: down,
                ramp_up_secs: 30,
                ramp_down_secs: 15,
            }),
            duration_secs: Some(300),
        }
    }

    fn shards(config: &ThreadConfig, n: u32) -> Vec<ThreadConfig> {
        (0..n).map(|i| shard(config, n, i == 0)).collect()
    }

    #[test]
    fn test_even_split() {
        let parts = shards(&config(10, 100, None), 2);
        assert_eq!(parts[0].thread_count, 5);
        assert_eq!(parts[1].thread_count, 5);
    }

    #[test]
    fn test_first_shard_takes_remainder() {
        let parts = shards(&config(11, 7, Some((5, 3))), 2);
        assert_eq!(parts[0].thread_count, 6);
        assert_eq!(parts[1].thread_count, 5);
        assert_eq!(parts[0].iteration_count, 4);
        assert_eq!(parts[1].iteration_count, 3);

        let (r0, r1) = (parts[0].ramp.unwrap(), parts[1].ramp.unwrap());
        assert_eq!((r0.ramp_up_threads, r1.ramp_up_threads), (3, 2));
        assert_eq!((r0.ramp_down_threads, r1.ramp_down_threads), (2, 1));
        // Periods are not divided.
        assert_eq!(r1.ramp_up_secs, 30);
        assert_eq!(parts[1].duration_secs, Some(300));
    }

    #[test]
    fn test_sum_is_conserved_for_every_quantity() {
        for value in [0u32, 1, 2, 7, 10, 11, 99, 1000, 1001] {
            for n in 1u32..=7 {
                let cfg = config(value, value + 3, Some((value, value / 2)));
                let parts = shards(&cfg, n);

                let threads: u32 = parts.iter().map(|p| p.thread_count).sum();
                let iterations: u32 = parts.iter().map(|p| p.iteration_count).sum();
                let up: u32 = parts.iter().map(|p| p.ramp.unwrap().ramp_up_threads).sum();
                let down: u32 = parts.iter().map(|p| p.ramp.unwrap().ramp_down_threads).sum();
                assert_eq!(threads, cfg.thread_count);
                assert_eq!(iterations, cfg.iteration_count);
                assert_eq!(up, value);
                assert_eq!(down, value / 2);

                assert_eq!(parts[0].thread_count, value / n + value % n);
                for p in &parts[1..] {
                    assert_eq!(p.thread_count, value / n);
                }
            }
        }
    }

    #[test]
    fn test_no_ramp_stays_no_ramp() {
        let parts = shards(&config(9, 9, None), 4);
        assert!(parts.iter().all(|p| p.ramp.is_none()));
    }
}
