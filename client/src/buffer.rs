use crate::player::BufferedRange;

/// A span the player should drop, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Eviction {
    pub start: f64,
    pub end: f64,
}

/// Pick at most one span to evict from `ranges`, which must be sorted.
///
/// Nothing is evicted while the total buffered duration fits `max_buffer`.
/// Above it, candidates are taken in order: a whole range entirely behind
/// the retention window, a whole range entirely past the look-ahead window,
/// then a trim of whichever range straddles a window edge. A final fallback
/// trims the earliest range up to `current_time - back_buffer` when even
/// in-window media overflows the budget. No branch removes media between
/// `current_time - back_buffer` and `current_time + fetch_ahead`.
pub fn plan(
    ranges: &[BufferedRange],
    current_time: f64,
    back_buffer: f64,
    fetch_ahead: f64,
    max_buffer: f64,
) -> Option<Eviction> {
    let total: f64 = ranges.iter().map(BufferedRange::duration).sum();
    if total <= max_buffer || ranges.is_empty() {
        return None;
    }

    let window_start = current_time - back_buffer;
    let window_end = current_time + fetch_ahead;
    let first = ranges[0];
    let last = ranges[ranges.len() - 1];

    if first.end <= window_start {
        return Some(Eviction {
            start: first.start,
            end: first.end,
        });
    }
    if last.start >= window_end {
        return Some(Eviction {
            start: last.start,
            end: last.end,
        });
    }
    if first.start < window_start {
        return Some(Eviction {
            start: first.start,
            end: window_start,
        });
    }
    if last.end > window_end {
        return Some(Eviction {
            start: window_end,
            end: last.end,
        });
    }
    if window_start > first.start {
        return Some(Eviction {
            start: first.start,
            end: window_start,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(spans: &[(f64, f64)]) -> Vec<BufferedRange> {
        spans
            .iter()
            .map(|&(start, end)| BufferedRange { start, end })
            .collect()
    }

    #[test]
    fn under_budget_buffers_are_left_alone() {
        let buffered = ranges(&[(0.0, 20.0)]);
        assert_eq!(plan(&buffered, 15.0, 10.0, 5.0, 30.0), None);
    }

    #[test]
    fn stale_ranges_behind_the_window_go_first() {
        // Playhead at 60: the window is [50, 65], range one is long gone.
        let buffered = ranges(&[(0.0, 20.0), (50.0, 66.0)]);
        assert_eq!(
            plan(&buffered, 60.0, 10.0, 5.0, 30.0),
            Some(Eviction {
                start: 0.0,
                end: 20.0
            })
        );
    }

    #[test]
    fn orphaned_ranges_past_the_window_go_next() {
        // A stale far-future range, left over from seeking back.
        let buffered = ranges(&[(55.0, 70.0), (300.0, 320.0)]);
        assert_eq!(
            plan(&buffered, 60.0, 10.0, 5.0, 30.0),
            Some(Eviction {
                start: 300.0,
                end: 320.0
            })
        );
    }

    #[test]
    fn a_range_straddling_the_window_start_is_trimmed() {
        let buffered = ranges(&[(20.0, 66.0)]);
        assert_eq!(
            plan(&buffered, 60.0, 10.0, 5.0, 30.0),
            Some(Eviction {
                start: 20.0,
                end: 50.0
            })
        );
    }

    #[test]
    fn a_range_straddling_the_window_end_is_trimmed() {
        let buffered = ranges(&[(52.0, 90.0)]);
        assert_eq!(
            plan(&buffered, 60.0, 10.0, 5.0, 30.0),
            Some(Eviction {
                start: 65.0,
                end: 90.0
            })
        );
    }

    #[test]
    fn in_window_overflow_trims_nothing_ahead_of_the_back_buffer() {
        // Everything sits inside [50, 65]; the fallback has no room to trim.
        let buffered = ranges(&[(50.0, 64.0)]);
        assert_eq!(plan(&buffered, 60.0, 10.0, 5.0, 13.0), None);
    }

    #[test]
    fn evictions_never_touch_media_inside_the_window() {
        let window_start = 50.0;
        let window_end = 65.0;
        let cases = [
            ranges(&[(0.0, 20.0), (50.0, 66.0)]),
            ranges(&[(55.0, 70.0), (300.0, 320.0)]),
            ranges(&[(20.0, 66.0)]),
            ranges(&[(52.0, 90.0)]),
        ];
        for buffered in cases {
            if let Some(eviction) = plan(&buffered, 60.0, 10.0, 5.0, 20.0) {
                assert!(
                    eviction.end <= window_start || eviction.start >= window_end,
                    "eviction [{}, {}) overlaps the window",
                    eviction.start,
                    eviction.end
                );
            }
        }
    }
}
