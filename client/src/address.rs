use std::ops::Range;

use crate::config::FetchConfig;

/// Position of a single media object within the grouped track layout.
///
/// Ordering is group-major, so addresses sort the same way the media plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectAddress {
    pub group: u64,
    pub object: u64,
}

impl ObjectAddress {
    /// Group 0 is reserved for the track's initialization segment.
    pub const INIT_SEGMENT: ObjectAddress = ObjectAddress { group: 0, object: 0 };

    pub fn new(group: u64, object: u64) -> Self {
        Self { group, object }
    }
}

/// Group index holding the media at `time` seconds.
pub fn group_for_time(time: f64, groups_per_second: f64) -> u64 {
    (time.max(0.0) * groups_per_second).floor() as u64
}

/// Object index within its group for the media at `time` seconds.
///
/// Only the fractional second selects the object, matching a layout of one
/// group per second with `objects_per_group` objects spread across it.
pub fn object_for_time(time: f64, objects_per_group: u64) -> u64 {
    let index = (time.max(0.0).fract() * objects_per_group as f64).floor() as u64;
    index.min(objects_per_group.saturating_sub(1))
}

/// Full address of the media object at `time` seconds.
pub fn address_for_time(time: f64, config: &FetchConfig) -> ObjectAddress {
    ObjectAddress {
        group: group_for_time(time, config.groups_per_second),
        object: object_for_time(time, config.objects_per_group),
    }
}

/// Groups whose media overlaps `[start, end)` seconds.
///
/// Boundary groups count even when only partially covered, so every group
/// a buffer trim touches becomes eligible for re-fetch.
pub fn groups_overlapping(start: f64, end: f64, groups_per_second: f64) -> Range<u64> {
    if end <= start {
        return 0..0;
    }
    let first = (start.max(0.0) * groups_per_second).floor() as u64;
    let last = (end.max(0.0) * groups_per_second).ceil() as u64;
    if last <= first {
        return 0..0;
    }
    first..last
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_playhead_to_group_and_object() {
        // 12.5s at 1 group/s with 48 objects per group lands mid-group 12.
        assert_eq!(group_for_time(12.5, 1.0), 12);
        assert_eq!(object_for_time(12.5, 48), 24);

        let config = FetchConfig::default();
        let address = address_for_time(12.5, &config);
        assert_eq!(address, ObjectAddress::new(12, 24));
    }

    #[test]
    fn same_time_always_maps_to_the_same_address() {
        let config = FetchConfig::default();
        assert_eq!(address_for_time(7.3, &config), address_for_time(7.3, &config));
    }

    #[test]
    fn negative_times_clamp_to_the_track_start() {
        assert_eq!(group_for_time(-3.0, 1.0), 0);
        assert_eq!(object_for_time(-0.25, 48), 0);
    }

    #[test]
    fn object_index_never_reaches_the_group_size() {
        // Float error near the next whole second must not overflow the group.
        assert!(object_for_time(0.999_999_999, 48) < 48);
        assert_eq!(object_for_time(0.0, 48), 0);
    }

    #[test]
    fn groups_overlapping_includes_partially_covered_boundaries() {
        assert_eq!(groups_overlapping(0.0, 10.0, 1.0), 0..10);
        assert_eq!(groups_overlapping(0.5, 10.0, 1.0), 0..10);
        assert_eq!(groups_overlapping(2.0, 2.7, 1.0), 2..3);
        assert_eq!(groups_overlapping(12.0, 12.75, 1.0), 12..13);
        assert_eq!(groups_overlapping(-3.0, 1.5, 1.0), 0..2);
        assert_eq!(groups_overlapping(5.0, 5.0, 1.0), 0..0);
        assert_eq!(groups_overlapping(6.0, 2.0, 1.0), 0..0);
    }
}
