//! Contiguous relay-port range search.

use std::collections::HashSet;

/// Find the lowest-starting run of `count` consecutive ports in `[min, max]`
/// that contains no port from `used`.
///
/// Returns an empty list when `count` is zero or no such run exists.
pub fn find_range(used: &HashSet<u16>, count: usize, min: u16, max: u16) -> Vec<u16> {
    if count == 0 || min > max {
        return Vec::new();
    }

    let Ok(count) = u32::try_from(count) else {
        return Vec::new();
    };
    let (count, max) = (u64::from(count), u64::from(max));
    let mut start = u64::from(min);

    while start + count - 1 <= max {
        // Any start at or below a blocking port fails on that same port,
        // so resume just past the highest blocker in the window.
        match (start..start + count)
            .rev()
            .find(|&p| used.contains(&(p as u16)))
        {
            Some(blocked) => start = blocked + 1,
            None => return (start..start + count).map(|p| p as u16).collect(),
        }
    }

    Vec::new()
}
