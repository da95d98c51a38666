//! Fair division of execution slots across task classes.
//!
//! Given N available slots and per-class (priority weight, live NEW backlog)
//! pairs, grant each class with backlog an integer slot count such that no
//! class exceeds its backlog, slots go out proportionally to priority, leftover
//! capacity from exhausted classes is redistributed among the rest, fractions
//! are settled by the largest-remainder method, and no class with backlog is
//! starved completely.

use crate::error::{PrismError, Result};

/// Redistribution passes are bounded as a hard invariant; each pass exhausts at
/// least one class's backlog, so hitting the bound indicates a bug.
const MAX_DISTRIBUTION_PASSES: usize = 100;

const EPSILON: f64 = 1e-9;

/// A class's standing in the allocation: configured weight plus live backlog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassBacklog {
    pub class: String,
    pub priority: i64,
    pub db_count: u64,
}

/// Granted execution slots for one class. Transient, consumed immediately by
/// the repository query that locks matching NEW rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub class: String,
    pub granted: u64,
}

struct Share {
    class: String,
    priority: i64,
    backlog: f64,
    granted: f64,
    exhausted: bool,
}

/// Divide `available` slots among the classes.
///
/// Returns Ok(None) when there is nothing to allocate: zero slots, or no class
/// has backlog. Classes granted zero slots are dropped from the result.
pub fn divide_slots(available: u64, entries: &[ClassBacklog]) -> Result<Option<Vec<Allocation>>> {
    if available == 0 {
        return Ok(None);
    }

    // Stable sort keeps the configured ordering among equal priorities, which
    // is also the tie-break order for rounding.
    let mut with_backlog: Vec<&ClassBacklog> = entries.iter().filter(|e| e.db_count > 0).collect();
    if with_backlog.is_empty() {
        return Ok(None);
    }
    with_backlog.sort_by(|a, b| b.priority.cmp(&a.priority));

    let granted = if with_backlog.len() as u64 >= available {
        distribute_one_each(available, &with_backlog)
    } else {
        let shares = distribute_proportionally(available, &with_backlog)?;
        let mut rounded = round_largest_remainder(shares)?;
        bump_starved_classes(&mut rounded);
        rounded
    };

    let total: u64 = granted.iter().map(|a| a.granted).sum();
    if total > available {
        return Err(PrismError::Validation(format!(
            "allocated {} slots but only {} were available",
            total, available
        )));
    }

    Ok(Some(granted.into_iter().filter(|a| a.granted > 0).collect()))
}

/// More classes than slots: one slot per class, highest priority first, until
/// slots run out.
fn distribute_one_each(available: u64, entries: &[&ClassBacklog]) -> Vec<Allocation> {
    entries
        .iter()
        .take(available as usize)
        .map(|e| Allocation {
            class: e.class.clone(),
            granted: 1,
        })
        .collect()
}

/// Hand out slots proportionally to priority among classes that still have
/// backlog, re-running with the leftover whenever a class exhausts its backlog
/// before using its share.
fn distribute_proportionally(available: u64, entries: &[&ClassBacklog]) -> Result<Vec<Share>> {
    let mut shares: Vec<Share> = entries
        .iter()
        .map(|e| Share {
            class: e.class.clone(),
            priority: e.priority,
            backlog: e.db_count as f64,
            granted: 0.0,
            exhausted: false,
        })
        .collect();

    let mut remaining = available as f64;
    for pass in 0.. {
        if pass >= MAX_DISTRIBUTION_PASSES {
            return Err(PrismError::Validation(
                "slot redistribution did not converge".to_string(),
            ));
        }

        let priority_sum: i64 = shares.iter().filter(|s| !s.exhausted).map(|s| s.priority).sum();
        if priority_sum <= 0 {
            return Err(PrismError::Validation(
                "sum of class priorities must be positive".to_string(),
            ));
        }

        let mut leftover = 0.0;
        for share in shares.iter_mut().filter(|s| !s.exhausted) {
            let open = remaining * share.priority as f64 / priority_sum as f64;
            if share.backlog >= open {
                share.granted += open;
                share.backlog -= open;
            } else {
                share.granted += share.backlog;
                leftover += open - share.backlog;
                share.backlog = 0.0;
            }
            if share.backlog <= EPSILON {
                share.exhausted = true;
            }
        }

        let backlog_left = shares.iter().any(|s| !s.exhausted);
        if leftover <= EPSILON || !backlog_left {
            break;
        }
        remaining = leftover;
    }

    if shares.iter().any(|s| s.granted < 0.0) {
        return Err(PrismError::Validation(
            "negative slot grant computed".to_string(),
        ));
    }

    Ok(shares)
}

/// Largest-remainder (Hare quota) rounding: floor every share, then hand the
/// leftover units to the largest fractional remainders, ties broken by the
/// incoming order. The remainder sum is an integer up to float error, hence
/// the rounding instead of a plain floor.
fn round_largest_remainder(shares: Vec<Share>) -> Result<Vec<Allocation>> {
    let remainder_sum: f64 = shares.iter().map(|s| s.granted.fract()).sum();
    let mut extra = remainder_sum.round() as u64;

    let mut order: Vec<usize> = (0..shares.len()).collect();
    order.sort_by(|&a, &b| {
        shares[b]
            .granted
            .fract()
            .partial_cmp(&shares[a].granted.fract())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut granted: Vec<u64> = shares.iter().map(|s| s.granted.floor() as u64).collect();
    for index in order {
        if extra == 0 {
            break;
        }
        granted[index] += 1;
        extra -= 1;
    }

    Ok(shares
        .into_iter()
        .zip(granted)
        .map(|(share, granted)| Allocation {
            class: share.class,
            granted,
        })
        .collect())
}

/// Guarantee every class at least one slot by stealing from the currently
/// largest grantees, one slot at a time.
fn bump_starved_classes(allocations: &mut [Allocation]) {
    let starved = allocations.iter().filter(|a| a.granted == 0).count();
    if starved == 0 {
        return;
    }

    let mut to_free = starved;
    while to_free > 0 {
        let largest = allocations
            .iter_mut()
            .filter(|a| a.granted > 1)
            .max_by_key(|a| a.granted);
        match largest {
            Some(a) => a.granted -= 1,
            None => break,
        }
        to_free -= 1;
    }

    for allocation in allocations.iter_mut().filter(|a| a.granted == 0) {
        allocation.granted = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backlog(class: &str, priority: i64, db_count: u64) -> ClassBacklog {
        ClassBacklog {
            class: class.to_string(),
            priority,
            db_count,
        }
    }

    fn grants(result: Option<Vec<Allocation>>) -> Vec<(String, u64)> {
        result
            .unwrap()
            .into_iter()
            .map(|a| (a.class, a.granted))
            .collect()
    }

    #[test]
    fn test_zero_slots_is_no_allocation() {
        let entries = vec![backlog("A", 60, 9)];
        assert_eq!(divide_slots(0, &entries).unwrap(), None);
    }

    #[test]
    fn test_no_backlog_is_no_allocation() {
        let entries = vec![backlog("A", 60, 0), backlog("B", 40, 0)];
        assert_eq!(divide_slots(5, &entries).unwrap(), None);
        assert_eq!(divide_slots(5, &[]).unwrap(), None);
    }

    #[test]
    fn test_leftover_redistribution() {
        // B's backlog of 1 caps its proportional share of 2; the leftover slot
        // flows back to A.
        let entries = vec![backlog("A", 60, 9), backlog("B", 40, 1)];
        let result = grants(divide_slots(5, &entries).unwrap());
        assert_eq!(result, vec![("A".to_string(), 4), ("B".to_string(), 1)]);
    }

    #[test]
    fn test_exact_proportional_split() {
        let entries = vec![backlog("A", 70, 7), backlog("B", 20, 2), backlog("C", 10, 1)];
        let result = grants(divide_slots(10, &entries).unwrap());
        assert_eq!(
            result,
            vec![
                ("A".to_string(), 7),
                ("B".to_string(), 2),
                ("C".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_starved_class_is_bumped() {
        // Raw shares 3.5/1.0/0.5 round to 4/1/0; C is then bumped by stealing
        // a slot from A.
        let entries = vec![backlog("A", 70, 7), backlog("B", 20, 2), backlog("C", 10, 1)];
        let result = grants(divide_slots(5, &entries).unwrap());
        assert_eq!(
            result,
            vec![
                ("A".to_string(), 3),
                ("B".to_string(), 1),
                ("C".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_largest_remainder_rounding() {
        // Raw shares converge to 6.67/3.33/1; the single leftover unit goes to
        // the largest remainder.
        let entries = vec![backlog("A", 40, 16), backlog("B", 20, 5), backlog("C", 10, 1)];
        let result = grants(divide_slots(11, &entries).unwrap());
        assert_eq!(
            result,
            vec![
                ("A".to_string(), 7),
                ("B".to_string(), 3),
                ("C".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_more_classes_than_slots_grants_one_each_by_priority() {
        let entries = vec![
            backlog("low", 10, 4),
            backlog("high", 90, 4),
            backlog("mid", 50, 4),
        ];
        let result = grants(divide_slots(2, &entries).unwrap());
        assert_eq!(result, vec![("high".to_string(), 1), ("mid".to_string(), 1)]);
    }

    #[test]
    fn test_classes_without_backlog_are_ignored() {
        let entries = vec![backlog("A", 60, 9), backlog("B", 40, 0)];
        let result = grants(divide_slots(5, &entries).unwrap());
        assert_eq!(result, vec![("A".to_string(), 5)]);
    }

    #[test]
    fn test_grants_never_exceed_backlog_or_available() {
        let cases: Vec<(u64, Vec<ClassBacklog>)> = vec![
            (7, vec![backlog("A", 50, 3), backlog("B", 30, 2), backlog("C", 20, 100)]),
            (12, vec![backlog("A", 80, 1), backlog("B", 15, 40), backlog("C", 5, 40)]),
            (3, vec![backlog("A", 1, 10), backlog("B", 1, 10)]),
            (100, vec![backlog("A", 99, 2), backlog("B", 1, 2)]),
        ];
        for (available, entries) in cases {
            let result = divide_slots(available, &entries).unwrap().unwrap();
            let total: u64 = result.iter().map(|a| a.granted).sum();
            assert!(total <= available, "total {} over {}", total, available);
            for allocation in &result {
                let entry = entries.iter().find(|e| e.class == allocation.class).unwrap();
                assert!(
                    allocation.granted <= entry.db_count,
                    "class {} granted {} over backlog {}",
                    allocation.class,
                    allocation.granted,
                    entry.db_count
                );
            }
        }
    }

    #[test]
    fn test_zero_priority_sum_is_an_error() {
        let entries = vec![backlog("A", 0, 5), backlog("B", 0, 5)];
        assert!(divide_slots(4, &entries).is_err());
    }
}
