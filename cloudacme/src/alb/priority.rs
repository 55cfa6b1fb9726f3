/// Smallest positive priority not present in `existing`.
///
/// Duplicates and zero are ignored; an empty table yields 1.
pub fn next_priority(existing: &[u32]) -> u32 {
    let mut taken: Vec<u32> = existing.iter().copied().filter(|p| *p > 0).collect();
    taken.sort_unstable();
    taken.dedup();

    let mut candidate = 1;
    for priority in taken {
        if priority == candidate {
            candidate += 1;
        } else if priority > candidate {
            break;
        }
    }
    candidate
}

/// Numeric priorities out of raw control plane strings.
///
/// The default rule reports `"default"`; it and anything else that is not a
/// positive integer is skipped.
pub fn parse_priorities<'a, I>(raw: I) -> Vec<u32>
where
    I: IntoIterator<Item = &'a str>,
{
    raw.into_iter()
        .filter_map(|p| p.trim().parse::<u32>().ok())
        .filter(|p| *p > 0)
        .collect()
}
