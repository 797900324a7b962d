use std::cmp::Ordering;

/// Orders version strings segment by segment: digit runs compare numerically,
/// everything else lexically. Falls back to a plain string comparison so that
/// the ordering stays total.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let mut left_segments = segments(left);
    let mut right_segments = segments(right);

    loop {
        match (left_segments.next(), right_segments.next()) {
            (None, None) => return left.cmp(right),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(a), Some(b)) => {
                let ordering = compare_segment(a, b);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

fn compare_segment(left: &str, right: &str) -> Ordering {
    let left_numeric = left.starts_with(|ch: char| ch.is_ascii_digit());
    let right_numeric = right.starts_with(|ch: char| ch.is_ascii_digit());
    match (left_numeric, right_numeric) {
        (true, true) => {
            let a = left.trim_start_matches('0');
            let b = right.trim_start_matches('0');
            a.len().cmp(&b.len()).then_with(|| a.cmp(b))
        }
        // numbers sort after separators and suffixes at the same position
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => left.cmp(right),
    }
}

fn segments(value: &str) -> impl Iterator<Item = &str> {
    let mut rest = value;
    std::iter::from_fn(move || {
        let first = rest.chars().next()?;
        let numeric = first.is_ascii_digit();
        let end = rest
            .find(|ch: char| ch.is_ascii_digit() != numeric)
            .unwrap_or(rest.len());
        let (segment, tail) = rest.split_at(end);
        rest = tail;
        Some(segment)
    })
}
