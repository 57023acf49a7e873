use crate::model::Span;

// ── Interval algebra on half-open spans ──────────────────────────

/// Clip every window to `day`, drop what becomes empty, sort by start.
pub fn normalize(windows: &[Span], day: &Span) -> Vec<Span> {
    let mut out: Vec<Span> = windows.iter().filter_map(|w| w.clip(day)).collect();
    out.sort_by_key(|s| s.start);
    out
}

/// Minimal sorted, non-overlapping cover of `spans`. Touching spans merge.
pub fn union(spans: &[Span]) -> Vec<Span> {
    let mut sorted: Vec<Span> = spans.iter().copied().filter(|s| s.start < s.end).collect();
    sorted.sort_by_key(|s| s.start);
    merge_overlapping(&sorted)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Remove `to_remove` from sorted, disjoint `base`.
///
/// Fastest when `to_remove` is already a [`union`]; overlapping or unsorted
/// removals still give the right answer.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    if to_remove.is_empty() {
        return base.to_vec();
    }
    let sorted_copy;
    let to_remove = if to_remove.is_sorted_by_key(|s| s.start) {
        to_remove
    } else {
        let mut v = to_remove.to_vec();
        v.sort_by_key(|s| s.start);
        sorted_copy = v;
        &sorted_copy[..]
    };

    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
