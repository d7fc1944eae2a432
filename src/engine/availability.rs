use crate::model::*;

// ── Free windows ──────────────────────────────────────────────────

/// The parts of `query` not covered by any booking, ascending.
pub fn free_windows(timeline: &Timeline, query: &Span) -> Vec<Span> {
    let mut booked: Vec<Span> = timeline
        .overlapping(query)
        .map(|b| Span::new(b.span.start.max(query.start), b.span.end.min(query.end)))
        .collect();
    booked.sort_by_key(|s| s.start);
    subtract_intervals(&[*query], &merge_overlapping(&booked))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start; `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}
