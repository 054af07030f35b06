use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Compute the blocked ranges for one day: every active booking expanded by
/// the buffer on both sides, clipped to business hours, sorted and merged.
///
/// Pending holds past their deadline and cancelled bookings contribute
/// nothing, so abandoned checkouts stop blocking slots even before the
/// reaper cancels them.
pub fn blocked_spans(day: &DayState, settings: &Settings, now: Ms) -> Vec<Span> {
    let work = settings.work_span();
    let buffer = settings.buffer_minutes;

    // A booking can fall outside the current work span if the admin narrowed
    // the hours after it was taken; clipping then yields nothing.
    let mut blocked: Vec<Span> = day
        .active(now)
        .filter_map(|b| {
            let start = (b.span.start - buffer).max(work.start);
            let end = (b.span.end + buffer).min(work.end);
            (start < end).then(|| Span::new(start, end))
        })
        .collect();
    blocked.sort_by_key(|s| s.start);
    merge_overlapping(&blocked)
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

/// Round blocked spans outward to whole hours for the wire type: an hour
/// that is even partially covered counts as blocked. Re-merges because
/// rounding can make neighbouring spans touch.
pub fn hour_blocks(spans: &[Span]) -> Vec<HourBlock> {
    let rounded: Vec<Span> = spans
        .iter()
        .map(|s| {
            Span::new(
                s.start.div_euclid(MINUTES_PER_HOUR) * MINUTES_PER_HOUR,
                (s.end + MINUTES_PER_HOUR - 1).div_euclid(MINUTES_PER_HOUR) * MINUTES_PER_HOUR,
            )
        })
        .collect();
    merge_overlapping(&rounded)
        .iter()
        .map(|s| HourBlock {
            from: (s.start / MINUTES_PER_HOUR) as u8,
            to: (s.end / MINUTES_PER_HOUR) as u8,
        })
        .collect()
}

/// Advisory slot check used by the listing query: any overlap with a blocked
/// range — including a partial one — makes the candidate unavailable. The
/// authoritative check runs under the day lock at reserve time.
pub fn slot_is_free(blocked: &[Span], candidate: &Span) -> bool {
    blocked.iter().all(|b| !b.overlaps(candidate))
}
