use crate::model::*;

use super::conflict::find_conflicts;

// ── Availability Algorithm ────────────────────────────────────────

/// Free spans of a vehicle inside `query` for a new reservation of `kind`.
///
/// Starts from the whole window and subtracts every active reservation that
/// would conflict with `kind`. A retired vehicle has no availability; a
/// `not_for_rental` vehicle has none for rentals.
pub fn availability(vehicle: &VehicleState, query: &Span, kind: ReservationType) -> Vec<Span> {
    if vehicle.is_retired() || (kind.is_rental() && vehicle.status == VehicleStatus::NotForRental) {
        return Vec::new();
    }

    let mut busy: Vec<Span> = find_conflicts(vehicle, query, kind, None)
        .filter_map(|r| r.span.intersection(query))
        .collect();

    if busy.is_empty() {
        return vec![*query];
    }
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);
    subtract_intervals(&[*query], &busy)
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

pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
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

/// Sweep line over per-vehicle free spans: time ranges where at least
/// `min_available` vehicles are free at once.
pub fn pooled_availability(per_vehicle: &[Vec<Span>], min_available: usize) -> Vec<Span> {
    if min_available == 0 || per_vehicle.len() < min_available {
        return Vec::new();
    }

    let mut events: Vec<(Ms, i32)> = Vec::new();
    for spans in per_vehicle {
        for s in spans {
            events.push((s.start, 1));
            events.push((s.end, -1));
        }
    }
    // Ends sort before starts at the same instant so touching spans don't stack.
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result = Vec::new();
    let mut count: i32 = 0;
    let mut seg_start: Option<Ms> = None;
    let threshold = min_available as i32;

    for (time, delta) in &events {
        let prev = count;
        count += delta;

        if prev < threshold && count >= threshold {
            seg_start = Some(*time);
        } else if prev >= threshold && count < threshold
            && let Some(start) = seg_start.take()
            && *time > start {
                result.push(Span::new(start, *time));
            }
    }

    // One vehicle ending where another starts leaves two touching segments.
    merge_overlapping(&result)
}
