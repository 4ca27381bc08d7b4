use std::time::Duration;

/// A time interval during which the scan holds additional target
/// concurrency. Offsets are relative to scan start; spans may overlap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanSpan {
    pub concurrency: usize,
    pub begin: Duration,
    pub end: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SpanChange {
    pub at: Duration,
    pub span: usize,
    pub activate: bool,
}

/// The time-ordered activate/deactivate timeline for a span list. Stable
/// sort, so simultaneous changes keep declaration order.
pub(crate) fn span_changes(spans: &[ScanSpan]) -> Vec<SpanChange> {
    let mut changes = Vec::with_capacity(spans.len() * 2);
    for (span, s) in spans.iter().enumerate() {
        changes.push(SpanChange {
            at: s.begin,
            span,
            activate: true,
        });
        changes.push(SpanChange {
            at: s.end,
            span,
            activate: false,
        });
    }
    changes.sort_by_key(|change| change.at);
    changes
}

/// The classic staircase profile: total target concurrency starts at
/// `begin` and grows by `delta` every `step_duration`, for `steps` steps.
/// Encoded as one base span plus one incremental span per later step, all
/// ending when the scan does.
pub fn staircase(begin: usize, delta: usize, steps: usize, step_duration: Duration) -> Vec<ScanSpan> {
    let total = step_duration * steps as u32;
    (0..steps)
        .map(|step| ScanSpan {
            concurrency: if step == 0 { begin } else { delta },
            begin: step_duration * step as u32,
            end: total,
        })
        .collect()
}
