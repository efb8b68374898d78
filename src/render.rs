//! Rendering of pruned output: keep-set expansion around the server's kept
//! line markers, then a line-numbered view with collapsed elision markers.

use std::collections::BTreeSet;

/// Width of the right-aligned line number column.
const LINE_NUMBER_WIDTH: usize = 6;

/// 1-based line numbers retained in the output.
pub type KeepSet = BTreeSet<usize>;

/// Expand each kept marker by `context_lines` on both sides, clamped to
/// `[1, total_lines]`. Markers outside the file are ignored.
pub fn build_keep_set(kept_frags: &[u64], total_lines: usize, context_lines: usize) -> KeepSet {
    let mut keep = KeepSet::new();
    for &marker in kept_frags {
        let Ok(line) = usize::try_from(marker) else {
            continue;
        };
        if line < 1 || line > total_lines {
            continue;
        }
        let start = line.saturating_sub(context_lines).max(1);
        let end = line.saturating_add(context_lines).min(total_lines);
        keep.extend(start..=end);
    }
    keep
}

/// Render `lines` keeping only non-blank lines in `keep`.
///
/// Every maximal run of dropped lines becomes one
/// `...(filtered N lines: A-B)` marker; a run of a single line is dropped
/// without a marker.
pub fn render(lines: &[&str], keep: &KeepSet, show_line_numbers: bool) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut run = ElisionRun::default();

    for (idx, line) in lines.iter().enumerate() {
        let line_no = idx + 1;
        if !keep.contains(&line_no) || line.trim().is_empty() {
            run.extend(line_no);
            continue;
        }

        run.flush(&mut out);
        if show_line_numbers {
            out.push(format!(
                "{:>width$} | {}",
                line_no,
                line,
                width = LINE_NUMBER_WIDTH
            ));
        } else {
            out.push((*line).to_string());
        }
    }
    run.flush(&mut out);

    out.join("\n")
}

/// Keep-set expansion and rendering in one step.
pub fn render_pruned(
    lines: &[&str],
    kept_frags: &[u64],
    context_lines: usize,
    show_line_numbers: bool,
) -> String {
    let keep = build_keep_set(kept_frags, lines.len(), context_lines);
    render(lines, &keep, show_line_numbers)
}

#[derive(Debug, Default)]
struct ElisionRun {
    first: Option<usize>,
    count: usize,
}

impl ElisionRun {
    fn extend(&mut self, line_no: usize) {
        if self.first.is_none() {
            self.first = Some(line_no);
        }
        self.count += 1;
    }

    fn flush(&mut self, out: &mut Vec<String>) {
        if let Some(first) = self.first.take() {
            if self.count >= 2 {
                let last = first + self.count - 1;
                out.push(format!(
                    "...(filtered {} lines: {first}-{last})",
                    self.count
                ));
            }
        }
        self.count = 0;
    }
}
