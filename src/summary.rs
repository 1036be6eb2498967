//! Human-readable end-of-run report.

use crate::types::{format_duration, format_tags, RunStatus, RunSummary, SeriesSummary};
use std::fmt::Write;
use std::time::Duration;

const NAME_WIDTH: usize = 32;

pub fn render(summary: &RunSummary) -> String {
    let mut out = String::new();
    let status = match summary.status {
        RunStatus::Completed => "completed",
        RunStatus::Aborted => "aborted",
    };
    let _ = writeln!(
        out,
        "\n  run {} {} in {}\n",
        summary.run_id,
        status,
        format_duration(Duration::from_secs_f64(summary.duration_secs.max(0.0)))
    );

    if !summary.checks.by_name.is_empty() {
        for (name, tally) in &summary.checks.by_name {
            let mark = if tally.fails == 0 { '✓' } else { '✗' };
            let _ = writeln!(out, "  {} {} (✓ {} ✗ {})", mark, name, tally.passes, tally.fails);
        }
        out.push('\n');
    }

    let total = summary.checks.passes + summary.checks.fails;
    if total > 0 {
        let _ = writeln!(
            out,
            "  {}: {:.2}% ✓ {} ✗ {}",
            dotted("checks"),
            summary.checks.passes as f64 * 100.0 / total as f64,
            summary.checks.passes,
            summary.checks.fails
        );
    }
    for (name, metric) in &summary.metrics {
        if name == crate::metrics::CHECKS {
            continue;
        }
        let _ = writeln!(out, "  {}: {}", dotted(name), series(&metric.values));
        for sub in &metric.submetrics {
            let _ = writeln!(out, "    {{{}}}: {}", format_tags(&sub.tags), series(&sub.values));
        }
    }

    if !summary.thresholds.is_empty() {
        out.push_str("\n  thresholds:\n");
        for t in &summary.thresholds {
            let observed = t
                .observed
                .map_or_else(|| "no data".to_string(), |v| format!("{:.3}", v));
            let _ = writeln!(
                out,
                "  {} {} {} ({})",
                if t.passed { '✓' } else { '✗' },
                t.metric,
                t.expression,
                observed
            );
        }
    }
    out
}

fn dotted(name: &str) -> String {
    let dots = NAME_WIDTH.saturating_sub(name.len()).max(3);
    format!("{}{}", name, ".".repeat(dots))
}

fn series(values: &SeriesSummary) -> String {
    match values {
        SeriesSummary::Counter { count, sum } => format!("{} (count={})", number(*sum), count),
        SeriesSummary::Gauge { value, min, max } => format!(
            "{} min={} max={}",
            number(*value),
            number(*min),
            number(*max)
        ),
        SeriesSummary::Rate {
            passes,
            total,
            rate,
        } => format!(
            "{:.2}% ✓ {} ✗ {}",
            rate * 100.0,
            passes,
            total - passes
        ),
        SeriesSummary::Trend {
            count,
            min,
            max,
            avg,
            med,
            percentiles,
            ..
        } => {
            let mut line = format!(
                "avg={} min={} med={} max={}",
                number(*avg),
                number(*min),
                number(*med),
                number(*max)
            );
            for (label, value) in percentiles {
                let _ = write!(line, " {}={}", label, number(*value));
            }
            let _ = write!(line, " count={}", count);
            line
        }
    }
}

fn number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{:.2}", v)
    }
}
