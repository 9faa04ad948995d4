use super::engine::Report;
use super::filters::GroupBy;

pub const NO_RESULTS: &str = "No results";
const BAR_CELL: char = '█';
const EMOTE_FOOTNOTE: &str =
    "Emotes shown as :name: are no longer available to the bot, so they cannot be displayed.";

/// Renders one line per row: `{bar} {label} {pct}% ({value} / {total})`.
pub fn render_report(report: &Report, bar_width: usize) -> String {
    if report.rows.is_empty() {
        return NO_RESULTS.to_string();
    }

    let max = report.rows.iter().map(|row| row.value).max().unwrap_or(0);
    let mut lines: Vec<String> = report
        .rows
        .iter()
        .map(|row| {
            format!(
                "{} {} {}% ({} / {})",
                bar(row.value, max, bar_width),
                row.label,
                percentage(row.value, report.total),
                row.value,
                report.total
            )
        })
        .collect();

    if report.group_by == GroupBy::Emote {
        lines.push(String::new());
        lines.push(EMOTE_FOOTNOTE.to_string());
    }
    lines.join("\n")
}

fn bar(value: u64, max: u64, width: usize) -> String {
    if max == 0 {
        return BAR_CELL.to_string();
    }
    let width = width as u64;
    let cells = (value * width).div_ceil(max).clamp(1, width.max(1));
    std::iter::repeat_n(BAR_CELL, cells as usize).collect()
}

fn percentage(value: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (value as f64 * 100.0 / total as f64).round() as u64
}

#[cfg(test)]
mod tests {
    use super::{NO_RESULTS, bar, percentage, render_report};
    use crate::analytics::{GroupBy, Report, ReportRow};

    fn row(label: &str, value: u64) -> ReportRow {
        ReportRow {
            key: label.to_string(),
            label: label.to_string(),
            value,
        }
    }

    #[test]
    fn empty_report_renders_placeholder() {
        let report = Report {
            group_by: GroupBy::Emote,
            rows: Vec::new(),
            total: 0,
        };
        assert_eq!(render_report(&report, 5), NO_RESULTS);
    }

    #[test]
    fn bars_scale_against_window_max() {
        assert_eq!(bar(10, 10, 5), "█████");
        assert_eq!(bar(5, 10, 5), "███");
        assert_eq!(bar(1, 100, 5), "█");
    }

    #[test]
    fn percentage_rounds() {
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 67);
        assert_eq!(percentage(0, 0), 0);
    }

    #[test]
    fn user_report_lines() {
        let report = Report {
            group_by: GroupBy::User,
            rows: vec![row("<@1>", 3), row("<@2>", 1)],
            total: 4,
        };
        assert_eq!(
            render_report(&report, 5),
            "█████ <@1> 75% (3 / 4)\n██ <@2> 25% (1 / 4)"
        );
    }

    #[test]
    fn emote_report_has_footnote() {
        let report = Report {
            group_by: GroupBy::Emote,
            rows: vec![row("🤔", 2)],
            total: 2,
        };
        let rendered = render_report(&report, 5);
        assert!(rendered.starts_with("█████ 🤔 100% (2 / 2)\n\n"));
        assert!(rendered.contains(":name:"));
    }
}
