use once_cell::sync::Lazy;
use regex::Regex;

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;
const WEEK_MS: u64 = 7 * DAY_MS;
// Gregorian averages: 365.2425 days per year, a twelfth of that per month.
const YEAR_MS: u64 = 31_556_952_000;
const MONTH_MS: u64 = YEAR_MS / 12;

static COMPONENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([1-9][0-9]*)(ms|mo|s|m|h|d|w|y)").expect("valid duration regex"));

/// Parses compact durations such as `90s`, `1h30m` or `2mo3w4d` into
/// milliseconds. The whole input must consist of components; units are
/// case-insensitive and a repeated unit keeps its last value.
pub fn parse_duration_ms(input: &str) -> Option<u64> {
    let lowered = input.to_ascii_lowercase();
    if lowered.is_empty() {
        return None;
    }

    let mut consumed = 0;
    let mut components: Vec<(&str, u64)> = Vec::new();
    for caps in COMPONENT.captures_iter(&lowered) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let amount: u64 = caps[1].parse().ok()?;
        let unit = caps.get(2)?.as_str();
        match components.iter_mut().find(|(u, _)| *u == unit) {
            Some(slot) => slot.1 = amount,
            None => components.push((unit, amount)),
        }
    }
    if consumed != lowered.len() {
        return None;
    }

    components.into_iter().try_fold(0u64, |total, (unit, amount)| {
        let scale = match unit {
            "ms" => 1,
            "s" => SECOND_MS,
            "m" => MINUTE_MS,
            "h" => HOUR_MS,
            "d" => DAY_MS,
            "w" => WEEK_MS,
            "mo" => MONTH_MS,
            "y" => YEAR_MS,
            _ => return None,
        };
        total.checked_add(amount.checked_mul(scale)?)
    })
}
