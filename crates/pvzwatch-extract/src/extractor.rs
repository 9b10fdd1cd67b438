use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use pvzwatch_core::types::Mode;

/// Structured fields pulled out of a single posting.
///
/// `kind` and `date` are always present; `location` is resolved later by the
/// pipeline (topic name or geo gate), never here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub kind: Mode,
    pub price: Option<i64>,
    pub date: NaiveDate,
    pub shk: Option<String>,
    pub location: Option<String>,
}

const EMPLOYER_KEYWORDS: &[&str] = &[
    "требуется",
    "требуются",
    "вакансия",
    "ищем",
    "набираем",
    "приглашаем",
    "нужен сотрудник",
    "нужен работник",
    "нужен человек",
    "ищем продавца",
    "оператора",
    "на постоянную работу",
    "график работы",
    "оформление",
    "выплаты",
    "зп 2 раза",
    "условия",
    "требования",
];

const WORKER_KEYWORDS: &[&str] = &[
    "выйду",
    "могу выйти",
    "ищу работу",
    "ищу смену",
    "ищу подработку",
    "возьму смену",
    "рассмотрю смены",
    "устроюсь",
    "устроимся",
    "свободен",
    "готов работать",
    "ищу пункт",
    "могу",
];

/// Full weekday words (including common accusative forms), Monday = 0.
const WEEKDAYS: &[(&str, i64)] = &[
    ("понедельник", 0),
    ("вторник", 1),
    ("среда", 2),
    ("среду", 2),
    ("четверг", 3),
    ("пятница", 4),
    ("пятницу", 4),
    ("суббота", 5),
    ("субботу", 5),
    ("воскресенье", 6),
];

const MONTHS: &[(&str, u32)] = &[
    ("января", 1),
    ("февраля", 2),
    ("марта", 3),
    ("апреля", 4),
    ("мая", 5),
    ("июня", 6),
    ("июля", 7),
    ("августа", 8),
    ("сентября", 9),
    ("октября", 10),
    ("ноября", 11),
    ("декабря", 12),
];

static RE_WEEKDAYS: Lazy<Vec<(Regex, i64)>> = Lazy::new(|| {
    WEEKDAYS
        .iter()
        .map(|(word, num)| (Regex::new(&format!(r"\b{word}\b")).unwrap(), *num))
        .collect()
});

static RE_WEEKDAY_ABBR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(пн|вт|ср|чт|пт|сб|вс)\b").unwrap());

static RE_DAY_ORDINAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2})[-\s]?(?:го|числа)").unwrap());

static RE_DAY_DOT_MONTH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,2})[./](\d{1,2})").unwrap());

static RE_DAY_MONTH_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(\d{1,2})\s+(января|февраля|марта|апреля|мая|июня|июля|августа|сентября|октября|ноября|декабря)",
    )
    .unwrap()
});

static RE_WORKER_INTENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"выйду|ищу|устроюсь|свободен|готов").unwrap());

/// `2к` / `2,5к`: the address form "67 к 3" is excluded by a post-match
/// check because the regex crate has no lookahead.
static RE_PRICE_K: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*к\b").unwrap());
static RE_PRICE_TYS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s*тыс").unwrap());
static RE_PRICE_RUB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{3,5})\s*(?:₽|руб|р\.?)").unwrap());
static RE_PRICE_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:ставка|зп|оплата)[^\d]{0,10}(\d{3,5})").unwrap());
static RE_PRICE_BARE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4,5})\b").unwrap());

static SHK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // 150-200 шк (single line)
        r"(\d{2,4})[^\S\n]*[-–][^\S\n]*(\d{2,4})[^\S\n]*шк",
        // шк: 150-200
        r"шк[^\S\n]*[-:—]?[^\S\n]*(\d{2,4})[^\S\n]*[-–][^\S\n]*(\d{2,4})",
        // 150 шк
        r"(\d{2,4})\s*шк",
        // шк до 500
        r"шк\s+до\s+(\d{2,4})",
        // шк: 150 / шк 150
        r"шк\s*[-:—]?\s*(\d{2,4})",
        // шк мало
        r"шк\s*[-:—]?\s*(мало|много|средне)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Keyword classification: employer lists take precedence over worker lists.
fn detect_type(lower: &str) -> Option<Mode> {
    for k in EMPLOYER_KEYWORDS {
        if lower.contains(k) {
            return Some(Mode::Employer);
        }
    }
    for k in WORKER_KEYWORDS {
        if lower.contains(k) {
            return Some(Mode::Worker);
        }
    }
    None
}

/// The next date (including today) falling on `target` weekday, Monday = 0.
fn nearest_weekday(target: i64, base: NaiveDate) -> NaiveDate {
    let mut days_ahead = target - i64::from(base.weekday().num_days_from_monday());
    if days_ahead < 0 {
        days_ahead += 7;
    }
    base + Duration::days(days_ahead)
}

/// Resolve the work date from the text, in priority order. `None` means
/// nothing matched: the caller falls back to the message date.
fn extract_date(lower: &str, msg_date: NaiveDate) -> Option<NaiveDate> {
    // Keywords first; "послезавтра" must be probed before "завтра".
    if lower.contains("послезавтра") {
        return Some(msg_date + Duration::days(2));
    }
    if lower.contains("завтра") {
        return Some(msg_date + Duration::days(1));
    }
    if lower.contains("сегодня") || lower.contains("сейчас") {
        return Some(msg_date);
    }

    for (re, num) in RE_WEEKDAYS.iter() {
        if re.is_match(lower) {
            return Some(nearest_weekday(*num, msg_date));
        }
    }

    if let Some(caps) = RE_WEEKDAY_ABBR.captures(lower) {
        let num = match &caps[1] {
            "пн" => 0,
            "вт" => 1,
            "ср" => 2,
            "чт" => 3,
            "пт" => 4,
            "сб" => 5,
            _ => 6,
        };
        return Some(nearest_weekday(num, msg_date));
    }

    // "5го" / "5 числа": this month, rolling into the next when past.
    if let Some(caps) = RE_DAY_ORDINAL.captures(lower) {
        let day: u32 = caps[1].parse().ok()?;
        if let Some(date) = day_in_month_with_rollover(day, msg_date) {
            return Some(date);
        }
    }

    // "DD.MM" / "DD/MM": this year, rolling into the next when past.
    if let Some(caps) = RE_DAY_DOT_MONTH.captures(lower) {
        let day: u32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        if let Some(date) = day_month_with_rollover(day, month, msg_date) {
            return Some(date);
        }
    }

    // "DD месяца" with the month as a genitive word.
    if let Some(caps) = RE_DAY_MONTH_WORD.captures(lower) {
        let day: u32 = caps[1].parse().ok()?;
        let month = MONTHS.iter().find(|(w, _)| *w == &caps[2]).map(|(_, m)| *m)?;
        if let Some(date) = day_month_with_rollover(day, month, msg_date) {
            return Some(date);
        }
    }

    None
}

/// Day-of-current-month; a past day rolls into the next month. Invalid
/// calendar days (e.g. Feb 31) yield `None` so the caller falls through.
fn day_in_month_with_rollover(day: u32, msg_date: NaiveDate) -> Option<NaiveDate> {
    let date = NaiveDate::from_ymd_opt(msg_date.year(), msg_date.month(), day)?;
    if date >= msg_date {
        return Some(date);
    }
    let (next_year, next_month) = if msg_date.month() < 12 {
        (msg_date.year(), msg_date.month() + 1)
    } else {
        (msg_date.year() + 1, 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, day)
}

/// Explicit day+month in the current year; a past date rolls to next year.
fn day_month_with_rollover(day: u32, month: u32, msg_date: NaiveDate) -> Option<NaiveDate> {
    let date = NaiveDate::from_ymd_opt(msg_date.year(), month, day)?;
    if date >= msg_date {
        return Some(date);
    }
    NaiveDate::from_ymd_opt(msg_date.year() + 1, month, day)
}

/// Collect every price candidate in pattern order; workers get the minimum,
/// employers (and unclassified texts) the maximum.
fn extract_price(lower: &str, kind: Option<Mode>) -> Option<i64> {
    let mut prices: Vec<i64> = Vec::new();

    for m in RE_PRICE_K.captures_iter(lower) {
        let whole = m.get(0).unwrap();
        // "67 к 3" is a building address, not a price
        let rest = lower[whole.end()..].trim_start();
        if rest.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        if let Some(v) = parse_price(&m[1], true) {
            prices.push(v);
        }
    }
    for m in RE_PRICE_TYS.captures_iter(lower) {
        if let Some(v) = parse_price(&m[1], true) {
            prices.push(v);
        }
    }
    for re in [&*RE_PRICE_RUB, &*RE_PRICE_LABEL, &*RE_PRICE_BARE] {
        for m in re.captures_iter(lower) {
            if let Some(v) = parse_price(&m[1], false) {
                prices.push(v);
            }
        }
    }

    if prices.is_empty() {
        return None;
    }
    Some(match kind {
        Some(Mode::Worker) => *prices.iter().min().unwrap(),
        _ => *prices.iter().max().unwrap(),
    })
}

fn parse_price(raw: &str, thousands: bool) -> Option<i64> {
    let value: f64 = raw.replace(',', ".").parse().ok()?;
    let value = if thousands { value * 1000.0 } else { value };
    Some(value as i64)
}

/// Barcode-volume tag: a range "A-B", a single number, or a qualitative word.
fn extract_shk(lower: &str) -> Option<String> {
    for re in SHK_PATTERNS.iter() {
        if let Some(caps) = re.captures(lower) {
            if let Some(hi) = caps.get(2) {
                return Some(format!("{}-{}", &caps[1], hi.as_str()));
            }
            return Some(caps[1].to_string());
        }
    }
    None
}

/// Parse one posting into structured fields.
///
/// Returns `None` only when the text can be classified neither by keyword
/// nor by worker intent and carries no price; otherwise `kind` and `date`
/// are always populated (the date falls back to the message's calendar day).
pub fn extract(text: &str, message_date: DateTime<Utc>) -> Option<Extracted> {
    let lower = text.to_lowercase();
    let msg_day = message_date.date_naive();

    let keyword_type = detect_type(&lower);
    let date = extract_date(&lower, msg_day).unwrap_or(msg_day);
    let shk = extract_shk(&lower);

    // The effective type is settled before price extraction: it decides
    // whether min() or max() wins among the candidates.
    let mut effective = keyword_type;
    if effective.is_none() && RE_WORKER_INTENT.is_match(&lower) {
        effective = Some(Mode::Worker);
    }

    let price = extract_price(&lower, effective);

    let kind = match keyword_type {
        Some(k) => k,
        None => match effective {
            Some(Mode::Worker) => Mode::Worker,
            // Specialized chats: an unclassified text with a price is a vacancy.
            _ if price.is_some() => Mode::Employer,
            _ => {
                debug!("no type and no price, message skipped");
                return None;
            }
        },
    };

    Some(Extracted {
        kind,
        price,
        date,
        shk,
        location: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 14, 30, 0).unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn employer_keyword_wins_over_worker() {
        let e = extract("Требуется сотрудник, выйду на связь вечером", at(2026, 2, 3)).unwrap();
        assert_eq!(e.kind, Mode::Employer);
    }

    #[test]
    fn worker_keyword_classifies() {
        let e = extract("Возьму смену на завтра, 2500", at(2026, 2, 3)).unwrap();
        assert_eq!(e.kind, Mode::Worker);
        assert_eq!(e.date, day(2026, 2, 4));
    }

    #[test]
    fn intent_without_keyword_is_worker() {
        let e = extract("Свободен в пятницу, 3000", at(2026, 2, 3)).unwrap();
        assert_eq!(e.kind, Mode::Worker);
    }

    #[test]
    fn price_only_defaults_to_employer() {
        let e = extract("Смена 2600 руб, Красногорск", at(2026, 2, 3)).unwrap();
        assert_eq!(e.kind, Mode::Employer);
        assert_eq!(e.price, Some(2600));
    }

    #[test]
    fn no_signal_returns_none() {
        assert!(extract("привет, как дела?", at(2026, 2, 3)).is_none());
    }

    #[test]
    fn day_after_tomorrow_beats_tomorrow() {
        let e = extract("выйду послезавтра", at(2026, 2, 3)).unwrap();
        assert_eq!(e.date, day(2026, 2, 5));
    }

    #[test]
    fn today_keyword() {
        let e = extract("ищу смену сегодня", at(2026, 2, 3)).unwrap();
        assert_eq!(e.date, day(2026, 2, 3));
    }

    #[test]
    fn weekday_word_rolls_forward() {
        // 2026-02-03 is a Tuesday; "субботу" lands on 2026-02-07.
        let e = extract("выйду в субботу", at(2026, 2, 3)).unwrap();
        assert_eq!(e.date, day(2026, 2, 7));
    }

    #[test]
    fn weekday_today_stays_today() {
        // Tuesday asking for "вт" resolves to the same day.
        let e = extract("могу вт", at(2026, 2, 3)).unwrap();
        assert_eq!(e.date, day(2026, 2, 3));
    }

    #[test]
    fn ordinal_day_rolls_into_next_month() {
        let e = extract("выйду 2го", at(2026, 2, 10)).unwrap();
        assert_eq!(e.date, day(2026, 3, 2));
    }

    #[test]
    fn numeric_date_rollover_across_month_edge() {
        // Message on Feb 28, работа on 1.03: next day, same year.
        let e = extract("Выйду 1.03, 3000, шк 100", at(2026, 2, 28)).unwrap();
        assert_eq!(e.date, day(2026, 3, 1));
        assert_eq!(e.price, Some(3000));
        assert_eq!(e.shk.as_deref(), Some("100"));
    }

    #[test]
    fn past_numeric_date_rolls_to_next_year() {
        let e = extract("ищу смену на 05.01", at(2026, 2, 3)).unwrap();
        assert_eq!(e.date, day(2027, 1, 5));
    }

    #[test]
    fn month_word_date() {
        let e = extract("выйду 7 марта", at(2026, 2, 3)).unwrap();
        assert_eq!(e.date, day(2026, 3, 7));
    }

    #[test]
    fn missing_date_falls_back_to_message_day() {
        let e = extract("требуется сотрудник, 2800", at(2026, 2, 3)).unwrap();
        assert_eq!(e.date, day(2026, 2, 3));
    }

    #[test]
    fn k_suffix_multiplies() {
        let e = extract("выйду завтра за 2,5к", at(2026, 2, 3)).unwrap();
        assert_eq!(e.price, Some(2500));
    }

    #[test]
    fn address_k_is_not_a_price() {
        // "67 к 3" is a building, not 67 000 rubles.
        let e = extract("требуется сотрудник, ул. Ленина 67 к 3, оплата 2600", at(2026, 2, 3))
            .unwrap();
        assert_eq!(e.price, Some(2600));
    }

    #[test]
    fn worker_takes_min_employer_takes_max() {
        let w = extract("выйду, от 2000 до 3000", at(2026, 2, 3)).unwrap();
        assert_eq!(w.price, Some(2000));
        let e = extract("требуется, от 2000 до 3000", at(2026, 2, 3)).unwrap();
        assert_eq!(e.price, Some(3000));
    }

    #[test]
    fn shk_range_and_qualitative() {
        let e = extract("требуется, 150-200 шк, 2600", at(2026, 2, 3)).unwrap();
        assert_eq!(e.shk.as_deref(), Some("150-200"));
        let q = extract("выйду завтра, шк мало", at(2026, 2, 3)).unwrap();
        assert_eq!(q.shk.as_deref(), Some("мало"));
    }

    #[test]
    fn tys_suffix_multiplies() {
        let e = extract("требуется сотрудник, оплата 3 тыс", at(2026, 2, 3)).unwrap();
        assert_eq!(e.price, Some(3000));
    }

    #[test]
    fn labeled_price_is_found() {
        let e = extract("вакансия, ставка: 2800 за смену", at(2026, 2, 3)).unwrap();
        assert_eq!(e.kind, Mode::Employer);
        assert_eq!(e.price, Some(2800));
    }

    #[test]
    fn shk_upper_bound_pattern() {
        let e = extract("выйду завтра, шк до 500", at(2026, 2, 3)).unwrap();
        assert_eq!(e.shk.as_deref(), Some("500"));
    }

    #[test]
    fn worker_without_price_still_extracts() {
        let e = extract("ищу смену на завтра", at(2026, 2, 3)).unwrap();
        assert_eq!(e.kind, Mode::Worker);
        assert!(e.price.is_none());
        assert_eq!(e.date, day(2026, 2, 4));
    }

    #[test]
    fn extracted_location_is_always_empty() {
        let e = extract("требуется сотрудник в Москве, 2600", at(2026, 2, 3)).unwrap();
        assert!(e.location.is_none());
    }
}
