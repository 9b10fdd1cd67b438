use once_cell::sync::Lazy;
use regex::Regex;

static RE_CITY_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bг\.?\s+").unwrap());
static RE_HYPHEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\w)-(\w)").unwrap());
static RE_SPECIAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").unwrap());
static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Street-type abbreviations and full words.
///
/// Ordered list: expansions first (`пр-кт` must become `проспект` before the
/// full word is deleted), then deletions of abbreviations, then deletions of
/// the full street-type words.
static ABBR: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\bпр-кт\b", "проспект"),
        (r"\bпросп\b", "проспект"),
        (r"\bбул\b", "бульвар"),
        (r"\bнаб\b", "набережная"),
        (r"\bш\b", "шоссе"),
        (r"\bпр\b", "проспект"),
        (r"\bул\b", ""),
        (r"\bулица\b", ""),
        (r"\bпроспект\b", ""),
        (r"\bбульвар\b", ""),
        (r"\bнабережная\b", ""),
        (r"\bшоссе\b", ""),
        (r"\bпереулок\b", ""),
        (r"\bтупик\b", ""),
        (r"\bплощадь\b", ""),
        (r"\bаллея\b", ""),
        (r"\bпроезд\b", ""),
        (r"\bпросека\b", ""),
    ]
    .into_iter()
    .map(|(p, r)| (Regex::new(p).unwrap(), r))
    .collect()
});

/// Bring free text (or a dictionary entry) to the canonical lookup form.
pub fn normalize(text: &str) -> String {
    let mut text = text.to_lowercase().replace('ё', "е");
    text = RE_CITY_PREFIX.replace_all(&text, "").into_owned();
    text = text.replace('.', " ");
    // санкт-петербург → санкт петербург
    text = RE_HYPHEN.replace_all(&text, "$1 $2").into_owned();
    for (pattern, replacement) in ABBR.iter() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }
    text = RE_SPECIAL.replace_all(&text, " ").into_owned();
    RE_SPACES.replace_all(&text, " ").trim().to_string()
}
