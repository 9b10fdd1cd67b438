use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tracing::debug;

use crate::normalize::normalize;

/// City bit masks.
pub const MOSCOW: u8 = 1;
pub const SPB: u8 = 2;

/// Cache capacity, keyed by normalized text.
const CACHE_SIZE: usize = 15_000;

/// Which dictionary tier produced the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Explicit,
    Metro,
    Street,
    None,
}

impl Tier {
    fn as_str(self) -> &'static str {
        match self {
            Tier::Explicit => "explicit",
            Tier::Metro => "metro",
            Tier::Street => "street",
            Tier::None => "none",
        }
    }
}

/// Tiered dictionary geo filter with an LRU cache.
///
/// Dictionaries are compiled into the binary; every entry and every probed
/// text go through the same [`normalize`] pass, so lookup is an exact
/// token-n-gram match.
pub struct GeoFilter {
    aliases: HashMap<String, u8>,
    metros: HashMap<String, u8>,
    streets: HashMap<String, u8>,
    max_alias_n: usize,
    max_metro_n: usize,
    max_street_n: usize,
    cache: Mutex<LruCache<String, (u8, Tier)>>,
}

impl GeoFilter {
    pub fn new() -> Self {
        let mut aliases = HashMap::new();
        let mut metros = HashMap::new();
        let mut streets = HashMap::new();

        load_dict(include_str!("../data/moscow_aliases.txt"), MOSCOW, &mut aliases);
        load_dict(include_str!("../data/spb_aliases.txt"), SPB, &mut aliases);
        load_dict(include_str!("../data/metro_moscow.txt"), MOSCOW, &mut metros);
        load_dict(include_str!("../data/metro_spb.txt"), SPB, &mut metros);
        load_dict(include_str!("../data/streets_moscow.txt"), MOSCOW, &mut streets);
        load_dict(include_str!("../data/streets_spb.txt"), SPB, &mut streets);

        let max_alias_n = max_key_len(&aliases);
        let max_metro_n = max_key_len(&metros);
        let max_street_n = max_key_len(&streets);

        tracing::info!(
            aliases = aliases.len(),
            metros = metros.len(),
            streets = streets.len(),
            "geo dictionaries loaded"
        );

        Self {
            aliases,
            metros,
            streets,
            max_alias_n,
            max_metro_n,
            max_street_n,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_SIZE).expect("cache size is non-zero"),
            )),
        }
    }

    /// Take the message in Moscow mode? Rejects only an unambiguous SPb signal.
    pub fn should_take_for_moscow(&self, text: &str) -> bool {
        let (mask, tier) = self.mask_for(text);
        if mask == SPB {
            debug!(tier = tier.as_str(), "geo: excluded spb signal");
            return false;
        }
        true
    }

    /// Take the message in SPb mode? Rejects only an unambiguous Moscow signal.
    pub fn should_take_for_spb(&self, text: &str) -> bool {
        let (mask, tier) = self.mask_for(text);
        if mask == MOSCOW {
            debug!(tier = tier.as_str(), "geo: excluded moscow signal");
            return false;
        }
        true
    }

    /// Resolve `(mask, tier)` for a text, consulting the LRU cache first.
    fn mask_for(&self, text: &str) -> (u8, Tier) {
        let norm = normalize(text);
        let mut cache = self.cache.lock().unwrap();
        if let Some(hit) = cache.get(&norm) {
            return *hit;
        }
        let result = self.detect(&norm);
        cache.put(norm, result);
        result
    }

    /// Tiered detection over a normalized text.
    ///
    /// 1. explicit aliases: any hit returns immediately, even a collision;
    /// 2. metro: a single-city mask returns, a collision falls through;
    /// 3. streets: a single-city mask returns, a collision is no signal.
    fn detect(&self, normalized: &str) -> (u8, Tier) {
        let tokens: Vec<&str> = normalized.split_whitespace().collect();
        if tokens.is_empty() {
            return (0, Tier::None);
        }

        let alias_mask = scan(&tokens, &self.aliases, self.max_alias_n);
        if alias_mask != 0 {
            return (alias_mask, Tier::Explicit);
        }

        let metro_mask = scan(&tokens, &self.metros, self.max_metro_n);
        if metro_mask == MOSCOW || metro_mask == SPB {
            return (metro_mask, Tier::Metro);
        }
        if metro_mask == MOSCOW | SPB {
            debug!("geo: metro collision, falling through to streets");
        }

        let street_mask = scan(&tokens, &self.streets, self.max_street_n);
        if street_mask == MOSCOW || street_mask == SPB {
            return (street_mask, Tier::Street);
        }
        if street_mask == MOSCOW | SPB {
            debug!("geo: street collision, no signal");
        }

        (0, Tier::None)
    }
}

impl Default for GeoFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Load one word-list: skip blanks and `#` comments, normalize each entry,
/// OR the city bit into the existing mask.
fn load_dict(raw: &str, city_mask: u8, target: &mut HashMap<String, u8>) {
    for line in raw.lines() {
        let entry = line.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        let key = normalize(entry);
        if key.is_empty() {
            continue;
        }
        *target.entry(key).or_insert(0) |= city_mask;
    }
}

fn max_key_len(dict: &HashMap<String, u8>) -> usize {
    dict.keys()
        .map(|k| k.split(' ').count())
        .max()
        .unwrap_or(1)
}

/// Scan token n-grams of length 1..=max_n against a dictionary.
///
/// Accumulates the bit mask; exits early once both cities are seen.
fn scan(tokens: &[&str], lookup: &HashMap<String, u8>, max_n: usize) -> u8 {
    let n = tokens.len();
    let mut mask = 0u8;
    for size in 1..=max_n.min(n) {
        for window in tokens.windows(size) {
            if let Some(hit) = lookup.get(&window.join(" ")) {
                mask |= hit;
                if mask == MOSCOW | SPB {
                    return mask;
                }
            }
        }
    }
    mask
}
