use tracing::debug;

use pvzwatch_core::types::TaskFilters;

use crate::extractor::Extracted;

/// The шк filter value that accepts any posting.
const SHK_ANY: &str = "любое";

/// Per-task business filter over extracted fields: work-date window, price
/// window and the barcode-tag predicate.
#[derive(Debug, Clone)]
pub struct ItemFilter {
    filters: TaskFilters,
}

impl ItemFilter {
    pub fn new(filters: TaskFilters) -> Self {
        Self { filters }
    }

    pub fn matches(&self, extracted: &Extracted) -> bool {
        if extracted.date < self.filters.date_from || extracted.date > self.filters.date_to {
            debug!(date = %extracted.date, "work date outside the task window");
            return false;
        }

        let Some(price) = extracted.price else {
            debug!("no price extracted");
            return false;
        };
        if price < self.filters.min_price || price > self.filters.max_price {
            debug!(price, "price outside the task window");
            return false;
        }

        if self.filters.shk_filter.to_lowercase() != SHK_ANY {
            let Some(shk) = extracted.shk.as_deref() else {
                debug!(wanted = %self.filters.shk_filter, "шк required but absent");
                return false;
            };
            if shk.to_lowercase() != self.filters.shk_filter.to_lowercase() {
                debug!(got = shk, wanted = %self.filters.shk_filter, "шк mismatch");
                return false;
            }
        }

        true
    }
}
