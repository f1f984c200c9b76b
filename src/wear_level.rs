//! Static wear leveling. Dynamic leveling (always committing into the least-erased empty
//! slot) spreads wear across the slots a hot page cycles through, but pages that are
//! never rewritten pin their slots forever. This module watches the erase traffic and,
//! once the erase-to-distinct-rewrite ratio crosses the configured threshold, forces a
//! pure relocation of the least recently rewritten page so idle slots rejoin the rotation.

use crate::config::PageType;
use crate::internal::WriteSet;
use crate::platform::Platform;
use crate::raw;
use crate::Nvm;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

/// In-RAM leveling history, reset at init and whenever every page has been rewritten once
/// within a cycle. Indexed by page-table position, not page id.
pub(crate) struct StaticWear {
    history: [u8; raw::MAX_SLOTS / 8],
    /// Distinct pages marked in `history`.
    rewrites: u16,
    erases: u16,
    /// Re-entrancy guard: the forced commits below land back in this module through their
    /// own erase notifications.
    pub(crate) working: bool,
}

impl StaticWear {
    pub(crate) fn new() -> Self {
        Self {
            history: [0; raw::MAX_SLOTS / 8],
            rewrites: 0,
            erases: 0,
            working: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.history = [0; raw::MAX_SLOTS / 8];
        self.rewrites = 0;
        self.erases = 0;
    }

    fn is_marked(&self, index: usize) -> bool {
        self.history[index / 8] & (1 << (index % 8)) != 0
    }

    /// Mark a page as rewritten; counts it only the first time within a cycle.
    fn mark(&mut self, index: usize) {
        if !self.is_marked(index) {
            self.history[index / 8] |= 1 << (index % 8);
            self.rewrites += 1;
        }
    }
}

impl<'a, T: Platform> Nvm<'a, T> {
    /// Called by `erase_slot` for every non-empty slot it retires. Records the vacated
    /// page and runs the leveling policy.
    pub(crate) fn note_page_erase(&mut self, page_id: u16) {
        let Some((index, _)) = self.config.page(page_id) else {
            // A slot from a page no longer in the table; nothing to balance.
            return;
        };
        self.leveler.mark(index);
        self.leveler.erases = self.leveler.erases.saturating_add(1);
        self.static_wear_check();
    }

    fn static_wear_check(&mut self) {
        if self.leveler.working {
            return;
        }
        self.leveler.working = true;

        loop {
            let rewrites = self.leveler.rewrites;
            if rewrites == 0 || self.leveler.erases / rewrites <= self.config.static_wear_threshold {
                break;
            }

            if usize::from(rewrites) >= self.config.pages.len() {
                // Every page took its turn this cycle; start counting afresh.
                #[cfg(feature = "defmt")]
                trace!("static wear: cycle complete, resetting history");
                self.leveler.reset();
                break;
            }

            let Some(index) = (0..self.config.pages.len()).find(|&i| !self.leveler.is_marked(i))
            else {
                break;
            };
            let page = self.config.pages[index];

            // Wear pages self-balance through in-slot appends, and a page that was never
            // committed holds no slot to free up; both just get marked.
            let relocatable = page.page_type == PageType::Normal
                && matches!(self.find_slot(page.page_id), Ok(Some(_)));
            if !relocatable {
                self.leveler.mark(index);
                continue;
            }

            // Forced relocation, all data copied verbatim. Its erase notification marks
            // the page for us. Failures are logged and swallowed: this runs inside some
            // other commit's erase path, which must not be failed retroactively.
            if self.commit(page.page_id, WriteSet::Relocate).is_err() {
                #[cfg(feature = "defmt")]
                warn!("static wear: forced relocation of page {} failed", page.page_id);
                break;
            }
        }

        self.leveler.working = false;
    }
}
