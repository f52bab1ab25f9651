//! DID pool
//!
//! Maintains the set of outbound caller-id numbers, indexed by area code
//! and by state, and answers "pick a DID for this recipient". Selection
//! prefers an exact area-code match, then a same-state number, then plain
//! round-robin. Indices are immutable snapshots published behind a lock,
//! so reconfiguration never blocks in-flight selections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::SliceRandom;

use outdial_core::phone::{area_code, normalize_phone};

use crate::DialerError;

/// One outbound number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Did {
    /// E.164
    pub number: String,
    pub area_code: String,
    /// Two-letter state, when the area code is known
    pub state: Option<&'static str>,
}

/// How the selection matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DidMatch {
    AreaCode(String),
    State(&'static str),
    RoundRobin,
}

impl std::fmt::Display for DidMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DidMatch::AreaCode(code) => write!(f, "area_code:{}", code),
            DidMatch::State(state) => write!(f, "state:{}", state),
            DidMatch::RoundRobin => write!(f, "round_robin"),
        }
    }
}

/// How the pool picks numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Area-code match, then same-state, then round-robin
    #[default]
    GeographicAffinity,
    /// Ignore geography; plain rotation
    RoundRobinOnly,
}

/// Immutable index snapshot
struct DidIndex {
    all: Vec<Did>,
    by_area_code: HashMap<String, Vec<usize>>,
    by_state: HashMap<&'static str, Vec<usize>>,
    enabled: bool,
    strategy: SelectionStrategy,
}

impl DidIndex {
    fn build(numbers: &[String], enabled: bool, strategy: SelectionStrategy) -> Self {
        let mut all = Vec::with_capacity(numbers.len());
        let mut by_area_code: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_state: HashMap<&'static str, Vec<usize>> = HashMap::new();

        for raw in numbers {
            let number = normalize_phone(raw);
            let Some(code) = area_code(&number) else {
                tracing::warn!(number = %number, "Skipping DID without an area code");
                continue;
            };
            let state = state_for_area_code(&code);
            let idx = all.len();
            by_area_code.entry(code.clone()).or_default().push(idx);
            if let Some(state) = state {
                by_state.entry(state).or_default().push(idx);
            }
            all.push(Did {
                number,
                area_code: code,
                state,
            });
        }

        Self {
            all,
            by_area_code,
            by_state,
            enabled,
            strategy,
        }
    }
}

/// The pool
pub struct DidPool {
    index: RwLock<Arc<DidIndex>>,
    cursor: AtomicUsize,
}

impl DidPool {
    pub fn new(numbers: &[String]) -> Self {
        Self {
            index: RwLock::new(Arc::new(DidIndex::build(
                numbers,
                true,
                SelectionStrategy::default(),
            ))),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Atomically swap in a new number set, enabled flag and strategy.
    /// In-flight selections observe either the old or the new snapshot.
    pub fn configure(&self, numbers: &[String], enabled: bool, strategy: SelectionStrategy) {
        let snapshot = Arc::new(DidIndex::build(numbers, enabled, strategy));
        tracing::info!(
            count = snapshot.all.len(),
            enabled,
            ?strategy,
            "DID pool reconfigured"
        );
        *self.index.write() = snapshot;
    }

    pub fn len(&self) -> usize {
        self.index.read().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn numbers(&self) -> Vec<String> {
        self.index.read().all.iter().map(|d| d.number.clone()).collect()
    }

    /// Pick a DID for a recipient by geographic affinity.
    pub fn select(&self, recipient: &str) -> Result<(Did, DidMatch), DialerError> {
        let index = self.index.read().clone();
        if !index.enabled || index.all.is_empty() {
            return Err(DialerError::NoDids);
        }

        let recipient_code = area_code(recipient);

        if index.strategy == SelectionStrategy::GeographicAffinity {
            if let Some(code) = &recipient_code {
                if let Some(candidates) = index.by_area_code.get(code) {
                    let mut rng = rand::thread_rng();
                    if let Some(&idx) = candidates.choose(&mut rng) {
                        return Ok((index.all[idx].clone(), DidMatch::AreaCode(code.clone())));
                    }
                }
                if let Some(state) = state_for_area_code(code) {
                    if let Some(candidates) = index.by_state.get(state) {
                        let mut rng = rand::thread_rng();
                        if let Some(&idx) = candidates.choose(&mut rng) {
                            return Ok((index.all[idx].clone(), DidMatch::State(state)));
                        }
                    }
                }
            }
        }

        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);
        let did = index.all[cursor % index.all.len()].clone();
        Ok((did, DidMatch::RoundRobin))
    }
}

/// NANP area code to US state mapping (major codes).
pub fn state_for_area_code(code: &str) -> Option<&'static str> {
    let entry = AREA_CODE_STATES
        .binary_search_by_key(&code, |&(c, _)| c)
        .ok()?;
    Some(AREA_CODE_STATES[entry].1)
}

/// Sorted by area code for binary search
const AREA_CODE_STATES: &[(&str, &str)] = &[
    ("201", "NJ"), ("202", "DC"), ("203", "CT"), ("205", "AL"), ("206", "WA"),
    ("207", "ME"), ("208", "ID"), ("209", "CA"), ("210", "TX"), ("212", "NY"),
    ("213", "CA"), ("214", "TX"), ("215", "PA"), ("216", "OH"), ("217", "IL"),
    ("218", "MN"), ("219", "IN"), ("224", "IL"), ("225", "LA"), ("228", "MS"),
    ("229", "GA"), ("231", "MI"), ("234", "OH"), ("239", "FL"), ("240", "MD"),
    ("248", "MI"), ("251", "AL"), ("252", "NC"), ("253", "WA"), ("254", "TX"),
    ("256", "AL"), ("260", "IN"), ("262", "WI"), ("267", "PA"), ("269", "MI"),
    ("270", "KY"), ("272", "PA"), ("276", "VA"), ("281", "TX"), ("301", "MD"),
    ("302", "DE"), ("303", "CO"), ("304", "WV"), ("305", "FL"), ("307", "WY"),
    ("308", "NE"), ("309", "IL"), ("310", "CA"), ("312", "IL"), ("313", "MI"),
    ("314", "MO"), ("315", "NY"), ("316", "KS"), ("317", "IN"), ("318", "LA"),
    ("319", "IA"), ("320", "MN"), ("321", "FL"), ("323", "CA"), ("325", "TX"),
    ("330", "OH"), ("331", "IL"), ("334", "AL"), ("336", "NC"), ("337", "LA"),
    ("339", "MA"), ("346", "TX"), ("347", "NY"), ("351", "MA"), ("352", "FL"),
    ("360", "WA"), ("361", "TX"), ("385", "UT"), ("386", "FL"), ("401", "RI"),
    ("402", "NE"), ("404", "GA"), ("405", "OK"), ("406", "MT"), ("407", "FL"),
    ("408", "CA"), ("409", "TX"), ("410", "MD"), ("412", "PA"), ("413", "MA"),
    ("414", "WI"), ("415", "CA"), ("417", "MO"), ("419", "OH"), ("423", "TN"),
    ("424", "CA"), ("425", "WA"), ("430", "TX"), ("432", "TX"), ("434", "VA"),
    ("435", "UT"), ("440", "OH"), ("443", "MD"), ("458", "OR"), ("469", "TX"),
    ("470", "GA"), ("475", "CT"), ("478", "GA"), ("479", "AR"), ("480", "AZ"),
    ("484", "PA"), ("501", "AR"), ("502", "KY"), ("503", "OR"), ("504", "LA"),
    ("505", "NM"), ("507", "MN"), ("508", "MA"), ("509", "WA"), ("510", "CA"),
    ("512", "TX"), ("513", "OH"), ("515", "IA"), ("516", "NY"), ("517", "MI"),
    ("518", "NY"), ("520", "AZ"), ("530", "CA"), ("531", "NE"), ("534", "WI"),
    ("539", "OK"), ("540", "VA"), ("541", "OR"), ("551", "NJ"), ("559", "CA"),
    ("561", "FL"), ("562", "CA"), ("563", "IA"), ("567", "OH"), ("570", "PA"),
    ("571", "VA"), ("573", "MO"), ("574", "IN"), ("575", "NM"), ("580", "OK"),
    ("585", "NY"), ("586", "MI"), ("601", "MS"), ("602", "AZ"), ("603", "NH"),
    ("605", "SD"), ("606", "KY"), ("607", "NY"), ("608", "WI"), ("609", "NJ"),
    ("610", "PA"), ("612", "MN"), ("614", "OH"), ("615", "TN"), ("616", "MI"),
    ("617", "MA"), ("618", "IL"), ("619", "CA"), ("620", "KS"), ("623", "AZ"),
    ("626", "CA"), ("628", "CA"), ("629", "TN"), ("630", "IL"), ("631", "NY"),
    ("636", "MO"), ("641", "IA"), ("646", "NY"), ("650", "CA"), ("651", "MN"),
    ("657", "CA"), ("659", "AL"), ("660", "MO"), ("661", "CA"), ("662", "MS"),
    ("667", "MD"), ("669", "CA"), ("678", "GA"), ("681", "WV"), ("682", "TX"),
    ("701", "ND"), ("702", "NV"), ("703", "VA"), ("704", "NC"), ("706", "GA"),
    ("707", "CA"), ("708", "IL"), ("712", "IA"), ("713", "TX"), ("714", "CA"),
    ("715", "WI"), ("716", "NY"), ("717", "PA"), ("718", "NY"), ("719", "CO"),
    ("720", "CO"), ("724", "PA"), ("725", "NV"), ("727", "FL"), ("731", "TN"),
    ("732", "NJ"), ("734", "MI"), ("737", "TX"), ("740", "OH"), ("743", "NC"),
    ("747", "CA"), ("754", "FL"), ("757", "VA"), ("760", "CA"), ("762", "GA"),
    ("763", "MN"), ("765", "IN"), ("769", "MS"), ("770", "GA"), ("772", "FL"),
    ("773", "IL"), ("774", "MA"), ("775", "NV"), ("779", "IL"), ("781", "MA"),
    ("785", "KS"), ("786", "FL"), ("801", "UT"), ("802", "VT"), ("803", "SC"),
    ("804", "VA"), ("805", "CA"), ("806", "TX"), ("808", "HI"), ("810", "MI"),
    ("812", "IN"), ("813", "FL"), ("814", "PA"), ("815", "IL"), ("816", "MO"),
    ("817", "TX"), ("818", "CA"), ("828", "NC"), ("830", "TX"), ("831", "CA"),
    ("832", "TX"), ("843", "SC"), ("845", "NY"), ("847", "IL"), ("848", "NJ"),
    ("850", "FL"), ("856", "NJ"), ("857", "MA"), ("858", "CA"), ("859", "KY"),
    ("860", "CT"), ("862", "NJ"), ("863", "FL"), ("864", "SC"), ("865", "TN"),
    ("870", "AR"), ("872", "IL"), ("878", "PA"), ("901", "TN"), ("903", "TX"),
    ("904", "FL"), ("906", "MI"), ("907", "AK"), ("908", "NJ"), ("909", "CA"),
    ("910", "NC"), ("912", "GA"), ("913", "KS"), ("914", "NY"), ("915", "TX"),
    ("916", "CA"), ("917", "NY"), ("918", "OK"), ("919", "NC"), ("920", "WI"),
    ("925", "CA"), ("928", "AZ"), ("929", "NY"), ("930", "IN"), ("931", "TN"),
    ("936", "TX"), ("937", "OH"), ("938", "AL"), ("940", "TX"), ("941", "FL"),
    ("947", "MI"), ("949", "CA"), ("951", "CA"), ("952", "MN"), ("954", "FL"),
    ("956", "TX"), ("959", "CT"), ("970", "CO"), ("971", "OR"), ("972", "TX"),
    ("973", "NJ"), ("978", "MA"), ("979", "TX"), ("980", "NC"), ("984", "NC"),
    ("985", "LA"), ("989", "MI"),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> DidPool {
        DidPool::new(&[
            "+15302220001".to_string(), // 530 = CA
            "+19165550002".to_string(), // 916 = CA
            "+16595550003".to_string(), // 659 = AL
            "+12125550004".to_string(), // 212 = NY
        ])
    }

    #[test]
    fn test_area_code_match_preferred() {
        let pool = pool();
        let (did, matched) = pool.select("+15307748286").unwrap();
        assert_eq!(did.number, "+15302220001");
        assert_eq!(matched, DidMatch::AreaCode("530".to_string()));
    }

    #[test]
    fn test_state_match_fallback() {
        let pool = pool();
        // 415 is CA but the pool has no 415 number: falls to a CA DID
        let (did, matched) = pool.select("+14155550000").unwrap();
        assert_eq!(matched, DidMatch::State("CA"));
        assert!(did.number == "+15302220001" || did.number == "+19165550002");
    }

    #[test]
    fn test_round_robin_fallback() {
        let pool = pool();
        // 808 is HI; no HI DIDs, so round-robin cycles the full list
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let (did, matched) = pool.select("+18085550000").unwrap();
            assert_eq!(matched, DidMatch::RoundRobin);
            seen.insert(did.number);
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_empty_pool_errors() {
        let pool = DidPool::new(&[]);
        assert!(matches!(pool.select("+15307748286"), Err(DialerError::NoDids)));
    }

    #[test]
    fn test_reconfigure_swaps_snapshot() {
        let pool = pool();
        pool.configure(
            &["+18085550009".to_string()],
            true,
            SelectionStrategy::GeographicAffinity,
        );
        assert_eq!(pool.len(), 1);
        let (did, matched) = pool.select("+18085551234").unwrap();
        assert_eq!(did.number, "+18085550009");
        assert_eq!(matched, DidMatch::AreaCode("808".to_string()));
    }

    #[test]
    fn test_disabled_pool_refuses_selection() {
        let pool = pool();
        pool.configure(
            &["+18085550009".to_string()],
            false,
            SelectionStrategy::GeographicAffinity,
        );
        assert!(matches!(pool.select("+18085551234"), Err(DialerError::NoDids)));
    }

    #[test]
    fn test_round_robin_only_strategy_ignores_geography() {
        let pool = pool();
        pool.configure(
            &["+15302220001".to_string(), "+19165550002".to_string()],
            true,
            SelectionStrategy::RoundRobinOnly,
        );
        // Recipient area code matches a pool DID, but the strategy says
        // rotate anyway
        let (_, matched) = pool.select("+15307748286").unwrap();
        assert_eq!(matched, DidMatch::RoundRobin);
    }

    #[test]
    fn test_state_table_is_sorted() {
        let mut prev = "";
        for (code, _) in AREA_CODE_STATES {
            assert!(*code > prev, "table out of order at {}", code);
            prev = code;
        }
    }

    #[test]
    fn test_state_lookup() {
        assert_eq!(state_for_area_code("530"), Some("CA"));
        assert_eq!(state_for_area_code("659"), Some("AL"));
        assert_eq!(state_for_area_code("000"), None);
    }
}
